//! The capability contract every garbage-collection backend implements.

use async_trait::async_trait;
use chrono::{DateTime, Utc};

use crate::error::Error;
use crate::gc::{DeleteExpiredObjects, DeleteZombieObjects};
use crate::objects::{ObjectCursor, ObjectStream};

/// Objects and segments removed by one delete operation.
///
/// Derived from rows-affected where the backend allows nothing better; see
/// the individual backends for which counts are exact and which are
/// approximations.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct DeletedCounts {
    pub objects: u64,
    pub segments: u64,
}

/// A storage backend the garbage collector can sweep.
///
/// Any backend that offers an ordered range scan with bounded staleness and
/// a batched-or-transactional conditional delete can implement this trait
/// and be configured alongside the built-in ones; the sweeps and the batch
/// driver never inspect the concrete type.
///
/// Selection is a non-locking, possibly stale read. The delete operations
/// are therefore the ones responsible for correctness: they key on the full
/// five-tuple so a concurrently replaced object under a new `stream_id` is
/// never touched, and the inactive variant re-validates segment activity at
/// the moment of deletion.
#[async_trait]
pub trait Adapter: Send + Sync {
    /// Identifies the backend in logs and error reports.
    fn name(&self) -> &'static str;

    /// Returns up to `batch_size` objects with `expires_at` before
    /// `opts.expired_before`, strictly after `start_after` in cursor order.
    async fn find_expired_objects(
        &self,
        opts: &DeleteExpiredObjects,
        start_after: &ObjectCursor,
        batch_size: usize,
    ) -> Result<Vec<ObjectStream>, Error>;

    /// Returns up to `batch_size` pending objects whose zombie deletion
    /// deadline is missing or before `opts.deadline_before`, strictly after
    /// `start_after` in cursor order.
    ///
    /// A missing deadline counts as already eligible: rows created before
    /// the deadline column existed carry NULL there.
    async fn find_zombie_objects(
        &self,
        opts: &DeleteZombieObjects,
        start_after: &ObjectCursor,
        batch_size: usize,
    ) -> Result<Vec<ObjectStream>, Error>;

    /// Unconditionally deletes each candidate's object row (matched by the
    /// full five-tuple) and all segments under its `stream_id`, as one
    /// batched or transactional operation. An empty candidate set is a
    /// no-op.
    async fn delete_objects_and_segments(
        &self,
        objects: &[ObjectStream],
    ) -> Result<DeletedCounts, Error>;

    /// Deletes each candidate only if no segment under its `stream_id` has
    /// `created_at` after `inactive_deadline` as of the delete's own read,
    /// then removes the segments of the objects actually deleted.
    async fn delete_inactive_objects_and_segments(
        &self,
        objects: &[ObjectStream],
        inactive_deadline: DateTime<Utc>,
    ) -> Result<DeletedCounts, Error>;
}
