//! Test utilities: an in-memory garbage-collection backend.
//!
//! `MemoryAdapter` implements the same [`Adapter`] contract as the SQL
//! backends over a `BTreeMap` keyed by [`ObjectCursor`], so pagination in
//! tests follows exactly the cursor order the SQL keyset predicates use.
//!
//! Available during tests or with the `testing` feature:
//!
//! ```toml
//! [dev-dependencies]
//! metacat-gc = { path = "...", features = ["testing"] }
//! ```

use std::collections::BTreeMap;
use std::ops::Bound;
use std::sync::Mutex;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use uuid::Uuid;

use crate::adapter::{Adapter, DeletedCounts};
use crate::error::Error;
use crate::gc::{DeleteExpiredObjects, DeleteZombieObjects};
use crate::objects::{ObjectCursor, ObjectStatus, ObjectStream};

/// Columns of an object row the garbage collector cares about.
#[derive(Debug, Clone)]
pub struct ObjectRecord {
    pub stream_id: Uuid,
    pub status: ObjectStatus,
    pub expires_at: Option<DateTime<Utc>>,
    pub zombie_deletion_deadline: Option<DateTime<Utc>>,
}

#[derive(Default)]
struct State {
    objects: BTreeMap<ObjectCursor, ObjectRecord>,
    /// `(stream_id, created_at)` pairs.
    segments: Vec<(Uuid, DateTime<Utc>)>,
}

/// In-memory backend. Counts are exact, including objects without segments.
#[derive(Default)]
pub struct MemoryAdapter {
    state: Mutex<State>,
}

impl MemoryAdapter {
    pub fn new() -> Self {
        Self::default()
    }

    /// Insert or replace an object row.
    pub fn insert_object(
        &self,
        object: &ObjectStream,
        status: ObjectStatus,
        expires_at: Option<DateTime<Utc>>,
        zombie_deletion_deadline: Option<DateTime<Utc>>,
    ) {
        let mut state = self.state.lock().expect("memory adapter poisoned");
        state.objects.insert(
            object.cursor(),
            ObjectRecord {
                stream_id: object.stream_id,
                status,
                expires_at,
                zombie_deletion_deadline,
            },
        );
    }

    pub fn insert_segment(&self, stream_id: Uuid, created_at: DateTime<Utc>) {
        let mut state = self.state.lock().expect("memory adapter poisoned");
        state.segments.push((stream_id, created_at));
    }

    pub fn object_count(&self) -> usize {
        self.state
            .lock()
            .expect("memory adapter poisoned")
            .objects
            .len()
    }

    pub fn segment_count(&self) -> usize {
        self.state
            .lock()
            .expect("memory adapter poisoned")
            .segments
            .len()
    }

    /// Whether the exact upload attempt (full five-tuple) is still present.
    pub fn contains_object(&self, object: &ObjectStream) -> bool {
        self.state
            .lock()
            .expect("memory adapter poisoned")
            .objects
            .get(&object.cursor())
            .is_some_and(|record| record.stream_id == object.stream_id)
    }
}

fn to_stream(cursor: &ObjectCursor, record: &ObjectRecord) -> ObjectStream {
    ObjectStream {
        project_id: cursor.project_id,
        bucket_name: cursor.bucket_name.clone(),
        object_key: cursor.object_key.clone(),
        version: cursor.version,
        stream_id: record.stream_id,
    }
}

#[async_trait]
impl Adapter for MemoryAdapter {
    fn name(&self) -> &'static str {
        "memory"
    }

    async fn find_expired_objects(
        &self,
        opts: &DeleteExpiredObjects,
        start_after: &ObjectCursor,
        batch_size: usize,
    ) -> Result<Vec<ObjectStream>, Error> {
        let state = self.state.lock().expect("memory adapter poisoned");
        Ok(state
            .objects
            .range((Bound::Excluded(start_after.clone()), Bound::Unbounded))
            .filter(|(_, record)| {
                record
                    .expires_at
                    .is_some_and(|expires_at| expires_at < opts.expired_before)
            })
            .take(batch_size)
            .map(|(cursor, record)| to_stream(cursor, record))
            .collect())
    }

    async fn find_zombie_objects(
        &self,
        opts: &DeleteZombieObjects,
        start_after: &ObjectCursor,
        batch_size: usize,
    ) -> Result<Vec<ObjectStream>, Error> {
        let state = self.state.lock().expect("memory adapter poisoned");
        Ok(state
            .objects
            .range((Bound::Excluded(start_after.clone()), Bound::Unbounded))
            .filter(|(_, record)| {
                record.status == ObjectStatus::Pending
                    && record
                        .zombie_deletion_deadline
                        .is_none_or(|deadline| deadline < opts.deadline_before)
            })
            .take(batch_size)
            .map(|(cursor, record)| to_stream(cursor, record))
            .collect())
    }

    async fn delete_objects_and_segments(
        &self,
        objects: &[ObjectStream],
    ) -> Result<DeletedCounts, Error> {
        let mut state = self.state.lock().expect("memory adapter poisoned");
        let mut counts = DeletedCounts::default();
        for object in objects {
            let cursor = object.cursor();
            let matches = state
                .objects
                .get(&cursor)
                .is_some_and(|record| record.stream_id == object.stream_id);
            if matches {
                state.objects.remove(&cursor);
                counts.objects += 1;
            }

            // Segments are keyed by stream, matching the SQL backends: they
            // are reclaimed even if the object row is already gone.
            let before = state.segments.len();
            state
                .segments
                .retain(|(stream_id, _)| *stream_id != object.stream_id);
            counts.segments += (before - state.segments.len()) as u64;
        }
        Ok(counts)
    }

    async fn delete_inactive_objects_and_segments(
        &self,
        objects: &[ObjectStream],
        inactive_deadline: DateTime<Utc>,
    ) -> Result<DeletedCounts, Error> {
        let mut state = self.state.lock().expect("memory adapter poisoned");
        let mut counts = DeletedCounts::default();
        for object in objects {
            // Liveness is re-checked against current state, not against
            // whatever snapshot produced the candidate list.
            let active = state
                .segments
                .iter()
                .any(|(stream_id, created_at)| {
                    *stream_id == object.stream_id && *created_at > inactive_deadline
                });
            if active {
                continue;
            }

            let cursor = object.cursor();
            let matches = state
                .objects
                .get(&cursor)
                .is_some_and(|record| record.stream_id == object.stream_id);
            if matches {
                state.objects.remove(&cursor);
                counts.objects += 1;

                let before = state.segments.len();
                state
                    .segments
                    .retain(|(stream_id, _)| *stream_id != object.stream_id);
                counts.segments += (before - state.segments.len()) as u64;
            }
        }
        Ok(counts)
    }
}
