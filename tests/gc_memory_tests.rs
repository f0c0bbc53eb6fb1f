//! Fast, hermetic garbage-collection tests over the in-memory backend.
//!
//! These mirror the Postgres integration tests in
//! `gc_postgres_integration.rs` without needing Docker, and additionally
//! cover behaviour that needs injected adapters: the selection-vs-deletion
//! race, bulkhead isolation, and cancellation.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration as StdDuration;

use async_trait::async_trait;
use chrono::{DateTime, Duration, Utc};
use tokio_util::sync::CancellationToken;
use uuid::Uuid;

use metacat_gc::testing::MemoryAdapter;
use metacat_gc::{
    Adapter, DeleteExpiredObjects, DeleteZombieObjects, DeletedCounts, Error, GarbageCollector,
    ObjectCursor, ObjectStatus, ObjectStream,
};

fn object(n: u128, key: &str) -> ObjectStream {
    ObjectStream {
        project_id: Uuid::from_u128(7),
        bucket_name: "bucket".to_string(),
        object_key: key.to_string(),
        version: 1,
        stream_id: Uuid::from_u128(n),
    }
}

fn expired_opts(expired_before: DateTime<Utc>, batch_size: usize) -> DeleteExpiredObjects {
    DeleteExpiredObjects {
        expired_before,
        staleness_bound: StdDuration::ZERO,
        batch_size,
    }
}

fn zombie_opts(deadline_before: DateTime<Utc>, inactive_deadline: DateTime<Utc>) -> DeleteZombieObjects {
    DeleteZombieObjects {
        deadline_before,
        inactive_deadline,
        staleness_bound: StdDuration::ZERO,
        batch_size: 10,
    }
}

/// Delegating backend that records how many candidates each selection page
/// returned.
struct CountingAdapter {
    inner: Arc<MemoryAdapter>,
    pages: Mutex<Vec<usize>>,
}

#[async_trait]
impl Adapter for CountingAdapter {
    fn name(&self) -> &'static str {
        "counting"
    }

    async fn find_expired_objects(
        &self,
        opts: &DeleteExpiredObjects,
        start_after: &ObjectCursor,
        batch_size: usize,
    ) -> Result<Vec<ObjectStream>, Error> {
        let page = self
            .inner
            .find_expired_objects(opts, start_after, batch_size)
            .await?;
        self.pages.lock().unwrap().push(page.len());
        Ok(page)
    }

    async fn find_zombie_objects(
        &self,
        opts: &DeleteZombieObjects,
        start_after: &ObjectCursor,
        batch_size: usize,
    ) -> Result<Vec<ObjectStream>, Error> {
        self.inner
            .find_zombie_objects(opts, start_after, batch_size)
            .await
    }

    async fn delete_objects_and_segments(
        &self,
        objects: &[ObjectStream],
    ) -> Result<DeletedCounts, Error> {
        self.inner.delete_objects_and_segments(objects).await
    }

    async fn delete_inactive_objects_and_segments(
        &self,
        objects: &[ObjectStream],
        inactive_deadline: DateTime<Utc>,
    ) -> Result<DeletedCounts, Error> {
        self.inner
            .delete_inactive_objects_and_segments(objects, inactive_deadline)
            .await
    }
}

#[tokio::test]
async fn expired_sweep_pages_through_candidates_and_spares_live_objects() {
    let now = Utc::now();
    let memory = Arc::new(MemoryAdapter::new());

    for (n, key) in [(1, "a"), (2, "b"), (3, "c")] {
        let obj = object(n, key);
        memory.insert_object(&obj, ObjectStatus::Committed, Some(now - Duration::hours(1)), None);
        memory.insert_segment(obj.stream_id, now - Duration::hours(2));
        memory.insert_segment(obj.stream_id, now - Duration::hours(2));
    }
    for (n, key) in [(4, "d"), (5, "e")] {
        let obj = object(n, key);
        memory.insert_object(&obj, ObjectStatus::Committed, Some(now + Duration::hours(1)), None);
        memory.insert_segment(obj.stream_id, now - Duration::hours(2));
    }

    let counting = Arc::new(CountingAdapter {
        inner: Arc::clone(&memory),
        pages: Mutex::new(Vec::new()),
    });
    let gc = GarbageCollector::new(vec![counting.clone() as Arc<dyn Adapter>]);

    let cancel = CancellationToken::new();
    gc.delete_expired_objects(&cancel, expired_opts(now, 2))
        .await
        .expect("sweep");

    // Two full pages, one final empty page.
    assert_eq!(*counting.pages.lock().unwrap(), vec![2, 1, 0]);

    assert_eq!(memory.object_count(), 2);
    assert_eq!(memory.segment_count(), 2);
    assert!(memory.contains_object(&object(4, "d")));
    assert!(memory.contains_object(&object(5, "e")));

    let snapshot = gc.metrics().snapshot();
    assert_eq!(snapshot.objects_deleted, 3);
    assert_eq!(snapshot.segments_deleted, 6);
    assert_eq!(snapshot.zombie_objects_deleted, 0);
}

#[tokio::test]
async fn zombie_sweep_treats_null_deadline_as_eligible() {
    let now = Utc::now();
    let memory = Arc::new(MemoryAdapter::new());

    // Pending, no deadline column value: eligible for backward compat.
    let legacy = object(1, "legacy");
    memory.insert_object(&legacy, ObjectStatus::Pending, None, None);

    // Committed objects are never zombies, past deadline or not.
    let committed = object(2, "committed");
    memory.insert_object(
        &committed,
        ObjectStatus::Committed,
        None,
        Some(now - Duration::hours(1)),
    );

    let gc = GarbageCollector::new(vec![memory.clone() as Arc<dyn Adapter>]);
    let cancel = CancellationToken::new();
    gc.delete_zombie_objects(&cancel, zombie_opts(now, now - Duration::hours(1)))
        .await
        .expect("sweep");

    assert!(!memory.contains_object(&legacy));
    assert!(memory.contains_object(&committed));

    let snapshot = gc.metrics().snapshot();
    assert_eq!(snapshot.zombie_objects_deleted, 1);
    assert_eq!(snapshot.objects_deleted, 1);
}

#[tokio::test]
async fn zombie_sweep_deletes_inactive_pending_object_with_segments() {
    let now = Utc::now();
    let memory = Arc::new(MemoryAdapter::new());

    let stale = object(1, "stale");
    memory.insert_object(
        &stale,
        ObjectStatus::Pending,
        None,
        Some(now - Duration::hours(2)),
    );
    memory.insert_segment(stale.stream_id, now - Duration::hours(3));
    memory.insert_segment(stale.stream_id, now - Duration::hours(3));

    let gc = GarbageCollector::new(vec![memory.clone() as Arc<dyn Adapter>]);
    let cancel = CancellationToken::new();
    gc.delete_zombie_objects(&cancel, zombie_opts(now, now - Duration::hours(1)))
        .await
        .expect("sweep");

    assert_eq!(memory.object_count(), 0);
    assert_eq!(memory.segment_count(), 0);

    let snapshot = gc.metrics().snapshot();
    assert_eq!(snapshot.zombie_objects_deleted, 1);
    assert_eq!(snapshot.zombie_segments_deleted, 2);
}

/// Delegating backend that simulates a client resuming the upload between
/// candidate selection and deletion.
struct ResumedUploadAdapter {
    inner: Arc<MemoryAdapter>,
    resumed_stream: Uuid,
    resumed_at: DateTime<Utc>,
    resumed: AtomicBool,
}

#[async_trait]
impl Adapter for ResumedUploadAdapter {
    fn name(&self) -> &'static str {
        "resumed-upload"
    }

    async fn find_expired_objects(
        &self,
        opts: &DeleteExpiredObjects,
        start_after: &ObjectCursor,
        batch_size: usize,
    ) -> Result<Vec<ObjectStream>, Error> {
        self.inner
            .find_expired_objects(opts, start_after, batch_size)
            .await
    }

    async fn find_zombie_objects(
        &self,
        opts: &DeleteZombieObjects,
        start_after: &ObjectCursor,
        batch_size: usize,
    ) -> Result<Vec<ObjectStream>, Error> {
        self.inner
            .find_zombie_objects(opts, start_after, batch_size)
            .await
    }

    async fn delete_objects_and_segments(
        &self,
        objects: &[ObjectStream],
    ) -> Result<DeletedCounts, Error> {
        self.inner.delete_objects_and_segments(objects).await
    }

    async fn delete_inactive_objects_and_segments(
        &self,
        objects: &[ObjectStream],
        inactive_deadline: DateTime<Utc>,
    ) -> Result<DeletedCounts, Error> {
        // The candidate list already contains this object; the new segment
        // lands after selection but before the delete executes.
        if !self.resumed.swap(true, Ordering::SeqCst) {
            self.inner
                .insert_segment(self.resumed_stream, self.resumed_at);
        }
        self.inner
            .delete_inactive_objects_and_segments(objects, inactive_deadline)
            .await
    }
}

#[tokio::test]
async fn zombie_sweep_spares_object_resumed_after_selection() {
    let now = Utc::now();
    let memory = Arc::new(MemoryAdapter::new());

    let resumed = object(1, "resumed");
    memory.insert_object(
        &resumed,
        ObjectStatus::Pending,
        None,
        Some(now - Duration::hours(2)),
    );
    memory.insert_segment(resumed.stream_id, now - Duration::hours(3));

    let abandoned = object(2, "abandoned");
    memory.insert_object(
        &abandoned,
        ObjectStatus::Pending,
        None,
        Some(now - Duration::hours(2)),
    );
    memory.insert_segment(abandoned.stream_id, now - Duration::hours(3));

    let racing = Arc::new(ResumedUploadAdapter {
        inner: Arc::clone(&memory),
        resumed_stream: resumed.stream_id,
        resumed_at: now,
        resumed: AtomicBool::new(false),
    });
    let gc = GarbageCollector::new(vec![racing as Arc<dyn Adapter>]);

    let cancel = CancellationToken::new();
    gc.delete_zombie_objects(&cancel, zombie_opts(now, now - Duration::hours(1)))
        .await
        .expect("sweep");

    // The resumed upload survived with both of its segments.
    assert!(memory.contains_object(&resumed));
    assert_eq!(memory.segment_count(), 2);
    assert!(!memory.contains_object(&abandoned));

    let snapshot = gc.metrics().snapshot();
    assert_eq!(snapshot.zombie_objects_deleted, 1);
    assert_eq!(snapshot.zombie_segments_deleted, 1);
}

#[tokio::test]
async fn deleting_an_empty_candidate_set_is_a_noop() {
    let memory = MemoryAdapter::new();
    let counts = memory.delete_objects_and_segments(&[]).await.expect("noop");
    assert_eq!(counts, DeletedCounts::default());
}

#[tokio::test]
async fn deleting_already_deleted_candidates_returns_zero_counts() {
    let now = Utc::now();
    let memory = MemoryAdapter::new();

    let obj = object(1, "a");
    memory.insert_object(&obj, ObjectStatus::Committed, Some(now - Duration::hours(1)), None);
    memory.insert_segment(obj.stream_id, now - Duration::hours(2));

    let candidates = vec![obj];
    let first = memory
        .delete_objects_and_segments(&candidates)
        .await
        .expect("first delete");
    assert_eq!(
        first,
        DeletedCounts {
            objects: 1,
            segments: 1
        }
    );

    let second = memory
        .delete_objects_and_segments(&candidates)
        .await
        .expect("second delete");
    assert_eq!(second, DeletedCounts::default());
}

#[tokio::test]
async fn replaced_object_under_new_stream_is_never_touched() {
    let now = Utc::now();
    let memory = MemoryAdapter::new();

    let original = object(1, "a");
    // Same location, new upload attempt.
    let mut replacement = original.clone();
    replacement.stream_id = Uuid::from_u128(99);
    memory.insert_object(
        &replacement,
        ObjectStatus::Committed,
        Some(now + Duration::hours(1)),
        None,
    );

    let counts = memory
        .delete_objects_and_segments(std::slice::from_ref(&original))
        .await
        .expect("delete");
    assert_eq!(counts.objects, 0);
    assert!(memory.contains_object(&replacement));
}

/// Backend whose selection always fails, for bulkhead tests.
struct BrokenAdapter;

#[async_trait]
impl Adapter for BrokenAdapter {
    fn name(&self) -> &'static str {
        "broken"
    }

    async fn find_expired_objects(
        &self,
        _opts: &DeleteExpiredObjects,
        _start_after: &ObjectCursor,
        _batch_size: usize,
    ) -> Result<Vec<ObjectStream>, Error> {
        Err(Error::Selection(sqlx::Error::PoolClosed))
    }

    async fn find_zombie_objects(
        &self,
        _opts: &DeleteZombieObjects,
        _start_after: &ObjectCursor,
        _batch_size: usize,
    ) -> Result<Vec<ObjectStream>, Error> {
        Err(Error::Selection(sqlx::Error::PoolClosed))
    }

    async fn delete_objects_and_segments(
        &self,
        _objects: &[ObjectStream],
    ) -> Result<DeletedCounts, Error> {
        Err(Error::Deletion(sqlx::Error::PoolClosed))
    }

    async fn delete_inactive_objects_and_segments(
        &self,
        _objects: &[ObjectStream],
        _inactive_deadline: DateTime<Utc>,
    ) -> Result<DeletedCounts, Error> {
        Err(Error::Deletion(sqlx::Error::PoolClosed))
    }
}

#[tokio::test]
async fn failing_adapter_does_not_block_the_next_one() {
    let now = Utc::now();
    let memory = Arc::new(MemoryAdapter::new());
    let obj = object(1, "a");
    memory.insert_object(&obj, ObjectStatus::Committed, Some(now - Duration::hours(1)), None);

    let gc = GarbageCollector::new(vec![
        Arc::new(BrokenAdapter) as Arc<dyn Adapter>,
        memory.clone() as Arc<dyn Adapter>,
    ]);
    let cancel = CancellationToken::new();
    gc.delete_expired_objects(&cancel, expired_opts(now, 10))
        .await
        .expect("sweep continues past the broken adapter");

    assert_eq!(memory.object_count(), 0);
    assert_eq!(gc.metrics().snapshot().objects_deleted, 1);
}

/// Backend that deletes the first candidate of each batch and then fails the
/// rest, reporting the partial progress the way the SQL backends do.
struct PartialFailureAdapter {
    inner: Arc<MemoryAdapter>,
}

impl PartialFailureAdapter {
    fn partial(counts: DeletedCounts, total: usize) -> Error {
        Error::PartialBatch {
            counts,
            total,
            errors: vec![sqlx::Error::PoolClosed],
        }
    }
}

#[async_trait]
impl Adapter for PartialFailureAdapter {
    fn name(&self) -> &'static str {
        "partial-failure"
    }

    async fn find_expired_objects(
        &self,
        opts: &DeleteExpiredObjects,
        start_after: &ObjectCursor,
        batch_size: usize,
    ) -> Result<Vec<ObjectStream>, Error> {
        self.inner
            .find_expired_objects(opts, start_after, batch_size)
            .await
    }

    async fn find_zombie_objects(
        &self,
        opts: &DeleteZombieObjects,
        start_after: &ObjectCursor,
        batch_size: usize,
    ) -> Result<Vec<ObjectStream>, Error> {
        self.inner
            .find_zombie_objects(opts, start_after, batch_size)
            .await
    }

    async fn delete_objects_and_segments(
        &self,
        objects: &[ObjectStream],
    ) -> Result<DeletedCounts, Error> {
        let counts = self.inner.delete_objects_and_segments(&objects[..1]).await?;
        Err(Self::partial(counts, objects.len()))
    }

    async fn delete_inactive_objects_and_segments(
        &self,
        objects: &[ObjectStream],
        inactive_deadline: DateTime<Utc>,
    ) -> Result<DeletedCounts, Error> {
        let counts = self
            .inner
            .delete_inactive_objects_and_segments(&objects[..1], inactive_deadline)
            .await?;
        Err(Self::partial(counts, objects.len()))
    }
}

#[tokio::test]
async fn expired_sweep_records_deletes_from_a_partially_failed_batch() {
    let now = Utc::now();
    let memory = Arc::new(MemoryAdapter::new());

    for (n, key) in [(1, "a"), (2, "b")] {
        let obj = object(n, key);
        memory.insert_object(&obj, ObjectStatus::Committed, Some(now - Duration::hours(1)), None);
        memory.insert_segment(obj.stream_id, now - Duration::hours(2));
    }

    let flaky = Arc::new(PartialFailureAdapter {
        inner: Arc::clone(&memory),
    });
    let gc = GarbageCollector::new(vec![flaky as Arc<dyn Adapter>]);

    let cancel = CancellationToken::new();
    gc.delete_expired_objects(&cancel, expired_opts(now, 10))
        .await
        .expect("sweep isolates the failed batch");

    // Only the first candidate was deleted before the batch failed.
    assert_eq!(memory.object_count(), 1);
    assert!(memory.contains_object(&object(2, "b")));

    let snapshot = gc.metrics().snapshot();
    assert_eq!(snapshot.objects_deleted, 1);
    assert_eq!(snapshot.segments_deleted, 1);
    assert_eq!(snapshot.zombie_objects_deleted, 0);
}

#[tokio::test]
async fn zombie_sweep_records_deletes_from_a_partially_failed_batch() {
    let now = Utc::now();
    let memory = Arc::new(MemoryAdapter::new());

    for (n, key) in [(1, "a"), (2, "b")] {
        let obj = object(n, key);
        memory.insert_object(&obj, ObjectStatus::Pending, None, Some(now - Duration::hours(2)));
        memory.insert_segment(obj.stream_id, now - Duration::hours(3));
    }

    let flaky = Arc::new(PartialFailureAdapter {
        inner: Arc::clone(&memory),
    });
    let gc = GarbageCollector::new(vec![flaky as Arc<dyn Adapter>]);

    let cancel = CancellationToken::new();
    gc.delete_zombie_objects(&cancel, zombie_opts(now, now - Duration::hours(1)))
        .await
        .expect("sweep isolates the failed batch");

    assert_eq!(memory.object_count(), 1);

    // Partial progress lands in the zombie counters and is double-marked
    // into the general ones.
    let snapshot = gc.metrics().snapshot();
    assert_eq!(snapshot.zombie_objects_deleted, 1);
    assert_eq!(snapshot.zombie_segments_deleted, 1);
    assert_eq!(snapshot.objects_deleted, 1);
    assert_eq!(snapshot.segments_deleted, 1);
}

#[tokio::test]
async fn cancelled_sweep_deletes_nothing() {
    let now = Utc::now();
    let memory = Arc::new(MemoryAdapter::new());
    let obj = object(1, "a");
    memory.insert_object(&obj, ObjectStatus::Committed, Some(now - Duration::hours(1)), None);

    let gc = GarbageCollector::new(vec![memory.clone() as Arc<dyn Adapter>]);
    let cancel = CancellationToken::new();
    cancel.cancel();

    let result = gc.delete_expired_objects(&cancel, expired_opts(now, 10)).await;
    assert!(matches!(result, Err(Error::Cancelled)));
    assert_eq!(memory.object_count(), 1);
}
