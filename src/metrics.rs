//! Sweep counters, collected with atomics so adapters and sweeps can share
//! one handle without locking.

use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};

use crate::adapter::DeletedCounts;

/// Thread-safe counters for garbage-collection sweeps.
///
/// Cloning is cheap and all clones share the same counters.
#[derive(Debug, Clone, Default)]
pub struct GcMetrics {
    inner: Arc<MetricsInner>,
}

#[derive(Debug, Default)]
struct MetricsInner {
    objects_deleted: AtomicU64,
    segments_deleted: AtomicU64,
    zombie_objects_deleted: AtomicU64,
    zombie_segments_deleted: AtomicU64,
}

impl GcMetrics {
    pub fn new() -> Self {
        Self::default()
    }

    /// Record deletions from an expired-object page.
    pub fn record_deletes(&self, counts: DeletedCounts) {
        self.inner
            .objects_deleted
            .fetch_add(counts.objects, Ordering::Relaxed);
        self.inner
            .segments_deleted
            .fetch_add(counts.segments, Ordering::Relaxed);
    }

    /// Record deletions from a zombie-object page. Zombie deletions also
    /// count towards the general delete counters.
    pub fn record_zombie_deletes(&self, counts: DeletedCounts) {
        self.inner
            .zombie_objects_deleted
            .fetch_add(counts.objects, Ordering::Relaxed);
        self.inner
            .zombie_segments_deleted
            .fetch_add(counts.segments, Ordering::Relaxed);
        self.record_deletes(counts);
    }

    /// Current values of all counters.
    pub fn snapshot(&self) -> MetricsSnapshot {
        MetricsSnapshot {
            objects_deleted: self.inner.objects_deleted.load(Ordering::Relaxed),
            segments_deleted: self.inner.segments_deleted.load(Ordering::Relaxed),
            zombie_objects_deleted: self.inner.zombie_objects_deleted.load(Ordering::Relaxed),
            zombie_segments_deleted: self.inner.zombie_segments_deleted.load(Ordering::Relaxed),
        }
    }
}

/// Point-in-time view of the sweep counters.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct MetricsSnapshot {
    pub objects_deleted: u64,
    pub segments_deleted: u64,
    pub zombie_objects_deleted: u64,
    pub zombie_segments_deleted: u64,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn zombie_deletes_mark_both_counter_sets() {
        let metrics = GcMetrics::new();
        metrics.record_deletes(DeletedCounts {
            objects: 2,
            segments: 5,
        });
        metrics.record_zombie_deletes(DeletedCounts {
            objects: 1,
            segments: 3,
        });

        let snapshot = metrics.snapshot();
        assert_eq!(snapshot.objects_deleted, 3);
        assert_eq!(snapshot.segments_deleted, 8);
        assert_eq!(snapshot.zombie_objects_deleted, 1);
        assert_eq!(snapshot.zombie_segments_deleted, 3);
    }

    #[test]
    fn clones_share_counters() {
        let metrics = GcMetrics::new();
        let clone = metrics.clone();
        clone.record_deletes(DeletedCounts {
            objects: 1,
            segments: 1,
        });
        assert_eq!(metrics.snapshot().objects_deleted, 1);
    }
}
