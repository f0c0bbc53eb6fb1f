//! Sweep entry points and the backend-agnostic batch driver.

use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use futures::FutureExt;
use futures::future::BoxFuture;
use sqlx::PgPool;
use tokio_util::sync::CancellationToken;
use tracing::{error, warn};

use crate::adapter::Adapter;
use crate::cockroach::CockroachAdapter;
use crate::config::{AdapterKind, Configuration};
use crate::error::Error;
use crate::metrics::GcMetrics;
use crate::objects::{ObjectCursor, ObjectStream};
use crate::postgres::PostgresAdapter;

/// Upper bound on the number of candidates processed per page.
const DELETE_BATCH_SIZE_LIMIT: usize = 1000;

/// Parameters of one expired-object sweep. All timestamps come from the
/// caller; the sweep itself never reads the wall clock.
#[derive(Debug, Clone)]
pub struct DeleteExpiredObjects {
    /// Objects with `expires_at` strictly before this are reclaimed.
    pub expired_before: DateTime<Utc>,
    /// How stale the candidate selection is allowed to be, on backends that
    /// support bounded-staleness reads.
    pub staleness_bound: Duration,
    /// Requested page size, clamped to the allowed range at sweep start.
    pub batch_size: usize,
}

/// Parameters of one zombie-object sweep.
#[derive(Debug, Clone)]
pub struct DeleteZombieObjects {
    /// Pending objects whose zombie deletion deadline is NULL or strictly
    /// before this are candidates.
    pub deadline_before: DateTime<Utc>,
    /// A candidate survives if any of its segments was written after this
    /// instant, re-checked at the moment of deletion.
    pub inactive_deadline: DateTime<Utc>,
    /// How stale the candidate selection is allowed to be, on backends that
    /// support bounded-staleness reads.
    pub staleness_bound: Duration,
    /// Requested page size, clamped to the allowed range at sweep start.
    pub batch_size: usize,
}

/// Runs garbage-collection sweeps over the configured backends.
///
/// Each sweep visits the adapters one at a time; a failure on one adapter is
/// reported and does not stop reclamation on the others.
pub struct GarbageCollector {
    adapters: Vec<Arc<dyn Adapter>>,
    metrics: GcMetrics,
}

impl GarbageCollector {
    pub fn new(adapters: Vec<Arc<dyn Adapter>>) -> Self {
        Self {
            adapters,
            metrics: GcMetrics::new(),
        }
    }

    /// Connect one adapter per configured backend.
    pub async fn connect(config: &Configuration) -> Result<Self, Error> {
        let mut adapters: Vec<Arc<dyn Adapter>> = Vec::with_capacity(config.adapters.len());
        for backend in &config.adapters {
            let pool = PgPool::connect(&backend.dsn)
                .await
                .map_err(Error::Connection)?;
            adapters.push(match backend.kind {
                AdapterKind::Postgres => Arc::new(PostgresAdapter::new(pool)),
                AdapterKind::Cockroach => Arc::new(CockroachAdapter::new(pool)),
            });
        }
        Ok(Self::new(adapters))
    }

    /// Counters accumulated across all sweeps run by this collector.
    pub fn metrics(&self) -> &GcMetrics {
        &self.metrics
    }

    /// Deletes all objects that expired before `opts.expired_before`,
    /// together with their segments.
    ///
    /// Expiry cannot be reversed by new activity, so the deletes are
    /// unconditional. Returns `Err` only when cancelled; per-adapter sweep
    /// failures are logged and isolated.
    pub async fn delete_expired_objects(
        &self,
        cancel: &CancellationToken,
        opts: DeleteExpiredObjects,
    ) -> Result<(), Error> {
        for adapter in &self.adapters {
            let result = drive_batches(cancel, opts.batch_size, {
                let adapter = Arc::clone(adapter);
                let metrics = self.metrics.clone();
                let opts = opts.clone();
                let cancel = cancel.clone();
                move |cursor, batch_size| {
                    let adapter = Arc::clone(&adapter);
                    let metrics = metrics.clone();
                    let opts = opts.clone();
                    let cancel = cancel.clone();
                    async move {
                        let expired = adapter
                            .find_expired_objects(&opts, &cursor, batch_size)
                            .await?;
                        if expired.is_empty() {
                            return Ok(None);
                        }
                        if cancel.is_cancelled() {
                            return Err(Error::Cancelled);
                        }

                        let last = expired.last().cloned();
                        match adapter.delete_objects_and_segments(&expired).await {
                            Ok(counts) => {
                                metrics.record_deletes(counts);
                                Ok(last)
                            }
                            Err(err) => {
                                // Statements that succeeded before a later one
                                // failed still count.
                                if let Error::PartialBatch { counts, .. } = &err {
                                    metrics.record_deletes(*counts);
                                }
                                Err(err)
                            }
                        }
                    }
                    .boxed()
                }
            })
            .await;

            match result {
                Ok(()) => {}
                Err(Error::Cancelled) => return Err(Error::Cancelled),
                Err(err) => {
                    error!(
                        adapter = adapter.name(),
                        error = %err,
                        "failed to delete expired objects"
                    );
                }
            }
        }
        Ok(())
    }

    /// Deletes all pending objects whose zombie deletion deadline has
    /// passed and that have seen no segment writes since
    /// `opts.inactive_deadline`.
    ///
    /// The inactivity condition is re-validated by the backend at the moment
    /// of deletion, so an upload resumed after candidate selection survives.
    pub async fn delete_zombie_objects(
        &self,
        cancel: &CancellationToken,
        opts: DeleteZombieObjects,
    ) -> Result<(), Error> {
        for adapter in &self.adapters {
            let result = drive_batches(cancel, opts.batch_size, {
                let adapter = Arc::clone(adapter);
                let metrics = self.metrics.clone();
                let opts = opts.clone();
                let cancel = cancel.clone();
                move |cursor, batch_size| {
                    let adapter = Arc::clone(&adapter);
                    let metrics = metrics.clone();
                    let opts = opts.clone();
                    let cancel = cancel.clone();
                    async move {
                        let zombies = adapter
                            .find_zombie_objects(&opts, &cursor, batch_size)
                            .await?;
                        if zombies.is_empty() {
                            return Ok(None);
                        }
                        if cancel.is_cancelled() {
                            return Err(Error::Cancelled);
                        }

                        let last = zombies.last().cloned();
                        match adapter
                            .delete_inactive_objects_and_segments(&zombies, opts.inactive_deadline)
                            .await
                        {
                            Ok(counts) => {
                                metrics.record_zombie_deletes(counts);
                                Ok(last)
                            }
                            Err(err) => {
                                if let Error::PartialBatch { counts, .. } = &err {
                                    metrics.record_zombie_deletes(*counts);
                                }
                                Err(err)
                            }
                        }
                    }
                    .boxed()
                }
            })
            .await;

            match result {
                Ok(()) => {}
                Err(Error::Cancelled) => return Err(Error::Cancelled),
                Err(err) => {
                    warn!(
                        adapter = adapter.name(),
                        error = %err,
                        "failed to delete zombie objects"
                    );
                }
            }
        }
        Ok(())
    }
}

/// Repeatedly requests one page of work until the page function reports no
/// more candidates.
///
/// The page function receives the cursor (exclusive lower bound) and the
/// clamped batch size, and returns the last candidate it processed; the next
/// page starts strictly after it. Pages are issued strictly sequentially, so
/// within one sweep they are ordered and non-overlapping. The first error
/// aborts the sweep. Cancellation is observed between pages.
async fn drive_batches<F>(
    cancel: &CancellationToken,
    batch_size: usize,
    mut delete_page: F,
) -> Result<(), Error>
where
    F: FnMut(ObjectCursor, usize) -> BoxFuture<'static, Result<Option<ObjectStream>, Error>>,
{
    let batch_size = clamp_batch_size(batch_size);

    let mut cursor = ObjectCursor::default();
    loop {
        if cancel.is_cancelled() {
            return Err(Error::Cancelled);
        }
        match delete_page(cursor, batch_size).await? {
            Some(last) => cursor = last.cursor(),
            None => return Ok(()),
        }
    }
}

/// Out-of-range requests fall back to the ceiling rather than failing the
/// sweep.
fn clamp_batch_size(requested: usize) -> usize {
    if requested == 0 || requested > DELETE_BATCH_SIZE_LIMIT {
        DELETE_BATCH_SIZE_LIMIT
    } else {
        requested
    }
}
