//! CockroachDB backend.
//!
//! CockroachDB speaks the Postgres wire protocol, so it shares the sqlx
//! stack with the relational backend; what differs is bounded-staleness
//! selection (`AS OF SYSTEM TIME`) and fully transactional deletes.

use std::time::Duration;

use chrono::{DateTime, Utc};
use sqlx::PgPool;
use tracing::{debug, info};
use uuid::Uuid;

use crate::adapter::{Adapter, DeletedCounts};
use crate::error::Error;
use crate::gc::{DeleteExpiredObjects, DeleteZombieObjects};
use crate::objects::{ObjectCursor, ObjectStatus, ObjectStream};

pub struct CockroachAdapter {
    pool: PgPool,
}

#[derive(sqlx::FromRow)]
struct ExpiredObjectRow {
    #[sqlx(flatten)]
    object: ObjectStream,
    expires_at: DateTime<Utc>,
}

impl CockroachAdapter {
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }

    pub async fn connect(dsn: &str) -> Result<Self, Error> {
        let pool = PgPool::connect(dsn).await.map_err(Error::Connection)?;
        Ok(Self::new(pool))
    }
}

/// `AS OF SYSTEM TIME` clause for a bounded-staleness read, or nothing when
/// no staleness is allowed. The interval cannot be a bind parameter, but it
/// is rendered from a `Duration`, never from user text.
fn as_of_system_time(staleness: Duration) -> String {
    if staleness.is_zero() {
        String::new()
    } else {
        format!(" AS OF SYSTEM TIME '-{:.3}s'", staleness.as_secs_f64())
    }
}

/// Keyset predicate over `(project_id, bucket_name, object_key, version)`
/// bound as `$1..$4`, spelled out so the optimizer keeps it an index range
/// scan under `AS OF SYSTEM TIME`.
const CURSOR_PREDICATE: &str = r#"(
    project_id > $1
    OR (project_id = $1 AND bucket_name > $2)
    OR (project_id = $1 AND bucket_name = $2 AND object_key > $3)
    OR (project_id = $1 AND bucket_name = $2 AND object_key = $3 AND version > $4)
)"#;

#[async_trait::async_trait]
impl Adapter for CockroachAdapter {
    fn name(&self) -> &'static str {
        "cockroach"
    }

    async fn find_expired_objects(
        &self,
        opts: &DeleteExpiredObjects,
        start_after: &ObjectCursor,
        batch_size: usize,
    ) -> Result<Vec<ObjectStream>, Error> {
        let query = format!(
            r#"
            SELECT project_id, bucket_name, object_key, version, stream_id, expires_at
            FROM objects{aost}
            WHERE
                expires_at < $5
                AND {cursor}
            ORDER BY project_id, bucket_name, object_key, version
            LIMIT $6
            "#,
            aost = as_of_system_time(opts.staleness_bound),
            cursor = CURSOR_PREDICATE,
        );

        let rows: Vec<ExpiredObjectRow> = sqlx::query_as(&query)
            .bind(start_after.project_id)
            .bind(&start_after.bucket_name)
            .bind(&start_after.object_key)
            .bind(start_after.version)
            .bind(opts.expired_before)
            .bind(batch_size as i64)
            .fetch_all(&self.pool)
            .await
            .map_err(Error::Selection)?;

        let mut expired = Vec::with_capacity(rows.len());
        for row in rows {
            info!(
                project = %row.object.project_id,
                bucket = %row.object.bucket_name,
                key = %row.object.object_key,
                version = row.object.version,
                stream = %row.object.stream_id,
                expired_at = %row.expires_at,
                "deleting expired object"
            );
            expired.push(row.object);
        }
        Ok(expired)
    }

    async fn find_zombie_objects(
        &self,
        opts: &DeleteZombieObjects,
        start_after: &ObjectCursor,
        batch_size: usize,
    ) -> Result<Vec<ObjectStream>, Error> {
        // Pending objects created before the deadline column existed carry
        // NULL there; they are already eligible.
        let query = format!(
            r#"
            SELECT project_id, bucket_name, object_key, version, stream_id
            FROM objects{aost}
            WHERE
                status = $5
                AND (zombie_deletion_deadline IS NULL OR zombie_deletion_deadline < $6)
                AND {cursor}
            ORDER BY project_id, bucket_name, object_key, version
            LIMIT $7
            "#,
            aost = as_of_system_time(opts.staleness_bound),
            cursor = CURSOR_PREDICATE,
        );

        let objects: Vec<ObjectStream> = sqlx::query_as(&query)
            .bind(start_after.project_id)
            .bind(&start_after.bucket_name)
            .bind(&start_after.object_key)
            .bind(start_after.version)
            .bind(ObjectStatus::Pending)
            .bind(opts.deadline_before)
            .bind(batch_size as i64)
            .fetch_all(&self.pool)
            .await
            .map_err(Error::Selection)?;

        for object in &objects {
            debug!(
                project = %object.project_id,
                bucket = %object.bucket_name,
                key = %object.object_key,
                version = object.version,
                stream = %object.stream_id,
                "selected zombie object for deletion"
            );
        }
        Ok(objects)
    }

    async fn delete_objects_and_segments(
        &self,
        objects: &[ObjectStream],
    ) -> Result<DeletedCounts, Error> {
        if objects.is_empty() {
            return Ok(DeletedCounts::default());
        }

        let mut tx = self.pool.begin().await.map_err(Error::Deletion)?;

        let mut counts = DeletedCounts::default();
        let mut removed_streams: Vec<Uuid> = Vec::with_capacity(objects.len());
        for object in objects {
            let done = sqlx::query(
                r#"
                DELETE FROM objects
                WHERE (project_id, bucket_name, object_key, version, stream_id)
                    = ($1, $2, $3, $4, $5)
                "#,
            )
            .bind(object.project_id)
            .bind(&object.bucket_name)
            .bind(&object.object_key)
            .bind(object.version)
            .bind(object.stream_id)
            .execute(&mut *tx)
            .await
            .map_err(Error::Deletion)?;

            if done.rows_affected() > 0 {
                counts.objects += done.rows_affected();
                removed_streams.push(object.stream_id);
            }
        }

        if !removed_streams.is_empty() {
            let done = sqlx::query("DELETE FROM segments WHERE stream_id = ANY($1)")
                .bind(&removed_streams)
                .execute(&mut *tx)
                .await
                .map_err(Error::Deletion)?;
            counts.segments = done.rows_affected();
        }

        tx.commit().await.map_err(Error::Deletion)?;
        Ok(counts)
    }

    async fn delete_inactive_objects_and_segments(
        &self,
        objects: &[ObjectStream],
        inactive_deadline: DateTime<Utc>,
    ) -> Result<DeletedCounts, Error> {
        if objects.is_empty() {
            return Ok(DeletedCounts::default());
        }

        let mut tx = self.pool.begin().await.map_err(Error::Deletion)?;

        let mut counts = DeletedCounts::default();
        let mut removed_streams: Vec<Uuid> = Vec::with_capacity(objects.len());
        for object in objects {
            // The inactivity check runs inside the same transaction as the
            // delete, so a segment written after candidate selection keeps
            // the object alive.
            let done = sqlx::query(
                r#"
                DELETE FROM objects
                WHERE
                    (project_id, bucket_name, object_key, version, stream_id)
                        = ($1, $2, $3, $4, $5)
                    AND NOT EXISTS (
                        SELECT 1 FROM segments
                        WHERE
                            segments.stream_id = objects.stream_id
                            AND segments.created_at > $6
                    )
                "#,
            )
            .bind(object.project_id)
            .bind(&object.bucket_name)
            .bind(&object.object_key)
            .bind(object.version)
            .bind(object.stream_id)
            .bind(inactive_deadline)
            .execute(&mut *tx)
            .await
            .map_err(Error::Deletion)?;

            if done.rows_affected() > 0 {
                counts.objects += done.rows_affected();
                removed_streams.push(object.stream_id);
            }
        }

        // Segment cleanup is restricted to the streams whose objects were
        // actually removed; survivors keep their segments.
        if !removed_streams.is_empty() {
            let done = sqlx::query("DELETE FROM segments WHERE stream_id = ANY($1)")
                .bind(&removed_streams)
                .execute(&mut *tx)
                .await
                .map_err(Error::Deletion)?;
            counts.segments = done.rows_affected();
        }

        tx.commit().await.map_err(Error::Deletion)?;
        Ok(counts)
    }
}
