//! Relational PostgreSQL backend.

use chrono::{DateTime, Utc};
use sqlx::PgPool;
use tracing::{debug, info};

use crate::adapter::{Adapter, DeletedCounts};
use crate::error::Error;
use crate::gc::{DeleteExpiredObjects, DeleteZombieObjects};
use crate::objects::{ObjectCursor, ObjectStatus, ObjectStream};

/// Garbage-collection backend for plain PostgreSQL.
///
/// Candidate selection paginates with a row-value keyset predicate. Plain
/// Postgres has no time-travel reads, so the staleness bound is not applied;
/// selection is treated as stale either way and the delete statements
/// re-validate what matters.
pub struct PostgresAdapter {
    pool: PgPool,
}

impl PostgresAdapter {
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }

    pub async fn connect(dsn: &str) -> Result<Self, Error> {
        let pool = PgPool::connect(dsn).await.map_err(Error::Connection)?;
        Ok(Self::new(pool))
    }
}

#[derive(sqlx::FromRow)]
struct ExpiredObjectRow {
    #[sqlx(flatten)]
    object: ObjectStream,
    expires_at: DateTime<Utc>,
}

/// Deletes one object by its full five-tuple, then that stream's segments.
///
/// The segment delete keys on the candidate's stream rather than on the
/// object rows removed, so segments orphaned by an earlier partial failure
/// are reclaimed when the object is retried.
const DELETE_OBJECT_AND_SEGMENTS: &str = r#"
WITH deleted_objects AS (
    DELETE FROM objects
    WHERE (project_id, bucket_name, object_key, version, stream_id) = ($1, $2, $3, $4, $5)
    RETURNING stream_id
)
DELETE FROM segments
WHERE segments.stream_id = $5
"#;

/// Deletes one object only if its stream saw no segment writes after the
/// inactivity deadline, as of this statement's own snapshot, then deletes
/// the segments of the object actually removed. Returns exact counts.
const DELETE_INACTIVE_OBJECT_AND_SEGMENTS: &str = r#"
WITH check_segments AS (
    SELECT 1 AS present FROM segments
    WHERE stream_id = $5 AND created_at > $6
), deleted_objects AS (
    DELETE FROM objects
    WHERE
        (project_id, bucket_name, object_key, version, stream_id) = ($1, $2, $3, $4, $5)
        AND NOT EXISTS (SELECT 1 FROM check_segments)
    RETURNING stream_id
), deleted_segments AS (
    DELETE FROM segments
    WHERE segments.stream_id IN (SELECT stream_id FROM deleted_objects)
    RETURNING stream_id
)
SELECT
    (SELECT count(*) FROM deleted_objects) AS objects_deleted,
    (SELECT count(*) FROM deleted_segments) AS segments_deleted
"#;

#[async_trait::async_trait]
impl Adapter for PostgresAdapter {
    fn name(&self) -> &'static str {
        "postgres"
    }

    async fn find_expired_objects(
        &self,
        opts: &DeleteExpiredObjects,
        start_after: &ObjectCursor,
        batch_size: usize,
    ) -> Result<Vec<ObjectStream>, Error> {
        let rows: Vec<ExpiredObjectRow> = sqlx::query_as(
            r#"
            SELECT project_id, bucket_name, object_key, version, stream_id, expires_at
            FROM objects
            WHERE
                (project_id, bucket_name, object_key, version) > ($1, $2, $3, $4)
                AND expires_at < $5
            ORDER BY project_id, bucket_name, object_key, version
            LIMIT $6
            "#,
        )
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
        let objects: Vec<ObjectStream> = sqlx::query_as(
            r#"
            SELECT project_id, bucket_name, object_key, version, stream_id
            FROM objects
            WHERE
                (project_id, bucket_name, object_key, version) > ($1, $2, $3, $4)
                AND status = $5
                AND (zombie_deletion_deadline IS NULL OR zombie_deletion_deadline < $6)
            ORDER BY project_id, bucket_name, object_key, version
            LIMIT $7
            "#,
        )
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

        let mut conn = self.pool.acquire().await.map_err(Error::Deletion)?;

        let mut counts = DeletedCounts::default();
        let mut errors = Vec::new();
        for object in objects {
            let result = sqlx::query(DELETE_OBJECT_AND_SEGMENTS)
                .bind(object.project_id)
                .bind(&object.bucket_name)
                .bind(&object.object_key)
                .bind(object.version)
                .bind(object.stream_id)
                .execute(&mut *conn)
                .await;

            match result {
                Ok(done) => {
                    // Rows affected counts the segment delete, which slightly
                    // undercounts objects that have no segments. The counts
                    // feed metrics only, where that is acceptable.
                    let segments = done.rows_affected();
                    if segments > 0 {
                        counts.objects += 1;
                        counts.segments += segments;
                    }
                }
                Err(err) => errors.push(err),
            }
        }

        if errors.is_empty() {
            Ok(counts)
        } else {
            Err(Error::PartialBatch {
                counts,
                total: objects.len(),
                errors,
            })
        }
    }

    async fn delete_inactive_objects_and_segments(
        &self,
        objects: &[ObjectStream],
        inactive_deadline: DateTime<Utc>,
    ) -> Result<DeletedCounts, Error> {
        if objects.is_empty() {
            return Ok(DeletedCounts::default());
        }

        let mut conn = self.pool.acquire().await.map_err(Error::Deletion)?;

        let mut counts = DeletedCounts::default();
        let mut errors = Vec::new();
        for object in objects {
            let result: Result<(i64, i64), sqlx::Error> =
                sqlx::query_as(DELETE_INACTIVE_OBJECT_AND_SEGMENTS)
                    .bind(object.project_id)
                    .bind(&object.bucket_name)
                    .bind(&object.object_key)
                    .bind(object.version)
                    .bind(object.stream_id)
                    .bind(inactive_deadline)
                    .fetch_one(&mut *conn)
                    .await;

            match result {
                Ok((objects_deleted, segments_deleted)) => {
                    counts.objects += objects_deleted as u64;
                    counts.segments += segments_deleted as u64;
                }
                Err(err) => errors.push(err),
            }
        }

        if errors.is_empty() {
            Ok(counts)
        } else {
            Err(Error::PartialBatch {
                counts,
                total: objects.len(),
                errors,
            })
        }
    }
}
