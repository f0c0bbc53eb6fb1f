//! Object and segment identity types shared by every backend.

use uuid::Uuid;

/// Identity of one upload attempt of an object.
///
/// `(project_id, bucket_name, object_key, version)` identifies the
/// user-facing object; `stream_id` is unique per upload attempt, so a
/// concurrently re-uploaded object carries a different `stream_id` even when
/// the other four fields match.
#[derive(Debug, Clone, PartialEq, Eq, Hash, sqlx::FromRow)]
pub struct ObjectStream {
    pub project_id: Uuid,
    pub bucket_name: String,
    pub object_key: String,
    pub version: i64,
    pub stream_id: Uuid,
}

impl ObjectStream {
    /// The pagination key of this object.
    pub fn cursor(&self) -> ObjectCursor {
        ObjectCursor {
            project_id: self.project_id,
            bucket_name: self.bucket_name.clone(),
            object_key: self.object_key.clone(),
            version: self.version,
        }
    }
}

/// Composite keyset-pagination cursor over the object ordering.
///
/// The derived `Ord` (field declaration order) is the single definition of
/// the pagination order: the SQL keyset predicates and the in-memory backend
/// both follow it. A page always starts strictly after the cursor, which
/// guarantees forward progress and no duplicates within one sweep.
#[derive(Debug, Clone, Default, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct ObjectCursor {
    pub project_id: Uuid,
    pub bucket_name: String,
    pub object_key: String,
    pub version: i64,
}

/// Lifecycle status of an object row.
#[derive(Debug, Clone, Copy, PartialEq, Eq, sqlx::Type)]
#[repr(i16)]
pub enum ObjectStatus {
    /// Upload started but not finalized. Only pending objects are ever
    /// considered zombie candidates.
    Pending = 1,
    /// Upload finalized; never swept as a zombie.
    Committed = 2,
}
