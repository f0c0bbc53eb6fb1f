//! Error taxonomy for garbage-collection sweeps.

use thiserror::Error;

use crate::adapter::DeletedCounts;

/// Errors produced while sweeping a backend.
///
/// None of these are fatal to the process: a sweep failure on one adapter is
/// reported and the remaining adapters still run. Cursor state is never
/// persisted, so the next sweep re-reads current state and naturally retries
/// any range a failed sweep left behind.
#[derive(Error, Debug)]
pub enum Error {
    #[error("error connecting to metadata store: {0}")]
    Connection(#[source] sqlx::Error),

    #[error("unable to select objects for deletion: {0}")]
    Selection(#[source] sqlx::Error),

    #[error("unable to delete objects: {0}")]
    Deletion(#[source] sqlx::Error),

    /// Some statements in a batched delete failed while others succeeded.
    ///
    /// `counts` reflects the items that were deleted before and between the
    /// failures; callers record them into metrics even though the batch as a
    /// whole is reported as failed.
    #[error("{} of {} batched delete statements failed: {}", .errors.len(), .total, first_message(.errors))]
    PartialBatch {
        counts: DeletedCounts,
        total: usize,
        errors: Vec<sqlx::Error>,
    },

    #[error("garbage collection sweep cancelled")]
    Cancelled,

    #[error("invalid configuration: {0}")]
    Config(#[from] Box<figment::Error>),
}

fn first_message(errors: &[sqlx::Error]) -> String {
    match errors.first() {
        Some(err) => err.to_string(),
        None => String::from("no underlying error"),
    }
}
