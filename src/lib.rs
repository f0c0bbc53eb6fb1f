//! Garbage collection for the metacat object-storage metadata catalog.
//!
//! Objects whose TTL has passed, and uploads that were started but never
//! committed ("zombie" objects), are swept out of the catalog together with
//! their segments. Sweeps run as periodic batch jobs over one or more
//! configured backends, paginating with a keyset cursor so a sweep makes
//! forward progress regardless of how large the candidate range is.
//!
//! Candidate selection is a non-locking, possibly stale read; the delete
//! operations re-validate their conditions at the moment of deletion, so a
//! resumed upload is never reclaimed based on stale selection data.

pub mod adapter;
pub mod cockroach;
pub mod config;
pub mod error;
pub mod gc;
pub mod metrics;
pub mod objects;
pub mod postgres;

#[cfg(any(test, feature = "testing"))]
pub mod testing;

pub use adapter::{Adapter, DeletedCounts};
pub use cockroach::CockroachAdapter;
pub use config::{AdapterConfig, AdapterKind, Configuration, GcConfig};
pub use error::Error;
pub use gc::{DeleteExpiredObjects, DeleteZombieObjects, GarbageCollector};
pub use metrics::{GcMetrics, MetricsSnapshot};
pub use objects::{ObjectCursor, ObjectStatus, ObjectStream};
pub use postgres::PostgresAdapter;
