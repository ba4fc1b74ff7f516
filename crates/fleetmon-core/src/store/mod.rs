//! Document store access.
//!
//! The engine persists everything to a shared document store and reads the
//! instance directory from it. Access goes through two traits so the fleet
//! manager and collectors can be driven against an in-memory store in tests:
//!
//! - [`DirectoryStore`] — the instance directory: full load + change feed
//! - [`SampleStore`] — finalized slow-query records and counter snapshots
//!
//! [`mongo::MongoStore`] is the production implementation;
//! [`memory::MemoryStore`] backs the tests.

pub mod memory;
pub mod mongo;

use std::future::Future;

use chrono::{DateTime, Utc};
use tokio::sync::mpsc;

use crate::model::{
    ChangeEvent, CommandStatusSnapshot, DiskStatusSnapshot, Instance, SlowQueryRecord,
};

pub use memory::MemoryStore;
pub use mongo::MongoStore;

/// Error type for document store operations.
#[derive(Debug)]
pub enum StoreError {
    /// Could not reach the store.
    Connection(String),
    /// A read or write against a collection failed.
    Query(String),
    /// The change feed could not be opened or broke mid-stream.
    Feed(String),
}

impl std::fmt::Display for StoreError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            StoreError::Connection(msg) => write!(f, "store connection error: {}", msg),
            StoreError::Query(msg) => write!(f, "store query error: {}", msg),
            StoreError::Feed(msg) => write!(f, "change feed error: {}", msg),
        }
    }
}

impl std::error::Error for StoreError {}

/// Read access to the instance directory.
pub trait DirectoryStore: Clone + Send + Sync + 'static {
    /// Full read of the directory. Malformed documents are skipped with a
    /// warning; credentials stay encrypted.
    fn load_instances(&self) -> impl Future<Output = Result<Vec<Instance>, StoreError>> + Send;

    /// Subscribes to the directory's change feed and forwards events into
    /// `tx` until the feed ends, breaks, or the receiver is dropped.
    ///
    /// Returns `Ok(())` on a clean end of stream and `Err` on subscription
    /// or mid-stream failure. The caller owns retry and backoff; no resume
    /// token is persisted, so missed events are recovered by reconciliation.
    fn watch_instances(
        &self,
        tx: mpsc::Sender<ChangeEvent>,
    ) -> impl Future<Output = Result<(), StoreError>> + Send;
}

/// Write access for collector output.
pub trait SampleStore: Clone + Send + Sync + 'static {
    /// True if a finalized record with this `(instance, db, pid, start)`
    /// identity already exists.
    fn slow_query_exists(
        &self,
        instance: &str,
        db: &str,
        pid: i64,
        start: DateTime<Utc>,
    ) -> impl Future<Output = Result<bool, StoreError>> + Send;

    fn insert_slow_query(
        &self,
        record: &SlowQueryRecord,
    ) -> impl Future<Output = Result<(), StoreError>> + Send;

    fn insert_command_status(
        &self,
        snapshot: &CommandStatusSnapshot,
    ) -> impl Future<Output = Result<(), StoreError>> + Send;

    fn insert_disk_status(
        &self,
        snapshot: &DiskStatusSnapshot,
    ) -> impl Future<Output = Result<(), StoreError>> + Send;
}
