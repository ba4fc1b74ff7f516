//! Database client abstraction.
//!
//! Collectors talk to instances through the [`DbPool`] trait; pools are
//! created from [`DbConnector`] by the pool manager. The production
//! implementation is sqlx/MySQL ([`mysql::MySqlConnector`]); tests use the
//! scripted [`mock::MockConnector`].

pub mod mock;
pub mod mysql;
pub mod pool;

use std::future::Future;

use crate::model::{Instance, ProcessRow};

pub use pool::{PoolError, PoolManager};

/// Error type for queries against a monitored instance.
#[derive(Debug)]
pub enum DbError {
    /// Could not connect or the pool is gone.
    Connection(String),
    /// Statement execution failed.
    Query(String),
    /// The bounded per-query timeout elapsed.
    Timeout,
}

impl std::fmt::Display for DbError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            DbError::Connection(msg) => write!(f, "connection error: {}", msg),
            DbError::Query(msg) => write!(f, "query error: {}", msg),
            DbError::Timeout => write!(f, "query timed out"),
        }
    }
}

impl std::error::Error for DbError {}

/// A pooled client handle bound to one instance for its lifetime.
pub trait DbPool: Send + Sync + 'static {
    /// Live operation list, excluding system schemas and maintenance
    /// accounts, longest-running first.
    fn process_list(&self) -> impl Future<Output = Result<Vec<ProcessRow>, DbError>> + Send;

    /// `SHOW GLOBAL STATUS LIKE <pattern>` as (name, value) pairs. The
    /// pattern comes from internal constants, never from user input.
    fn global_status(
        &self,
        like: &str,
    ) -> impl Future<Output = Result<Vec<(String, String)>, DbError>> + Send;

    /// Releases all connections. Must only run once the instance's collector
    /// tasks have terminated; the fleet manager enforces the order.
    fn close(&self) -> impl Future<Output = ()> + Send;
}

/// Factory for per-instance pools.
pub trait DbConnector: Clone + Send + Sync + 'static {
    type Pool: DbPool;

    /// Opens a pool for `instance` with the already-decrypted password.
    fn connect(
        &self,
        instance: &Instance,
        password: &str,
    ) -> impl Future<Output = Result<Self::Pool, DbError>> + Send;
}
