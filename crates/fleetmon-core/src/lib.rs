//! fleetmon-core — shared library for the fleetmon collector engine.
//!
//! Provides:
//! - `model` — instance directory and persisted sample models
//! - `config` — environment-driven engine settings
//! - `crypto` — secret cipher for instance credentials
//! - `store` — document store access (directory, samples, snapshots)
//! - `db` — MySQL client abstraction and per-instance pool management
//! - `registry` — instance directory: load, change feed, reconciliation
//! - `collector` — slow-query, command-status and disk-status collectors
//! - `sched` — time-driven scheduling primitives
//! - `fleet` — fleet manager: per-instance task lifecycles

pub mod collector;
pub mod config;
pub mod crypto;
pub mod db;
pub mod fleet;
pub mod model;
pub mod registry;
pub mod sched;
pub mod store;

/// Crate version, reported by the daemon at startup.
pub const VERSION: &str = env!("CARGO_PKG_VERSION");
