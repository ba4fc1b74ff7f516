//! Shared data models: directory entries, change events, persisted samples.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// A monitored database instance as stored in the instance directory.
///
/// The `password` field holds the encrypted credential blob; it is decrypted
/// by the pool manager immediately before a connection is opened and the
/// plaintext is never stored or logged. An instance handed to a collector
/// task is immutable — a credential change arrives as remove + re-add.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Instance {
    #[serde(rename = "instance_name")]
    pub name: String,
    pub host: String,
    pub port: u16,
    pub user: String,
    pub password: String,
    /// Default schema; may be empty.
    #[serde(default)]
    pub db: String,
    /// Owning account label; may be empty.
    #[serde(default)]
    pub account: String,
}

/// A membership change reported by the directory's change feed.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ChangeEvent {
    /// Instance inserted or updated; carries the full new document.
    Upsert(Instance),
    /// Instance removed, keyed by name.
    Remove(String),
}

/// Diff produced by a reconciliation pass against the directory.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ReconcileDiff {
    pub added: Vec<Instance>,
    pub removed: Vec<String>,
}

impl ReconcileDiff {
    pub fn is_empty(&self) -> bool {
        self.added.is_empty() && self.removed.is_empty()
    }
}

/// One row of the instance's live operation list.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ProcessRow {
    pub pid: i64,
    pub db: Option<String>,
    pub user: String,
    pub host: String,
    /// Elapsed seconds as reported by the server at poll time.
    pub time_secs: i64,
    pub statement: String,
}

/// A finalized slow-query record, written at most once per
/// `(instance, db, pid, start)` identity.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SlowQueryRecord {
    pub instance: String,
    pub db: String,
    pub pid: i64,
    pub user: String,
    pub host: String,
    /// Maximum elapsed time observed across all polls, in seconds.
    pub duration_secs: i64,
    pub sql_text: String,
    #[serde(with = "bson::serde_helpers::chrono_datetime_as_bson_datetime")]
    pub start: DateTime<Utc>,
    #[serde(with = "bson::serde_helpers::chrono_datetime_as_bson_datetime")]
    pub end: DateTime<Utc>,
}

/// One normalized command counter inside a command-status snapshot.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CommandStat {
    /// Counter name with the `Com_` prefix stripped.
    pub name: String,
    pub total: i64,
    pub avg_for_hours: f64,
    pub avg_for_seconds: f64,
    /// Share of this command among all tracked nonzero commands, 0–100.
    pub percentage: f64,
}

/// Per-instance command-status snapshot document. Immutable once written.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CommandStatusSnapshot {
    #[serde(with = "bson::serde_helpers::chrono_datetime_as_bson_datetime")]
    pub timestamp: DateTime<Utc>,
    pub instance_name: String,
    /// Sorted descending by `total`.
    pub command_status: Vec<CommandStat>,
}

/// One normalized disk-related counter inside a disk-status snapshot.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DiskMetric {
    pub name: String,
    pub value: i64,
    pub avg_for_hours: f64,
    pub avg_for_seconds: f64,
}

/// Per-instance disk-status snapshot document. Immutable once written.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DiskStatusSnapshot {
    #[serde(with = "bson::serde_helpers::chrono_datetime_as_bson_datetime")]
    pub timestamp: DateTime<Utc>,
    pub instance_name: String,
    /// Sorted descending by `value`.
    pub metrics: Vec<DiskMetric>,
}
