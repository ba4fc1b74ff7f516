//! Daily command counter snapshot.

use std::sync::Arc;

use chrono::{DateTime, Utc};
use tracing::{info, warn};

use super::{CollectorError, avg_for_hours, avg_for_seconds, fetch_uptime, round2};
use crate::db::DbPool;
use crate::model::{CommandStat, CommandStatusSnapshot};
use crate::store::SampleStore;

/// Command counters worth tracking; everything else under `Com_%` is noise
/// for capacity purposes.
pub const TRACKED_COMMANDS: [&str; 16] = [
    "Com_select",
    "Com_delete",
    "Com_delete_multi",
    "Com_insert",
    "Com_insert_select",
    "Com_replace",
    "Com_replace_select",
    "Com_update",
    "Com_update_multi",
    "Com_flush",
    "Com_kill",
    "Com_purge",
    "Com_admin_commands",
    "Com_commit",
    "Com_begin",
    "Com_rollback",
];

pub struct CommandStatusCollector<P, S> {
    instance: String,
    pool: Arc<P>,
    store: S,
}

impl<P, S: Clone> Clone for CommandStatusCollector<P, S> {
    fn clone(&self) -> Self {
        Self {
            instance: self.instance.clone(),
            pool: self.pool.clone(),
            store: self.store.clone(),
        }
    }
}

impl<P: DbPool, S: SampleStore> CommandStatusCollector<P, S> {
    pub fn new(instance: String, pool: Arc<P>, store: S) -> Self {
        Self {
            instance,
            pool,
            store,
        }
    }

    pub async fn collect(&self) -> Result<(), CollectorError> {
        self.collect_at(Utc::now()).await
    }

    /// One snapshot. Unreadable counters skip this invocation without
    /// touching the schedule; a failed store write surfaces to the runner.
    pub async fn collect_at(&self, now: DateTime<Utc>) -> Result<(), CollectorError> {
        let uptime = match fetch_uptime(&*self.pool).await {
            Ok(uptime) => uptime,
            Err(e) => {
                warn!(instance = %self.instance, error = %e, "could not read uptime");
                return Ok(());
            }
        };
        let raw = match self.pool.global_status("Com_%").await {
            Ok(raw) => raw,
            Err(e) => {
                warn!(instance = %self.instance, error = %e, "could not read command counters");
                return Ok(());
            }
        };

        let snapshot = CommandStatusSnapshot {
            timestamp: now,
            instance_name: self.instance.clone(),
            command_status: normalize_command_status(&raw, uptime),
        };
        self.store
            .insert_command_status(&snapshot)
            .await
            .map_err(CollectorError::Store)?;
        info!(
            instance = %self.instance,
            commands = snapshot.command_status.len(),
            "command status snapshot written"
        );
        Ok(())
    }
}

/// Normalizes raw `Com_%` counters: tracked nonzero counters only, averaged
/// over clamped uptime, with each command's share of the tracked total.
/// Sorted descending by total.
pub fn normalize_command_status(raw: &[(String, String)], uptime_secs: i64) -> Vec<CommandStat> {
    let tracked: Vec<(&str, i64)> = raw
        .iter()
        .filter_map(|(name, value)| {
            if !TRACKED_COMMANDS.contains(&name.as_str()) {
                return None;
            }
            let value: i64 = value.trim().parse().ok()?;
            if value == 0 { None } else { Some((name.as_str(), value)) }
        })
        .collect();

    let total_sum: i64 = tracked.iter().map(|(_, value)| value).sum();

    let mut stats: Vec<CommandStat> = tracked
        .into_iter()
        .map(|(name, value)| CommandStat {
            name: name.strip_prefix("Com_").unwrap_or(name).to_string(),
            total: value,
            avg_for_hours: avg_for_hours(value, uptime_secs),
            avg_for_seconds: avg_for_seconds(value, uptime_secs),
            percentage: if total_sum > 0 {
                round2(value as f64 * 100.0 / total_sum as f64)
            } else {
                0.0
            },
        })
        .collect();

    stats.sort_by(|a, b| b.total.cmp(&a.total).then_with(|| a.name.cmp(&b.name)));
    stats
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::db::mock::MockPool;
    use crate::store::MemoryStore;

    fn raw(pairs: &[(&str, &str)]) -> Vec<(String, String)> {
        pairs
            .iter()
            .map(|(n, v)| (n.to_string(), v.to_string()))
            .collect()
    }

    #[test]
    fn single_command_takes_the_whole_share() {
        let stats = normalize_command_status(&raw(&[("Com_select", "100")]), 200);
        assert_eq!(stats.len(), 1);
        let s = &stats[0];
        assert_eq!(s.name, "select");
        assert_eq!(s.total, 100);
        assert_eq!(s.avg_for_seconds, 0.5);
        // 200s of uptime clamps to one hour.
        assert_eq!(s.avg_for_hours, 100.0);
        assert_eq!(s.percentage, 100.0);
    }

    #[test]
    fn zero_and_untracked_counters_are_dropped() {
        let stats = normalize_command_status(
            &raw(&[
                ("Com_select", "10"),
                ("Com_delete", "0"),
                ("Com_stmt_execute", "500"),
                ("Com_show_status", "7"),
            ]),
            7200,
        );
        assert_eq!(stats.len(), 1);
        assert_eq!(stats[0].name, "select");
    }

    #[test]
    fn sorted_descending_with_shares_summing_to_hundred() {
        let stats = normalize_command_status(
            &raw(&[
                ("Com_insert", "25"),
                ("Com_select", "50"),
                ("Com_update", "25"),
            ]),
            7200,
        );
        let names: Vec<&str> = stats.iter().map(|s| s.name.as_str()).collect();
        assert_eq!(names, vec!["select", "insert", "update"]);
        let total: f64 = stats.iter().map(|s| s.percentage).sum();
        assert!((total - 100.0).abs() < 0.01);
        assert_eq!(stats[0].percentage, 50.0);
    }

    #[tokio::test]
    async fn unreadable_counters_skip_the_snapshot() {
        let pool = MockPool::new();
        let store = MemoryStore::new();
        // No scripted status at all: uptime read fails.
        let c = CommandStatusCollector::new(
            "db-a".to_string(),
            Arc::new(pool.clone()),
            store.clone(),
        );
        c.collect().await.unwrap();
        assert!(store.command_snapshots().is_empty());
    }

    #[tokio::test]
    async fn snapshot_is_written_per_invocation() {
        let pool = MockPool::new();
        pool.set_status("Uptime", vec![("Uptime", "7200")]);
        pool.set_status("Com_%", vec![("Com_select", "42"), ("Com_commit", "6")]);
        let store = MemoryStore::new();
        let c = CommandStatusCollector::new(
            "db-a".to_string(),
            Arc::new(pool.clone()),
            store.clone(),
        );

        c.collect().await.unwrap();
        c.collect().await.unwrap();

        let snapshots = store.command_snapshots();
        assert_eq!(snapshots.len(), 2);
        assert_eq!(snapshots[0].instance_name, "db-a");
        assert_eq!(snapshots[0].command_status[0].name, "select");
    }
}
