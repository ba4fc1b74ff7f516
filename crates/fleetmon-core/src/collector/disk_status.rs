//! Periodic disk-pressure counter snapshot.

use std::sync::Arc;

use chrono::{DateTime, Utc};
use tracing::{info, warn};

use super::{CollectorError, avg_for_hours, avg_for_seconds, fetch_uptime};
use crate::db::DbPool;
use crate::model::{DiskMetric, DiskStatusSnapshot};
use crate::store::SampleStore;

/// Counters that indicate spill-to-disk pressure.
pub const TRACKED_METRICS: [&str; 5] = [
    "Binlog_cache_use",
    "Binlog_cache_disk_use",
    "Created_tmp_tables",
    "Created_tmp_files",
    "Created_tmp_disk_tables",
];

pub struct DiskStatusCollector<P, S> {
    instance: String,
    pool: Arc<P>,
    store: S,
}

impl<P, S: Clone> Clone for DiskStatusCollector<P, S> {
    fn clone(&self) -> Self {
        Self {
            instance: self.instance.clone(),
            pool: self.pool.clone(),
            store: self.store.clone(),
        }
    }
}

impl<P: DbPool, S: SampleStore> DiskStatusCollector<P, S> {
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

    /// One snapshot; counters are fetched one at a time so a single failing
    /// read drops that counter, not the whole snapshot.
    pub async fn collect_at(&self, now: DateTime<Utc>) -> Result<(), CollectorError> {
        let uptime = match fetch_uptime(&*self.pool).await {
            Ok(uptime) => uptime,
            Err(e) => {
                warn!(instance = %self.instance, error = %e, "could not read uptime");
                return Ok(());
            }
        };

        let mut raw: Vec<(String, String)> = Vec::with_capacity(TRACKED_METRICS.len());
        for metric in TRACKED_METRICS {
            match self.pool.global_status(metric).await {
                Ok(rows) => raw.extend(rows),
                Err(e) => {
                    warn!(instance = %self.instance, metric, error = %e, "counter read failed");
                }
            }
        }
        if raw.is_empty() {
            warn!(instance = %self.instance, "no disk counters readable, skipping snapshot");
            return Ok(());
        }

        let snapshot = DiskStatusSnapshot {
            timestamp: now,
            instance_name: self.instance.clone(),
            metrics: normalize_disk_metrics(&raw, uptime),
        };
        self.store
            .insert_disk_status(&snapshot)
            .await
            .map_err(CollectorError::Store)?;
        info!(
            instance = %self.instance,
            metrics = snapshot.metrics.len(),
            "disk status snapshot written"
        );
        Ok(())
    }
}

/// Tracked nonzero counters averaged over clamped uptime, sorted descending
/// by raw value.
pub fn normalize_disk_metrics(raw: &[(String, String)], uptime_secs: i64) -> Vec<DiskMetric> {
    let mut metrics: Vec<DiskMetric> = raw
        .iter()
        .filter_map(|(name, value)| {
            if !TRACKED_METRICS.contains(&name.as_str()) {
                return None;
            }
            let value: i64 = value.trim().parse().ok()?;
            if value == 0 {
                return None;
            }
            Some(DiskMetric {
                name: name.clone(),
                value,
                avg_for_hours: avg_for_hours(value, uptime_secs),
                avg_for_seconds: avg_for_seconds(value, uptime_secs),
            })
        })
        .collect();

    metrics.sort_by(|a, b| b.value.cmp(&a.value).then_with(|| a.name.cmp(&b.name)));
    metrics
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
    fn normalization_filters_and_sorts() {
        let metrics = normalize_disk_metrics(
            &raw(&[
                ("Created_tmp_tables", "600"),
                ("Created_tmp_disk_tables", "1200"),
                ("Binlog_cache_disk_use", "0"),
                ("Threads_running", "9"),
            ]),
            7200,
        );
        let names: Vec<&str> = metrics.iter().map(|m| m.name.as_str()).collect();
        assert_eq!(names, vec!["Created_tmp_disk_tables", "Created_tmp_tables"]);
        assert_eq!(metrics[0].avg_for_hours, 600.0);
        assert_eq!(metrics[1].avg_for_seconds, 0.08);
    }

    #[tokio::test]
    async fn partial_counter_failures_still_produce_a_snapshot() {
        let pool = MockPool::new();
        pool.set_status("Uptime", vec![("Uptime", "7200")]);
        // Only two of the five tracked counters are scripted; the other
        // reads fail and are skipped.
        pool.set_status("Created_tmp_tables", vec![("Created_tmp_tables", "10")]);
        pool.set_status("Binlog_cache_use", vec![("Binlog_cache_use", "3")]);
        let store = MemoryStore::new();
        let c =
            DiskStatusCollector::new("db-a".to_string(), Arc::new(pool.clone()), store.clone());

        c.collect().await.unwrap();

        let snapshots = store.disk_snapshots();
        assert_eq!(snapshots.len(), 1);
        assert_eq!(snapshots[0].metrics.len(), 2);
        assert_eq!(snapshots[0].metrics[0].name, "Created_tmp_tables");
    }

    #[tokio::test]
    async fn unreadable_uptime_skips_the_snapshot() {
        let pool = MockPool::new();
        let store = MemoryStore::new();
        let c =
            DiskStatusCollector::new("db-a".to_string(), Arc::new(pool.clone()), store.clone());
        c.collect().await.unwrap();
        assert!(store.disk_snapshots().is_empty());
    }
}
