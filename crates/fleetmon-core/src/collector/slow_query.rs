//! Slow-query detection by process-list sampling.
//!
//! The server only reports *elapsed* time per operation, sampled at tick
//! granularity, so durations here are estimates, not measurements:
//!
//! - the start instant is backdated by the threshold on first sight
//!   (`now − threshold`), which can overstate by up to one threshold width;
//! - two short operations reusing one pid within a single tick are
//!   indistinguishable and merge into one record.
//!
//! Each instance runs one collector with a private in-flight map; ticks are
//! strictly sequential, which is what keeps the max-duration fold monotonic
//! and the finalize pass at-most-once without locking.

use std::collections::{HashMap, HashSet};
use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use tokio::sync::watch;
use tracing::{debug, error, info, warn};

use super::{CollectorError, clean_statement};
use crate::db::DbPool;
use crate::model::{ProcessRow, SlowQueryRecord};
use crate::sched::sleep_or_stop;
use crate::store::SampleStore;

/// A still-running operation under observation.
struct InFlight {
    max_duration_secs: i64,
    started_at: DateTime<Utc>,
    db: String,
    user: String,
    host: String,
    sql_text: String,
}

pub struct SlowQueryCollector<P, S> {
    instance: String,
    pool: Arc<P>,
    store: S,
    threshold_secs: i64,
    in_flight: HashMap<i64, InFlight>,
}

impl<P: DbPool, S: SampleStore> SlowQueryCollector<P, S> {
    pub fn new(instance: String, pool: Arc<P>, store: S, threshold_secs: i64) -> Self {
        Self {
            instance,
            pool,
            store,
            threshold_secs,
            in_flight: HashMap::new(),
        }
    }

    /// Number of operations currently under observation.
    pub fn tracked(&self) -> usize {
        self.in_flight.len()
    }

    /// The sampling loop: tick, sleep, repeat until stopped.
    ///
    /// Poll failures are logged and the loop moves on; a failed finalize
    /// write is logged at error level — that record is lost — and the loop
    /// still moves on.
    pub async fn run(
        mut self,
        mut stop: watch::Receiver<bool>,
        interval: Duration,
    ) -> Result<(), CollectorError> {
        info!(instance = %self.instance, "slow query sampling started");
        loop {
            if *stop.borrow() {
                break;
            }
            if let Err(e) = self.tick().await {
                error!(
                    instance = %self.instance,
                    error = %e,
                    "failed to persist finalized slow query"
                );
            }
            if !sleep_or_stop(&mut stop, interval).await {
                break;
            }
        }
        info!(instance = %self.instance, "slow query sampling stopped");
        Ok(())
    }

    pub async fn tick(&mut self) -> Result<(), CollectorError> {
        self.tick_at(Utc::now()).await
    }

    /// One sampling pass at an injected instant (tests drive this directly).
    pub async fn tick_at(&mut self, now: DateTime<Utc>) -> Result<(), CollectorError> {
        let rows = match self.pool.process_list().await {
            Ok(rows) => rows,
            Err(e) => {
                // Instance-local, transient: keep the loop and the in-flight
                // map; nothing can be finalized without a poll.
                warn!(instance = %self.instance, error = %e, "process list poll failed");
                return Ok(());
            }
        };

        let mut current = HashSet::with_capacity(rows.len());
        for row in &rows {
            current.insert(row.pid);
            if row.time_secs >= self.threshold_secs {
                self.observe(row, now);
            }
        }

        self.finalize_departed(&current, now).await
    }

    fn observe(&mut self, row: &ProcessRow, now: DateTime<Utc>) {
        let threshold = self.threshold_secs;
        let entry = self.in_flight.entry(row.pid).or_insert_with(|| InFlight {
            max_duration_secs: 0,
            started_at: estimated_start(now, threshold),
            db: String::new(),
            user: String::new(),
            host: String::new(),
            sql_text: String::new(),
        });

        entry.max_duration_secs = entry.max_duration_secs.max(row.time_secs);
        entry.db = row.db.clone().unwrap_or_default();
        entry.user = row.user.clone();
        entry.host = row.host.clone();
        entry.sql_text = clean_statement(&row.statement);
    }

    /// Flushes every tracked pid missing from the current poll.
    ///
    /// The entry is dropped whether or not the write happened; the
    /// check-then-insert keeps the record at-most-once per
    /// `(instance, db, pid, start)` even if a departure is detected twice.
    async fn finalize_departed(
        &mut self,
        current: &HashSet<i64>,
        now: DateTime<Utc>,
    ) -> Result<(), CollectorError> {
        let departed: Vec<i64> = self
            .in_flight
            .keys()
            .filter(|pid| !current.contains(pid))
            .copied()
            .collect();

        let mut first_error = None;
        for pid in departed {
            let Some(entry) = self.in_flight.remove(&pid) else {
                continue;
            };
            let record = SlowQueryRecord {
                instance: self.instance.clone(),
                db: entry.db,
                pid,
                user: entry.user,
                host: entry.host,
                duration_secs: entry.max_duration_secs,
                sql_text: entry.sql_text,
                start: entry.started_at,
                end: now,
            };

            let result = self.flush(&record).await;
            if let Err(e) = result {
                if first_error.is_none() {
                    first_error = Some(e);
                }
            }
        }

        match first_error {
            Some(e) => Err(CollectorError::Store(e)),
            None => Ok(()),
        }
    }

    async fn flush(&self, record: &SlowQueryRecord) -> Result<(), crate::store::StoreError> {
        let exists = self
            .store
            .slow_query_exists(&record.instance, &record.db, record.pid, record.start)
            .await?;
        if exists {
            debug!(
                instance = %record.instance,
                pid = record.pid,
                "finalized record already stored, skipping"
            );
            return Ok(());
        }
        self.store.insert_slow_query(record).await?;
        info!(
            instance = %record.instance,
            db = %record.db,
            pid = record.pid,
            duration_secs = record.duration_secs,
            "slow query recorded"
        );
        Ok(())
    }
}

/// `now − threshold`, truncated to whole seconds.
fn estimated_start(now: DateTime<Utc>, threshold_secs: i64) -> DateTime<Utc> {
    DateTime::from_timestamp(now.timestamp() - threshold_secs, 0)
        .unwrap_or_else(|| now - chrono::Duration::seconds(threshold_secs))
}
