//! In-memory store used by tests.
//!
//! Mirrors the Mongo-backed store closely enough to drive the registry,
//! collectors and fleet manager without a server: directory mutations are
//! broadcast to active watchers the way a change feed would deliver them,
//! and written samples stay inspectable.

use std::sync::{Arc, Mutex};

use chrono::{DateTime, Utc};
use tokio::sync::broadcast;
use tokio::sync::mpsc;

use super::{DirectoryStore, SampleStore, StoreError};
use crate::model::{
    ChangeEvent, CommandStatusSnapshot, DiskStatusSnapshot, Instance, SlowQueryRecord,
};

#[derive(Default)]
struct Inner {
    instances: Vec<Instance>,
    slow_log: Vec<SlowQueryRecord>,
    com_status: Vec<CommandStatusSnapshot>,
    disk_usage: Vec<DiskStatusSnapshot>,
    feed: Option<broadcast::Sender<ChangeEvent>>,
    fail_watch: bool,
    fail_slow_inserts: bool,
}

#[derive(Clone, Default)]
pub struct MemoryStore {
    inner: Arc<Mutex<Inner>>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Adds or replaces a directory entry and emits an `Upsert` to watchers.
    pub fn upsert_instance(&self, instance: Instance) {
        let feed = {
            let mut inner = self.inner.lock().unwrap();
            inner.instances.retain(|i| i.name != instance.name);
            inner.instances.push(instance.clone());
            inner.feed.clone()
        };
        if let Some(feed) = feed {
            let _ = feed.send(ChangeEvent::Upsert(instance));
        }
    }

    /// Removes a directory entry and emits a `Remove` to watchers.
    pub fn remove_instance(&self, name: &str) {
        let feed = {
            let mut inner = self.inner.lock().unwrap();
            inner.instances.retain(|i| i.name != name);
            inner.feed.clone()
        };
        if let Some(feed) = feed {
            let _ = feed.send(ChangeEvent::Remove(name.to_string()));
        }
    }

    /// Mutates the directory without emitting a feed event — simulates a
    /// change the feed missed, visible only to reconciliation.
    pub fn upsert_instance_silently(&self, instance: Instance) {
        let mut inner = self.inner.lock().unwrap();
        inner.instances.retain(|i| i.name != instance.name);
        inner.instances.push(instance);
    }

    pub fn remove_instance_silently(&self, name: &str) {
        self.inner.lock().unwrap().instances.retain(|i| i.name != name);
    }

    /// Makes the next `watch_instances` call fail at subscription time.
    pub fn fail_next_watch(&self) {
        self.inner.lock().unwrap().fail_watch = true;
    }

    /// Makes slow-query inserts fail until cleared.
    pub fn set_fail_slow_inserts(&self, fail: bool) {
        self.inner.lock().unwrap().fail_slow_inserts = fail;
    }

    /// Ends the active change feed; watchers return cleanly.
    pub fn close_feed(&self) {
        self.inner.lock().unwrap().feed = None;
    }

    pub fn slow_queries(&self) -> Vec<SlowQueryRecord> {
        self.inner.lock().unwrap().slow_log.clone()
    }

    pub fn command_snapshots(&self) -> Vec<CommandStatusSnapshot> {
        self.inner.lock().unwrap().com_status.clone()
    }

    pub fn disk_snapshots(&self) -> Vec<DiskStatusSnapshot> {
        self.inner.lock().unwrap().disk_usage.clone()
    }

    /// Seeds a finalized record directly, bypassing the feed.
    pub fn seed_slow_query(&self, record: SlowQueryRecord) {
        self.inner.lock().unwrap().slow_log.push(record);
    }

    fn subscribe(&self) -> Result<broadcast::Receiver<ChangeEvent>, StoreError> {
        let mut inner = self.inner.lock().unwrap();
        if inner.fail_watch {
            inner.fail_watch = false;
            return Err(StoreError::Feed("subscription refused".to_string()));
        }
        let sender = inner
            .feed
            .get_or_insert_with(|| broadcast::channel(64).0)
            .clone();
        Ok(sender.subscribe())
    }
}

impl DirectoryStore for MemoryStore {
    async fn load_instances(&self) -> Result<Vec<Instance>, StoreError> {
        Ok(self.inner.lock().unwrap().instances.clone())
    }

    async fn watch_instances(&self, tx: mpsc::Sender<ChangeEvent>) -> Result<(), StoreError> {
        let mut rx = self.subscribe()?;
        loop {
            match rx.recv().await {
                Ok(event) => {
                    if tx.send(event).await.is_err() {
                        return Ok(());
                    }
                }
                Err(broadcast::error::RecvError::Closed) => return Ok(()),
                Err(broadcast::error::RecvError::Lagged(n)) => {
                    return Err(StoreError::Feed(format!("feed lagged by {} events", n)));
                }
            }
        }
    }
}

impl SampleStore for MemoryStore {
    async fn slow_query_exists(
        &self,
        instance: &str,
        db: &str,
        pid: i64,
        start: DateTime<Utc>,
    ) -> Result<bool, StoreError> {
        let inner = self.inner.lock().unwrap();
        Ok(inner.slow_log.iter().any(|r| {
            r.instance == instance && r.db == db && r.pid == pid && r.start == start
        }))
    }

    async fn insert_slow_query(&self, record: &SlowQueryRecord) -> Result<(), StoreError> {
        let mut inner = self.inner.lock().unwrap();
        if inner.fail_slow_inserts {
            return Err(StoreError::Query("write refused".to_string()));
        }
        inner.slow_log.push(record.clone());
        Ok(())
    }

    async fn insert_command_status(
        &self,
        snapshot: &CommandStatusSnapshot,
    ) -> Result<(), StoreError> {
        self.inner.lock().unwrap().com_status.push(snapshot.clone());
        Ok(())
    }

    async fn insert_disk_status(&self, snapshot: &DiskStatusSnapshot) -> Result<(), StoreError> {
        self.inner.lock().unwrap().disk_usage.push(snapshot.clone());
        Ok(())
    }
}
