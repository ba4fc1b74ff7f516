//! Fleet manager: drives the full per-instance task set from registry state.
//!
//! Per instance the lifecycle is absent → starting → running → stopping →
//! absent. Starting creates the pool and spawns three collector tasks;
//! stopping signals them, awaits their exit, and only then closes the pool,
//! so a close can never race an in-flight query.
//!
//! Membership changes arrive from two independent sources — the directory
//! change feed and the reconciliation timer — but both funnel through
//! `apply_change_event`/`apply_reconcile_diff` on the single dispatcher task
//! inside [`FleetManager::run`]. That single logical writer is what makes
//! duplicate notifications (a feed delete plus a reconcile removal for the
//! same instance) harmless: start and stop are idempotent.

use std::collections::HashMap;
use std::sync::Arc;

use tokio::sync::{mpsc, watch};
use tokio::task::JoinHandle;
use tokio::time::MissedTickBehavior;
use tracing::{debug, error, info, warn};

use crate::collector::{CommandStatusCollector, DiskStatusCollector, SlowQueryCollector};
use crate::config::Settings;
use crate::crypto::SecretCipher;
use crate::db::{DbConnector, PoolManager};
use crate::model::{ChangeEvent, Instance, ReconcileDiff};
use crate::registry::InstanceRegistry;
use crate::sched;
use crate::store::{DirectoryStore, SampleStore};

/// Stop signal plus join handles for one instance's three collector tasks.
struct InstanceTasks {
    stop: watch::Sender<bool>,
    handles: Vec<JoinHandle<()>>,
}

pub struct FleetManager<D, S, C>
where
    D: DirectoryStore,
    S: SampleStore,
    C: DbConnector,
{
    registry: InstanceRegistry<D>,
    samples: S,
    pools: PoolManager<C>,
    settings: Settings,
    running: HashMap<String, InstanceTasks>,
}

impl<D, S, C> FleetManager<D, S, C>
where
    D: DirectoryStore,
    S: SampleStore,
    C: DbConnector,
{
    pub fn new(
        directory: D,
        samples: S,
        connector: C,
        cipher: Arc<dyn SecretCipher>,
        settings: Settings,
    ) -> Self {
        Self {
            registry: InstanceRegistry::new(directory),
            samples,
            pools: PoolManager::new(connector, cipher),
            settings,
            running: HashMap::new(),
        }
    }

    pub fn is_running(&self, name: &str) -> bool {
        self.running.contains_key(name)
    }

    pub fn running_count(&self) -> usize {
        self.running.len()
    }

    /// Top-level loop: initial load, then the change feed and the
    /// reconciliation timer, each failure-isolated, both applied here on
    /// the one dispatcher task.
    pub async fn run(&mut self, mut shutdown: watch::Receiver<bool>) {
        match self.registry.load().await {
            Ok(instances) => {
                info!(count = instances.len(), "instance directory loaded");
                for instance in instances {
                    self.start_collector(instance).await;
                }
            }
            Err(e) => {
                // Not fatal: reconciliation retries the load on its timer.
                error!(error = %e, "initial directory load failed");
            }
        }

        let (event_tx, mut event_rx) = mpsc::channel(64);
        let pump = tokio::spawn(watch_pump(
            self.registry.store().clone(),
            event_tx,
            shutdown.clone(),
            self.settings.restart_backoff,
        ));

        let mut reconcile = tokio::time::interval(self.settings.reconcile_interval);
        reconcile.set_missed_tick_behavior(MissedTickBehavior::Skip);
        // An interval fires immediately; the initial load already covered it.
        reconcile.tick().await;

        let mut feed_open = true;
        while !*shutdown.borrow() {
            tokio::select! {
                res = shutdown.changed() => {
                    if res.is_err() {
                        break;
                    }
                }
                event = event_rx.recv(), if feed_open => match event {
                    Some(event) => self.apply_change_event(event).await,
                    None => {
                        feed_open = false;
                        debug!("change feed pump ended");
                    }
                },
                _ = reconcile.tick() => {
                    match self.registry.reconcile().await {
                        Ok(diff) => {
                            if !diff.is_empty() {
                                info!(
                                    added = diff.added.len(),
                                    removed = diff.removed.len(),
                                    "reconciliation diff"
                                );
                            }
                            self.apply_reconcile_diff(diff).await;
                        }
                        Err(e) => warn!(error = %e, "reconciliation failed"),
                    }
                }
            }
        }

        info!("fleet manager stopping");
        self.stop_all().await;
        let _ = pump.await;
        info!("fleet manager stopped");
    }

    /// Applies one change-feed event. An upsert of a running instance is a
    /// credential/endpoint change: the old bundle is stopped, then a fresh
    /// one started against the new document.
    pub async fn apply_change_event(&mut self, event: ChangeEvent) {
        match event {
            ChangeEvent::Upsert(instance) => {
                self.registry.note_upsert(&instance.name);
                if self.running.contains_key(&instance.name) {
                    self.stop_collector(&instance.name).await;
                }
                self.start_collector(instance).await;
            }
            ChangeEvent::Remove(name) => {
                self.registry.note_remove(&name);
                self.stop_collector(&name).await;
            }
        }
    }

    /// Applies a reconciliation diff through the same idempotent paths.
    pub async fn apply_reconcile_diff(&mut self, diff: ReconcileDiff) {
        for name in diff.removed {
            self.stop_collector(&name).await;
        }
        for instance in diff.added {
            self.start_collector(instance).await;
        }
    }

    /// Starts the task bundle for an instance. No-op when already running;
    /// a pool failure leaves the instance unavailable without affecting the
    /// rest of the fleet.
    pub async fn start_collector(&mut self, instance: Instance) {
        if self.running.contains_key(&instance.name) {
            debug!(instance = %instance.name, "collectors already running");
            return;
        }

        let pool = match self.pools.create_pool(&instance).await {
            Ok(pool) => pool,
            Err(e) => {
                warn!(
                    instance = %instance.name,
                    error = %e,
                    "instance unavailable, collectors not started"
                );
                return;
            }
        };

        let (stop_tx, stop_rx) = watch::channel(false);
        let mut handles = Vec::with_capacity(3);

        // Slow-query sampling loop, restart-wrapped so a crashed loop comes
        // back after a backoff instead of silently dying.
        {
            let name = instance.name.clone();
            let pool = pool.clone();
            let samples = self.samples.clone();
            let threshold = self.settings.slow_threshold_secs;
            let tick = self.settings.tick_interval;
            let backoff = self.settings.restart_backoff;
            let stop = stop_rx.clone();
            let factory_stop = stop_rx.clone();
            handles.push(tokio::spawn(async move {
                sched::run_with_restart(stop, backoff, move || {
                    let collector = SlowQueryCollector::new(
                        name.clone(),
                        pool.clone(),
                        samples.clone(),
                        threshold,
                    );
                    let stop = factory_stop.clone();
                    async move { collector.run(stop, tick).await }
                })
                .await;
            }));
        }

        // Daily command-status snapshot.
        {
            let collector = CommandStatusCollector::new(
                instance.name.clone(),
                pool.clone(),
                self.samples.clone(),
            );
            let hour = self.settings.command_status_hour;
            let minute = self.settings.command_status_minute;
            let tz = self.settings.timezone;
            let stop = stop_rx.clone();
            handles.push(tokio::spawn(async move {
                sched::run_daily_at(stop, hour, minute, tz, move || {
                    let collector = collector.clone();
                    async move { collector.collect().await }
                })
                .await;
            }));
        }

        // Periodic disk-status snapshot.
        {
            let collector = DiskStatusCollector::new(
                instance.name.clone(),
                pool.clone(),
                self.samples.clone(),
            );
            let interval = self.settings.disk_status_interval;
            let stop = stop_rx.clone();
            handles.push(tokio::spawn(async move {
                sched::run_periodically(stop, interval, move || {
                    let collector = collector.clone();
                    async move { collector.collect().await }
                })
                .await;
            }));
        }

        self.running
            .insert(instance.name.clone(), InstanceTasks { stop: stop_tx, handles });
        info!(instance = %instance.name, "collectors started");
    }

    /// Stops an instance's task bundle and closes its pool, in that order.
    ///
    /// Blocks until every task has observed the stop signal and exited —
    /// only then is the pool closed, so no in-flight query can see a closed
    /// pool. Idempotent: a second call for the same name is a no-op.
    pub async fn stop_collector(&mut self, name: &str) {
        let Some(tasks) = self.running.remove(name) else {
            return;
        };

        let _ = tasks.stop.send(true);
        for handle in tasks.handles {
            if let Err(e) = handle.await {
                warn!(instance = %name, error = %e, "collector task panicked");
            }
        }
        self.pools.close_pool(name).await;
        info!(instance = %name, "collectors stopped");
    }

    /// Orderly shutdown of the whole fleet.
    pub async fn stop_all(&mut self) {
        let names: Vec<String> = self.running.keys().cloned().collect();
        for name in names {
            self.stop_collector(&name).await;
        }
        self.pools.close_all().await;
    }
}

/// Forwards directory change events into the dispatcher until shutdown,
/// resubscribing after feed failures. A broken feed only widens the window
/// that reconciliation already covers.
async fn watch_pump<D: DirectoryStore>(
    store: D,
    tx: mpsc::Sender<ChangeEvent>,
    mut shutdown: watch::Receiver<bool>,
    backoff: std::time::Duration,
) {
    loop {
        if *shutdown.borrow() {
            return;
        }
        let result = tokio::select! {
            result = store.watch_instances(tx.clone()) => result,
            _ = shutdown.changed() => return,
        };
        match result {
            Ok(()) => debug!("change feed ended, resubscribing"),
            Err(e) => warn!(error = %e, "change feed failed, resubscribing"),
        }
        if !sched::sleep_or_stop(&mut shutdown, backoff).await {
            return;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    use crate::crypto::PlainCipher;
    use crate::db::mock::MockConnector;
    use crate::store::MemoryStore;

    fn test_settings() -> Settings {
        Settings {
            tick_interval: Duration::from_millis(5),
            disk_status_interval: Duration::from_millis(50),
            reconcile_interval: Duration::from_millis(50),
            restart_backoff: Duration::from_millis(10),
            ..Settings::default()
        }
    }

    fn instance(name: &str) -> Instance {
        Instance {
            name: name.to_string(),
            host: "localhost".to_string(),
            port: 3306,
            user: "monitorer".to_string(),
            password: "pw".to_string(),
            db: String::new(),
            account: String::new(),
        }
    }

    fn manager(
        store: &MemoryStore,
        connector: &MockConnector,
    ) -> FleetManager<MemoryStore, MemoryStore, MockConnector> {
        FleetManager::new(
            store.clone(),
            store.clone(),
            connector.clone(),
            Arc::new(PlainCipher),
            test_settings(),
        )
    }

    async fn wait_for(mut cond: impl FnMut() -> bool) {
        tokio::time::timeout(Duration::from_secs(5), async {
            while !cond() {
                tokio::time::sleep(Duration::from_millis(5)).await;
            }
        })
        .await
        .expect("condition not reached in time");
    }

    #[tokio::test]
    async fn change_events_start_and_stop_collectors() {
        let store = MemoryStore::new();
        let connector = MockConnector::new();
        let mut fleet = manager(&store, &connector);

        fleet.apply_change_event(ChangeEvent::Upsert(instance("db-a"))).await;
        assert!(fleet.is_running("db-a"));
        assert_eq!(connector.connections().len(), 1);

        fleet.apply_change_event(ChangeEvent::Remove("db-a".to_string())).await;
        assert!(!fleet.is_running("db-a"));
        let pool = connector.pool("db-a").unwrap();
        assert_eq!(pool.close_count(), 1);
        assert!(!pool.lifecycle_violated());
    }

    #[tokio::test]
    async fn duplicate_removal_notifications_close_the_pool_once() {
        let store = MemoryStore::new();
        let connector = MockConnector::new();
        let mut fleet = manager(&store, &connector);

        fleet.apply_change_event(ChangeEvent::Upsert(instance("db-a"))).await;
        // Both the feed and the next reconciliation report the removal.
        fleet.apply_change_event(ChangeEvent::Remove("db-a".to_string())).await;
        fleet
            .apply_reconcile_diff(ReconcileDiff {
                added: Vec::new(),
                removed: vec!["db-a".to_string()],
            })
            .await;

        assert_eq!(connector.pool("db-a").unwrap().close_count(), 1);
    }

    #[tokio::test]
    async fn start_collector_is_idempotent() {
        let store = MemoryStore::new();
        let connector = MockConnector::new();
        let mut fleet = manager(&store, &connector);

        fleet.start_collector(instance("db-a")).await;
        fleet.start_collector(instance("db-a")).await;

        assert_eq!(connector.connections().len(), 1);
        assert_eq!(fleet.running_count(), 1);
        fleet.stop_all().await;
    }

    #[tokio::test]
    async fn upsert_of_running_instance_restarts_its_bundle() {
        let store = MemoryStore::new();
        let connector = MockConnector::new();
        let mut fleet = manager(&store, &connector);

        fleet.apply_change_event(ChangeEvent::Upsert(instance("db-a"))).await;
        let first_pool = connector.pool("db-a").unwrap();

        fleet.apply_change_event(ChangeEvent::Upsert(instance("db-a"))).await;
        assert!(fleet.is_running("db-a"));
        assert_eq!(connector.connections().len(), 2);
        assert_eq!(first_pool.close_count(), 1);
        assert!(!first_pool.lifecycle_violated());

        fleet.stop_all().await;
    }

    #[tokio::test]
    async fn unavailable_instance_does_not_affect_the_rest() {
        let store = MemoryStore::new();
        let connector = MockConnector::new();
        connector.fail_connect("db-bad");
        let mut fleet = manager(&store, &connector);

        fleet.apply_change_event(ChangeEvent::Upsert(instance("db-bad"))).await;
        fleet.apply_change_event(ChangeEvent::Upsert(instance("db-good"))).await;

        assert!(!fleet.is_running("db-bad"));
        assert!(fleet.is_running("db-good"));
        fleet.stop_all().await;
    }

    #[tokio::test]
    async fn pool_never_closes_under_an_in_flight_query() {
        let store = MemoryStore::new();
        let connector = MockConnector::new();
        let mut fleet = manager(&store, &connector);

        fleet.apply_change_event(ChangeEvent::Upsert(instance("db-a"))).await;
        let pool = connector.pool("db-a").unwrap();
        pool.set_query_delay(Duration::from_millis(50));

        // Let the sampling loop get a poll in flight, then stop.
        tokio::time::sleep(Duration::from_millis(20)).await;
        fleet.apply_change_event(ChangeEvent::Remove("db-a".to_string())).await;

        assert!(pool.is_closed());
        assert_eq!(pool.close_count(), 1);
        assert!(!pool.lifecycle_violated());
    }

    #[tokio::test]
    async fn feed_failure_is_retried_without_reconciliation() {
        let store = MemoryStore::new();
        let connector = MockConnector::new();
        // Reconciliation far in the future: only the feed can deliver.
        let settings = Settings {
            reconcile_interval: Duration::from_secs(3600),
            restart_backoff: Duration::from_millis(10),
            ..test_settings()
        };
        let mut fleet = FleetManager::new(
            store.clone(),
            store.clone(),
            connector.clone(),
            Arc::new(PlainCipher),
            settings,
        );

        store.fail_next_watch();
        let (shutdown_tx, shutdown_rx) = watch::channel(false);
        let handle = tokio::spawn(async move {
            fleet.run(shutdown_rx).await;
            fleet
        });

        // Give the pump time to fail once and resubscribe.
        tokio::time::sleep(Duration::from_millis(50)).await;
        store.upsert_instance(instance("db-a"));
        wait_for(|| connector.pool("db-a").is_some()).await;

        shutdown_tx.send(true).unwrap();
        handle.await.unwrap();
    }

    #[tokio::test]
    async fn run_reacts_to_feed_events_and_reconciliation() {
        let store = MemoryStore::new();
        let connector = MockConnector::new();
        let mut fleet = manager(&store, &connector);

        let (shutdown_tx, shutdown_rx) = watch::channel(false);
        let handle = tokio::spawn(async move {
            fleet.run(shutdown_rx).await;
            fleet
        });

        // Feed-driven start.
        store.upsert_instance(instance("db-a"));
        wait_for(|| connector.pool("db-a").is_some()).await;

        // Feed-driven stop, duplicated by the reconcile timer.
        store.remove_instance("db-a");
        wait_for(|| connector.pool("db-a").unwrap().close_count() == 1).await;

        // A change the feed never saw: reconciliation picks it up.
        store.upsert_instance_silently(instance("db-b"));
        wait_for(|| connector.pool("db-b").is_some()).await;

        shutdown_tx.send(true).unwrap();
        let fleet = handle.await.unwrap();
        assert_eq!(fleet.running_count(), 0);
        let pool_b = connector.pool("db-b").unwrap();
        assert_eq!(pool_b.close_count(), 1);
        assert!(!pool_b.lifecycle_violated());
        assert_eq!(connector.pool("db-a").unwrap().close_count(), 1);
    }
}
