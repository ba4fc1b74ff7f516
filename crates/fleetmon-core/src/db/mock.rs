//! Scripted database client for tests.
//!
//! `MockConnector` hands out `MockPool`s whose process-list responses are
//! scripted per tick. The pool records lifecycle violations — a query on a
//! closed pool, or a close while a query is still in flight — so tests can
//! assert the fleet manager's orderly-stop guarantee.

use std::collections::{HashMap, HashSet, VecDeque};
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use super::{DbConnector, DbError, DbPool};
use crate::model::{Instance, ProcessRow};

#[derive(Default)]
struct PoolState {
    polls: Mutex<VecDeque<Result<Vec<ProcessRow>, DbError>>>,
    status: Mutex<HashMap<String, Vec<(String, String)>>>,
    query_delay: Mutex<Duration>,
    closed: AtomicBool,
    close_count: AtomicUsize,
    in_flight: AtomicUsize,
    violation: AtomicBool,
    poll_count: AtomicUsize,
}

/// A scripted stand-in for one instance's pool.
#[derive(Clone, Default)]
pub struct MockPool {
    state: Arc<PoolState>,
}

impl MockPool {
    pub fn new() -> Self {
        Self::default()
    }

    /// Queues one process-list response; once the script runs dry, polls
    /// return an empty list.
    pub fn push_poll(&self, rows: Vec<ProcessRow>) {
        self.state.polls.lock().unwrap().push_back(Ok(rows));
    }

    pub fn push_poll_error(&self, error: DbError) {
        self.state.polls.lock().unwrap().push_back(Err(error));
    }

    /// Sets the canned response for a `SHOW GLOBAL STATUS LIKE` pattern.
    pub fn set_status(&self, like: &str, rows: Vec<(&str, &str)>) {
        let rows = rows
            .into_iter()
            .map(|(n, v)| (n.to_string(), v.to_string()))
            .collect();
        self.state.status.lock().unwrap().insert(like.to_string(), rows);
    }

    /// Makes every query take this long, to hold a tick mid-flight.
    pub fn set_query_delay(&self, delay: Duration) {
        *self.state.query_delay.lock().unwrap() = delay;
    }

    pub fn is_closed(&self) -> bool {
        self.state.closed.load(Ordering::SeqCst)
    }

    pub fn close_count(&self) -> usize {
        self.state.close_count.load(Ordering::SeqCst)
    }

    pub fn poll_count(&self) -> usize {
        self.state.poll_count.load(Ordering::SeqCst)
    }

    /// True if the pool was queried after close, or closed mid-query.
    pub fn lifecycle_violated(&self) -> bool {
        self.state.violation.load(Ordering::SeqCst)
    }

    async fn enter(&self) -> Result<(), DbError> {
        if self.state.closed.load(Ordering::SeqCst) {
            self.state.violation.store(true, Ordering::SeqCst);
            return Err(DbError::Connection("pool already closed".to_string()));
        }
        self.state.in_flight.fetch_add(1, Ordering::SeqCst);
        let delay = *self.state.query_delay.lock().unwrap();
        if delay > Duration::ZERO {
            tokio::time::sleep(delay).await;
        }
        Ok(())
    }

    fn leave(&self) {
        self.state.in_flight.fetch_sub(1, Ordering::SeqCst);
    }
}

impl DbPool for MockPool {
    async fn process_list(&self) -> Result<Vec<ProcessRow>, DbError> {
        self.enter().await?;
        self.state.poll_count.fetch_add(1, Ordering::SeqCst);
        let next = self.state.polls.lock().unwrap().pop_front();
        self.leave();
        next.unwrap_or_else(|| Ok(Vec::new()))
    }

    async fn global_status(&self, like: &str) -> Result<Vec<(String, String)>, DbError> {
        self.enter().await?;
        let result = self
            .state
            .status
            .lock()
            .unwrap()
            .get(like)
            .cloned()
            .ok_or_else(|| DbError::Query(format!("no scripted status for {:?}", like)));
        self.leave();
        result
    }

    async fn close(&self) {
        if self.state.in_flight.load(Ordering::SeqCst) > 0 {
            self.state.violation.store(true, Ordering::SeqCst);
        }
        self.state.closed.store(true, Ordering::SeqCst);
        self.state.close_count.fetch_add(1, Ordering::SeqCst);
    }
}

#[derive(Default)]
struct ConnectorState {
    fail_connect: HashSet<String>,
    pools: HashMap<String, MockPool>,
    connections: Vec<(String, String)>,
}

/// Factory handing out scripted pools, one per instance name.
#[derive(Clone, Default)]
pub struct MockConnector {
    state: Arc<Mutex<ConnectorState>>,
}

impl MockConnector {
    pub fn new() -> Self {
        Self::default()
    }

    /// Makes `connect` fail for this instance name.
    pub fn fail_connect(&self, name: &str) {
        self.state.lock().unwrap().fail_connect.insert(name.to_string());
    }

    /// The most recently created pool for an instance, if any.
    pub fn pool(&self, name: &str) -> Option<MockPool> {
        self.state.lock().unwrap().pools.get(name).cloned()
    }

    /// `(instance_name, password)` pairs seen by `connect`, in order.
    pub fn connections(&self) -> Vec<(String, String)> {
        self.state.lock().unwrap().connections.clone()
    }
}

impl DbConnector for MockConnector {
    type Pool = MockPool;

    async fn connect(&self, instance: &Instance, password: &str) -> Result<Self::Pool, DbError> {
        let mut state = self.state.lock().unwrap();
        state
            .connections
            .push((instance.name.clone(), password.to_string()));
        if state.fail_connect.contains(&instance.name) {
            return Err(DbError::Connection("scripted connect failure".to_string()));
        }
        let pool = MockPool::new();
        state.pools.insert(instance.name.clone(), pool.clone());
        Ok(pool)
    }
}
