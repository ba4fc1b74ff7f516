//! Instance registry: the source of truth for fleet membership.
//!
//! Wraps the directory store with membership bookkeeping. The change feed is
//! best-effort (no resume token is kept), so [`InstanceRegistry::reconcile`]
//! periodically diffs a fresh load against the last known membership and
//! reports what the feed missed. Membership identity is the instance name;
//! credential changes for an unchanged name travel through the feed's update
//! events, not through reconciliation.

use std::collections::{HashMap, HashSet};

use crate::model::{Instance, ReconcileDiff};
use crate::store::{DirectoryStore, StoreError};

pub struct InstanceRegistry<D: DirectoryStore> {
    store: D,
    /// Names seen at the last load/reconcile, adjusted by feed events.
    known: HashSet<String>,
}

impl<D: DirectoryStore> InstanceRegistry<D> {
    pub fn new(store: D) -> Self {
        Self {
            store,
            known: HashSet::new(),
        }
    }

    pub fn store(&self) -> &D {
        &self.store
    }

    /// Full read of the directory. Resets the known membership.
    pub async fn load(&mut self) -> Result<Vec<Instance>, StoreError> {
        let instances = dedup_by_name(self.store.load_instances().await?);
        self.known = instances.iter().map(|i| i.name.clone()).collect();
        Ok(instances)
    }

    /// Diffs a fresh load against the last known membership and replaces it.
    ///
    /// The correctness backstop for dropped feed events: anything the feed
    /// missed shows up in the next diff, at most one interval late.
    pub async fn reconcile(&mut self) -> Result<ReconcileDiff, StoreError> {
        let fresh = dedup_by_name(self.store.load_instances().await?);
        let fresh_names: HashSet<String> = fresh.iter().map(|i| i.name.clone()).collect();

        let added = fresh
            .iter()
            .filter(|i| !self.known.contains(&i.name))
            .cloned()
            .collect();
        let removed = self
            .known
            .iter()
            .filter(|name| !fresh_names.contains(*name))
            .cloned()
            .collect();

        self.known = fresh_names;
        Ok(ReconcileDiff { added, removed })
    }

    /// Records a feed-applied upsert so reconciliation does not re-report it.
    pub fn note_upsert(&mut self, name: &str) {
        self.known.insert(name.to_string());
    }

    /// Records a feed-applied removal.
    pub fn note_remove(&mut self, name: &str) {
        self.known.remove(name);
    }
}

/// Collapses duplicate names, last occurrence wins, first-seen order kept.
fn dedup_by_name(instances: Vec<Instance>) -> Vec<Instance> {
    let mut index: HashMap<String, usize> = HashMap::new();
    let mut out: Vec<Instance> = Vec::with_capacity(instances.len());
    for instance in instances {
        match index.get(&instance.name) {
            Some(&pos) => out[pos] = instance,
            None => {
                index.insert(instance.name.clone(), out.len());
                out.push(instance);
            }
        }
    }
    out
}
