//! Per-plan lock group: a sharded map of reader-writer locks keyed by plan
//! id. Entries are allocated lazily on first use and
//! removed when the plan reaches a terminal state, so the map never grows
//! unbounded across a long-running engine's lifetime.

use std::sync::Arc;

use dashmap::DashMap;
use tokio::sync::{OwnedRwLockReadGuard, OwnedRwLockWriteGuard, RwLock};

use crate::model::EntityId;

#[derive(Default)]
pub struct PlanLockGroup {
    locks: DashMap<EntityId, Arc<RwLock<()>>>,
}

impl PlanLockGroup {
    pub fn new() -> Self {
        Self::default()
    }

    fn entry(&self, plan_id: EntityId) -> Arc<RwLock<()>> {
        self.locks
            .entry(plan_id)
            .or_insert_with(|| Arc::new(RwLock::new(())))
            .clone()
    }

    /// Take the read lock: concurrent reads proceed in parallel with each
    /// other but never observe a torn tree mid-write.
    pub async fn read(&self, plan_id: EntityId) -> OwnedRwLockReadGuard<()> {
        self.entry(plan_id).read_owned().await
    }

    /// Take the write lock: state writes for the same object are serialized
    /// strictly by the per-plan lock.
    pub async fn write(&self, plan_id: EntityId) -> OwnedRwLockWriteGuard<()> {
        self.entry(plan_id).write_owned().await
    }

    /// Drop the lock entry for a plan that has reached a terminal state.
    /// Safe to call even while a guard for this plan is still held
    /// elsewhere — the `Arc` keeps the lock alive for existing holders;
    /// only the map's own reference is removed.
    pub fn release(&self, plan_id: EntityId) {
        self.locks.remove(&plan_id);
    }

    pub fn len(&self) -> usize {
        self.locks.len()
    }

    pub fn is_empty(&self) -> bool {
        self.locks.is_empty()
    }
}
