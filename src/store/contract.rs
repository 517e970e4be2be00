//! The durable store contract the executor consumes.
//!
//! An `async_trait` with one method per operation and a dedicated
//! `thiserror` error enum. Every operation here is mandatory — there are
//! no optional worker-registry or circuit-breaker methods to implement
//! selectively.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use futures::stream::BoxStream;
use serde::{Deserialize, Serialize};

use crate::model::{Action, Block, Checks, EntityId, FailureReason, Plan, Sequence, StateFields};

use super::error::StoreError;

/// Filters accepted by [`Store::search`].
#[derive(Debug, Clone, Default)]
pub struct SearchFilters {
    pub ids: Vec<EntityId>,
    pub group_ids: Vec<EntityId>,
    pub statuses: Vec<crate::model::Status>,
}

impl SearchFilters {
    pub fn matches(&self, result: &ListResult) -> bool {
        (self.ids.is_empty() || self.ids.contains(&result.plan_id))
            && (self.group_ids.is_empty()
                || result
                    .group_id
                    .map(|g| self.group_ids.contains(&g))
                    .unwrap_or(false))
            && (self.statuses.is_empty() || self.statuses.contains(&result.state.status))
    }
}

/// One row of a `search`/`list` stream — the denormalized fields carried on
/// a planEntry's blob metadata.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct ListResult {
    pub plan_id: EntityId,
    pub group_id: Option<EntityId>,
    pub name: String,
    pub descr: String,
    pub submit_time: DateTime<Utc>,
    pub state: StateFields,
    pub failure_reason: FailureReason,
}

/// Outcome of a `recovery()` pass: how many partial writes were repaired.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct RecoveryReport {
    pub orphan_entries_deleted: usize,
    pub sub_objects_recreated: usize,
}

pub type ResultStream<'a, T> = BoxStream<'a, Result<T, StoreError>>;

/// Operations the executor requires of a durable store.
#[async_trait]
pub trait Store: Send + Sync + 'static {
    /// Persist a new plan tree atomically-as-possible.
    async fn create(&self, plan: &Plan) -> Result<(), StoreError>;

    /// Read a plan, reconstructing it from however the backend lays it out.
    /// Retention enforcement: an id older than the retention window reads
    /// as [`StoreError::NotFound`] even if bytes remain.
    async fn read(&self, id: EntityId) -> Result<Plan, StoreError>;

    async fn exists(&self, id: EntityId) -> Result<bool, StoreError>;

    /// Plans matching `filters`, most recent submit time first.
    async fn search<'a>(&'a self, filters: SearchFilters) -> Result<ResultStream<'a, ListResult>, StoreError>;

    /// The `limit` most recently submitted plans.
    async fn list<'a>(&'a self, limit: usize) -> Result<ResultStream<'a, ListResult>, StoreError>;

    async fn update_plan(&self, plan: &Plan) -> Result<(), StoreError>;
    async fn update_block(&self, plan_id: EntityId, block: &Block) -> Result<(), StoreError>;
    async fn update_checks(&self, plan_id: EntityId, checks: &Checks) -> Result<(), StoreError>;
    async fn update_sequence(&self, plan_id: EntityId, sequence: &Sequence) -> Result<(), StoreError>;
    async fn update_action(&self, plan_id: EntityId, action: &Action) -> Result<(), StoreError>;

    /// Remove all bytes for a plan.
    async fn delete(&self, id: EntityId) -> Result<(), StoreError>;

    /// Repair partial writes left by a crashed writer.
    async fn recovery(&self) -> Result<RecoveryReport, StoreError>;
}
