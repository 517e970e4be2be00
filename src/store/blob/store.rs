//! The blob-backed [`Store`] implementation: write-ordered two-blob plan
//! layout, per-plan locking, single-flight reads, and retention-windowed
//! search — tying together `backend`, `lock`, `singleflight`, and
//! `recovery`.

use std::sync::Arc;

use async_trait::async_trait;
use futures::StreamExt;
use object_store::ObjectStore;

use crate::model::EntityId;

use super::backend::{is_outside_retention, BlobBackend, BlobStoreConfig};
use super::layout::{candidate_containers, plans_prefix};
use super::lock::PlanLockGroup;
use super::singleflight::SingleFlight;
use crate::store::contract::{ListResult, RecoveryReport, ResultStream, SearchFilters, Store};
use crate::store::error::StoreError;

pub struct BlobStore {
    backend: Arc<BlobBackend>,
    locks: PlanLockGroup,
    read_sf: SingleFlight<EntityId, crate::model::Plan, StoreError>,
    exists_sf: SingleFlight<EntityId, bool, StoreError>,
}

impl BlobStore {
    pub fn new(object_store: Arc<dyn ObjectStore>, config: BlobStoreConfig) -> Self {
        Self {
            backend: Arc::new(BlobBackend::new(object_store, config)),
            locks: PlanLockGroup::new(),
            read_sf: SingleFlight::new(),
            exists_sf: SingleFlight::new(),
        }
    }

    fn retention_days(&self) -> u32 {
        self.backend.config.retention_days
    }

    async fn scan_entries(&self) -> Result<Vec<ListResult>, StoreError> {
        let today = chrono::Utc::now().date_naive();
        let containers = candidate_containers(&self.backend.config.prefix, today, self.retention_days());

        let mut results = Vec::new();
        for container in containers {
            let prefix = plans_prefix(&container);
            let mut listing = self.backend.object_store.list(Some(&prefix));
            while let Some(meta) = listing.next().await {
                let meta = meta.map_err(|e| StoreError::StorageGet(format!("list {prefix}: {e}")))?;
                if !meta.location.as_ref().ends_with("-entry.json") {
                    continue;
                }
                let entry: super::entry::PlanEntry = match self.backend.get_json(&meta.location).await {
                    Ok(e) => e,
                    Err(StoreError::NotFound(_)) => continue,
                    Err(e) => return Err(e),
                };
                results.push(ListResult {
                    plan_id: entry.plan_id,
                    group_id: entry.group_id,
                    name: entry.name,
                    descr: entry.descr,
                    submit_time: entry.submit_time,
                    state: entry.state,
                    failure_reason: entry.failure_reason,
                });
            }
        }
        Ok(results)
    }
}

#[async_trait]
impl Store for BlobStore {
    #[tracing::instrument(skip_all, fields(plan_id = %plan.id))]
    async fn create(&self, plan: &crate::model::Plan) -> Result<(), StoreError> {
        let _guard = self.locks.write(plan.id).await;
        self.backend.write_create(plan).await
    }

    #[tracing::instrument(skip(self))]
    async fn read(&self, id: EntityId) -> Result<crate::model::Plan, StoreError> {
        if is_outside_retention(id, self.retention_days()) {
            return Err(StoreError::NotFound(format!("plan {id} outside retention window")));
        }
        let _guard = self.locks.read(id).await;
        let backend = self.backend.clone();
        self.read_sf
            .run(id, async move { backend.read_plan_tree(id).await })
            .await
    }

    #[tracing::instrument(skip(self))]
    async fn exists(&self, id: EntityId) -> Result<bool, StoreError> {
        if is_outside_retention(id, self.retention_days()) {
            return Ok(false);
        }
        let _guard = self.locks.read(id).await;
        let backend = self.backend.clone();
        self.exists_sf
            .run(id, async move {
                match backend.read_entry(id).await {
                    Ok(_) => Ok(true),
                    Err(StoreError::NotFound(_)) => Ok(false),
                    Err(e) => Err(e),
                }
            })
            .await
    }

    async fn search<'a>(&'a self, filters: SearchFilters) -> Result<ResultStream<'a, ListResult>, StoreError> {
        let mut results = self.scan_entries().await?;
        results.retain(|r| filters.matches(r));
        results.sort_by(|a, b| b.submit_time.cmp(&a.submit_time));
        Ok(Box::pin(futures::stream::iter(results.into_iter().map(Ok))))
    }

    async fn list<'a>(&'a self, limit: usize) -> Result<ResultStream<'a, ListResult>, StoreError> {
        let mut results = self.scan_entries().await?;
        results.sort_by(|a, b| b.submit_time.cmp(&a.submit_time));
        results.truncate(limit);
        Ok(Box::pin(futures::stream::iter(results.into_iter().map(Ok))))
    }

    async fn update_plan(&self, plan: &crate::model::Plan) -> Result<(), StoreError> {
        let _guard = self.locks.write(plan.id).await;
        if plan.state_fields().status.is_terminal() {
            self.backend.write_completion(plan).await?;
            self.locks.release(plan.id);
            Ok(())
        } else {
            self.backend.write_entry_update(plan).await
        }
    }

    async fn update_block(&self, plan_id: EntityId, block: &crate::model::Block) -> Result<(), StoreError> {
        let _guard = self.locks.write(plan_id).await;
        self.backend.update_block(plan_id, block).await
    }

    async fn update_checks(&self, plan_id: EntityId, checks: &crate::model::Checks) -> Result<(), StoreError> {
        let _guard = self.locks.write(plan_id).await;
        self.backend.update_checks(plan_id, checks).await
    }

    async fn update_sequence(&self, plan_id: EntityId, sequence: &crate::model::Sequence) -> Result<(), StoreError> {
        let _guard = self.locks.write(plan_id).await;
        self.backend.update_sequence(plan_id, sequence).await
    }

    async fn update_action(&self, plan_id: EntityId, action: &crate::model::Action) -> Result<(), StoreError> {
        let _guard = self.locks.write(plan_id).await;
        self.backend.update_action(plan_id, action).await
    }

    #[tracing::instrument(skip(self))]
    async fn delete(&self, id: EntityId) -> Result<(), StoreError> {
        let _guard = self.locks.write(id).await;
        self.backend.delete_tree(id).await?;
        self.locks.release(id);
        Ok(())
    }

    #[tracing::instrument(skip(self))]
    async fn recovery(&self) -> Result<RecoveryReport, StoreError> {
        super::recovery::run(&self.backend).await
    }
}
