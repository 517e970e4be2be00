//! Blob I/O and tree (de)serialization, independent of locking/dedup so it
//! can be cloned into a `'static` single-flight future.

use std::collections::HashMap;
use std::sync::Arc;

use bytes::Bytes;
use chrono::Utc;
use futures::future::try_join_all;
use object_store::path::Path;
use object_store::{ObjectStore, PutPayload};
use serde::de::DeserializeOwned;
use serde::Serialize;

use crate::model::{Action, Block, Checks, EntityId, Node, Plan, Sequence, Walk};
use crate::retry::RetryPolicy;

use super::entry::{
    block_from_entry, checks_from_entry, plan_from_entry, sequence_from_entry, BlockEntry,
    ChecksEntry, PlanEntry, SequenceEntry,
};
use super::layout::{
    action_path, block_path, checks_path, container_for_id, plan_entry_path, plan_object_path,
    sequence_path,
};
use crate::store::error::StoreError;

#[derive(Debug, Clone)]
pub struct BlobStoreConfig {
    /// Container name prefix; containers are `<prefix>-YYYY-MM-DD`.
    pub prefix: String,
    /// Days back from today a plan remains visible to `read`/`search`/`list`.
    pub retention_days: u32,
    /// Backoff applied to retriable backend failures: calls retry with
    /// exponential backoff on retriable codes.
    pub retry_policy: RetryPolicy,
}

impl Default for BlobStoreConfig {
    fn default() -> Self {
        Self {
            prefix: "foreman".to_string(),
            retention_days: 14,
            retry_policy: RetryPolicy::exponential(),
        }
    }
}

impl BlobStoreConfig {
    pub fn with_prefix(mut self, prefix: impl Into<String>) -> Self {
        self.prefix = prefix.into();
        self
    }

    pub fn with_retention_days(mut self, days: u32) -> Self {
        self.retention_days = days;
        self
    }

    pub fn with_retry_policy(mut self, retry_policy: RetryPolicy) -> Self {
        self.retry_policy = retry_policy;
        self
    }
}

/// Retry `op` per `policy` while it keeps returning a retriable
/// [`StoreError`]; a non-retriable error propagates immediately.
async fn with_retry<T, F, Fut>(policy: &RetryPolicy, mut op: F) -> Result<T, StoreError>
where
    F: FnMut() -> Fut,
    Fut: std::future::Future<Output = Result<T, StoreError>>,
{
    let mut attempt: u32 = 0;
    loop {
        attempt += 1;
        match op().await {
            Ok(v) => return Ok(v),
            Err(e) if e.is_retriable() && policy.has_attempts_remaining(attempt) => {
                tokio::time::sleep(policy.delay_for_attempt(attempt + 1)).await;
            }
            Err(e) => return Err(e),
        }
    }
}

/// Whether `id`'s embedded creation time falls outside the retention
/// window: `read(id)` returns not-found whenever `time(id) < now -
/// retentionDays`, regardless of backing bytes.
pub fn is_outside_retention(id: EntityId, retention_days: u32) -> bool {
    let cutoff = Utc::now() - chrono::Duration::days(retention_days as i64);
    id.timestamp() < cutoff
}

pub struct BlobBackend {
    pub object_store: Arc<dyn ObjectStore>,
    pub config: BlobStoreConfig,
}

impl BlobBackend {
    pub fn new(object_store: Arc<dyn ObjectStore>, config: BlobStoreConfig) -> Self {
        Self {
            object_store,
            config,
        }
    }

    pub fn container_for(&self, id: EntityId) -> String {
        container_for_id(&self.config.prefix, id)
    }

    pub async fn put_json<T: Serialize + Sync>(&self, path: &Path, value: &T) -> Result<(), StoreError> {
        let bytes = serde_json::to_vec(value)
            .map_err(|e| StoreError::StoragePut(format!("serialize {path}: {e}")))?;
        with_retry(&self.config.retry_policy, || {
            let bytes = bytes.clone();
            async move {
                self.object_store
                    .put(path, PutPayload::from(bytes))
                    .await
                    .map(|_| ())
                    .map_err(|e| StoreError::StoragePut(format!("put {path}: {e}")))
            }
        })
        .await
    }

    pub async fn get_json<T: DeserializeOwned>(&self, path: &Path) -> Result<T, StoreError> {
        let bytes = self.get_bytes(path).await?;
        serde_json::from_slice(&bytes)
            .map_err(|e| StoreError::StorageGet(format!("decode {path}: {e}")))
    }

    async fn get_bytes(&self, path: &Path) -> Result<Bytes, StoreError> {
        with_retry(&self.config.retry_policy, || async move {
            match self.object_store.get(path).await {
                Ok(result) => result
                    .bytes()
                    .await
                    .map_err(|e| StoreError::StorageGet(format!("read {path}: {e}"))),
                Err(object_store::Error::NotFound { .. }) => {
                    Err(StoreError::NotFound(format!("blob not found: {path}")))
                }
                Err(e) => Err(StoreError::StorageGet(format!("get {path}: {e}"))),
            }
        })
        .await
    }

    pub async fn exists(&self, path: &Path) -> Result<bool, StoreError> {
        with_retry(&self.config.retry_policy, || async move {
            match self.object_store.head(path).await {
                Ok(_) => Ok(true),
                Err(object_store::Error::NotFound { .. }) => Ok(false),
                Err(e) => Err(StoreError::StorageGet(format!("head {path}: {e}"))),
            }
        })
        .await
    }

    /// Delete a blob, treating "already gone" as success.
    pub async fn try_delete(&self, path: &Path) -> Result<(), StoreError> {
        with_retry(&self.config.retry_policy, || async move {
            match self.object_store.delete(path).await {
                Ok(()) => Ok(()),
                Err(object_store::Error::NotFound { .. }) => Ok(()),
                Err(e) => Err(StoreError::StorageDelete(format!("delete {path}: {e}"))),
            }
        })
        .await
    }

    /// Write-ordered create: entry, then every sub-object blob (parallel —
    /// order among these does not matter), then the plan object last. Each
    /// step happens-before the next.
    #[tracing::instrument(skip_all, fields(plan_id = %plan.id))]
    pub async fn write_create(&self, plan: &Plan) -> Result<(), StoreError> {
        let container = self.container_for(plan.id);

        self.put_json(&plan_entry_path(&container, plan.id), &PlanEntry::from_plan(plan))
            .await?;

        let mut uploads: Vec<_> = Vec::new();
        for item in Walk::new(plan) {
            let os = self.object_store.clone();
            let container = container.clone();
            let plan_id = plan.id;
            match item.value {
                Node::Checks(c) => {
                    let entry = ChecksEntry::from_checks(c);
                    uploads.push(Box::pin(async move {
                        put_json_on(&os, &checks_path(&container, plan_id, entry.id), &entry).await
                    })
                        as std::pin::Pin<Box<dyn std::future::Future<Output = Result<(), StoreError>> + Send>>);
                }
                Node::Sequence(s) => {
                    let entry = SequenceEntry::from_sequence(s);
                    uploads.push(Box::pin(async move {
                        put_json_on(&os, &sequence_path(&container, plan_id, entry.id), &entry).await
                    }));
                }
                Node::Block(b) => {
                    let entry = BlockEntry::from_block(b);
                    uploads.push(Box::pin(async move {
                        put_json_on(&os, &block_path(&container, plan_id, entry.id), &entry).await
                    }));
                }
                Node::Action(a) => {
                    let action = a.clone();
                    uploads.push(Box::pin(async move {
                        put_json_on(&os, &action_path(&container, plan_id, action.id), &action).await
                    }));
                }
                Node::Plan(_) => {}
            }
        }
        try_join_all(uploads).await?;

        self.put_json(&plan_object_path(&container, plan.id), plan).await
    }

    /// Update during execution (plan Running): planEntry only, the second
    /// step of the write-ordering.
    pub async fn write_entry_update(&self, plan: &Plan) -> Result<(), StoreError> {
        let container = self.container_for(plan.id);
        self.put_json(&plan_entry_path(&container, plan.id), &PlanEntry::from_plan(plan))
            .await
    }

    /// Re-upload the plan object on completion, the third write-ordering
    /// step, and refresh the entry alongside it so both reflect the final
    /// state.
    pub async fn write_completion(&self, plan: &Plan) -> Result<(), StoreError> {
        let container = self.container_for(plan.id);
        self.put_json(&plan_entry_path(&container, plan.id), &PlanEntry::from_plan(plan))
            .await?;
        self.put_json(&plan_object_path(&container, plan.id), plan).await
    }

    pub async fn update_block(&self, plan_id: EntityId, block: &Block) -> Result<(), StoreError> {
        let container = self.container_for(plan_id);
        self.put_json(&block_path(&container, plan_id, block.id), &BlockEntry::from_block(block))
            .await
    }

    pub async fn update_checks(&self, plan_id: EntityId, checks: &Checks) -> Result<(), StoreError> {
        let container = self.container_for(plan_id);
        self.put_json(&checks_path(&container, plan_id, checks.id), &ChecksEntry::from_checks(checks))
            .await
    }

    pub async fn update_sequence(&self, plan_id: EntityId, sequence: &Sequence) -> Result<(), StoreError> {
        let container = self.container_for(plan_id);
        self.put_json(
            &sequence_path(&container, plan_id, sequence.id),
            &SequenceEntry::from_sequence(sequence),
        )
        .await
    }

    pub async fn update_action(&self, plan_id: EntityId, action: &Action) -> Result<(), StoreError> {
        let container = self.container_for(plan_id);
        self.put_json(&action_path(&container, plan_id, action.id), action)
            .await
    }

    /// Whether the entry at `path` describes a terminal (non-Running) plan.
    pub async fn read_entry(&self, id: EntityId) -> Result<PlanEntry, StoreError> {
        let container = self.container_for(id);
        self.get_json(&plan_entry_path(&container, id)).await
    }

    pub async fn read_object(&self, id: EntityId) -> Result<Plan, StoreError> {
        let container = self.container_for(id);
        self.get_json(&plan_object_path(&container, id)).await
    }

    /// Reconstruct a plan: the full object for terminal plans, or the
    /// entry + sub-object blobs for a plan still `Running`.
    pub async fn read_plan_tree(&self, id: EntityId) -> Result<Plan, StoreError> {
        let entry = self.read_entry(id).await?;

        if entry.state.status.is_terminal() {
            return match self.read_object(id).await {
                Ok(plan) => Ok(plan),
                Err(StoreError::NotFound(_)) => Err(StoreError::NotFound(format!(
                    "plan {id} has an entry but no object; recovery has not run"
                ))),
                Err(e) => Err(e),
            };
        }

        self.read_running_tree(entry).await
    }

    async fn read_running_tree(&self, entry: PlanEntry) -> Result<Plan, StoreError> {
        let container = self.container_for(entry.plan_id);
        let plan_id = entry.plan_id;

        let mut block_entries: HashMap<EntityId, BlockEntry> = HashMap::new();
        for block_id in &entry.blocks {
            let be: BlockEntry = self.get_json(&block_path(&container, plan_id, *block_id)).await?;
            block_entries.insert(*block_id, be);
        }

        let mut checks_ids: Vec<EntityId> =
            [entry.bypass, entry.pre, entry.cont, entry.post, entry.deferred]
                .into_iter()
                .flatten()
                .collect();
        let mut sequence_ids: Vec<EntityId> = Vec::new();
        for be in block_entries.values() {
            checks_ids.extend([be.bypass, be.pre, be.cont, be.post, be.deferred].into_iter().flatten());
            sequence_ids.extend(be.sequences.iter().copied());
        }

        let mut checks_entries: HashMap<EntityId, ChecksEntry> = HashMap::new();
        for id in &checks_ids {
            let ce: ChecksEntry = self.get_json(&checks_path(&container, plan_id, *id)).await?;
            checks_entries.insert(*id, ce);
        }
        let mut sequence_entries: HashMap<EntityId, SequenceEntry> = HashMap::new();
        for id in &sequence_ids {
            let se: SequenceEntry = self.get_json(&sequence_path(&container, plan_id, *id)).await?;
            sequence_entries.insert(*id, se);
        }

        let mut action_ids: Vec<EntityId> = Vec::new();
        for ce in checks_entries.values() {
            action_ids.extend(ce.actions.iter().copied());
        }
        for se in sequence_entries.values() {
            action_ids.extend(se.actions.iter().copied());
        }
        let mut actions_by_id: HashMap<EntityId, Action> = HashMap::new();
        for id in &action_ids {
            let a: Action = self.get_json(&action_path(&container, plan_id, *id)).await?;
            actions_by_id.insert(*id, a);
        }

        let checks_by_id: HashMap<EntityId, Checks> = checks_entries
            .into_iter()
            .map(|(id, ce)| (id, checks_from_entry(ce, &actions_by_id)))
            .collect();
        let sequences_by_id: HashMap<EntityId, Sequence> = sequence_entries
            .into_iter()
            .map(|(id, se)| (id, sequence_from_entry(se, &actions_by_id)))
            .collect();
        let blocks_by_id: HashMap<EntityId, Block> = block_entries
            .into_iter()
            .map(|(id, be)| (id, block_from_entry(be, &checks_by_id, &sequences_by_id)))
            .collect();

        Ok(plan_from_entry(entry, &checks_by_id, &blocks_by_id))
    }

    /// Delete every blob belonging to a plan. Idempotent: a plan that no
    /// longer exists deletes cleanly.
    pub async fn delete_tree(&self, id: EntityId) -> Result<(), StoreError> {
        let container = self.container_for(id);

        match self.read_plan_tree(id).await {
            Ok(plan) => {
                for item in Walk::new(&plan) {
                    match item.value {
                        Node::Checks(c) => self.try_delete(&checks_path(&container, id, c.id)).await?,
                        Node::Sequence(s) => self.try_delete(&sequence_path(&container, id, s.id)).await?,
                        Node::Block(b) => self.try_delete(&block_path(&container, id, b.id)).await?,
                        Node::Action(a) => self.try_delete(&action_path(&container, id, a.id)).await?,
                        Node::Plan(_) => {}
                    }
                }
            }
            Err(StoreError::NotFound(_)) => {}
            Err(e) => return Err(e),
        }

        self.try_delete(&plan_entry_path(&container, id)).await?;
        self.try_delete(&plan_object_path(&container, id)).await
    }
}

async fn put_json_on<T: Serialize + Sync>(
    object_store: &Arc<dyn ObjectStore>,
    path: &Path,
    value: &T,
) -> Result<(), StoreError> {
    let bytes = serde_json::to_vec(value)
        .map_err(|e| StoreError::StoragePut(format!("serialize {path}: {e}")))?;
    object_store
        .put(path, PutPayload::from(bytes))
        .await
        .map(|_| ())
        .map_err(|e| StoreError::StoragePut(format!("put {path}: {e}")))
}
