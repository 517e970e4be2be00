//! Execution service: `New`, `Start`, `Stop`, `Wait`.
//!
//! Keeps two maps keyed by plan ID — cancel handles and completion
//! signals — rather than one global lock.

use std::sync::Arc;
use std::time::Duration;

use futures::StreamExt;
use tokio::sync::watch;
use tokio_util::sync::CancellationToken;

use crate::model::{EntityId, FailureReason, Node, Plan, Status, Walk};
use crate::plugin::PluginRegistry;
use crate::store::{SearchFilters, Store};

use super::error::ExecutorError;
use super::plan_machine::run_plan;
use super::recovery::reset_running_subtree;

/// Options recognized by `ExecutionService::new`.
#[derive(Debug, Clone)]
pub struct ExecutorConfig {
    /// A plan found Running at boot is resumed only if its last-known
    /// activity is within this window; otherwise it is failed with
    /// `ExceedRecovery`.
    pub max_last_update: Duration,
    /// `Start` rejects a plan whose `SubmitTime` is older than this.
    pub max_submit: Duration,
}

impl Default for ExecutorConfig {
    fn default() -> Self {
        Self {
            max_last_update: Duration::from_secs(30 * 60),
            max_submit: Duration::from_secs(30 * 60),
        }
    }
}

/// Owns every in-flight plan machine.
pub struct ExecutionService {
    store: Arc<dyn Store>,
    registry: PluginRegistry,
    config: ExecutorConfig,
    cancels: dashmap::DashMap<EntityId, CancellationToken>,
    completions: dashmap::DashMap<EntityId, watch::Receiver<bool>>,
}

impl ExecutionService {
    /// Initialize every registered plugin (any failure aborts startup), run
    /// boot-time recovery, and hand back a service ready for
    /// `start`/`stop`/`wait`.
    pub async fn new(
        store: Arc<dyn Store>,
        registry: PluginRegistry,
        config: ExecutorConfig,
    ) -> Result<Arc<Self>, ExecutorError> {
        registry
            .init_all()
            .await
            .map_err(|e| ExecutorError::Internal(e.to_string()))?;

        let service = Arc::new(Self {
            store,
            registry,
            config,
            cancels: dashmap::DashMap::new(),
            completions: dashmap::DashMap::new(),
        });
        service.recover().await?;
        Ok(service)
    }

    /// Boot-time recovery state machine: every plan left
    /// Running is either resumed (within `max_last_update`) or failed with
    /// `ExceedRecovery`. Never panics on a malformed plan — the whole point
    /// is that a crash-interrupted record must not take the service down.
    #[tracing::instrument(skip_all)]
    async fn recover(self: &Arc<Self>) -> Result<(), ExecutorError> {
        let filters = SearchFilters {
            statuses: vec![Status::Running],
            ..Default::default()
        };
        let mut stream = self.store.search(filters).await?;

        let mut running_ids = Vec::new();
        while let Some(result) = stream.next().await {
            running_ids.push(result?.plan_id);
        }
        drop(stream);

        for plan_id in running_ids {
            let mut plan = match self.store.read(plan_id).await {
                Ok(p) => p,
                Err(_) => continue,
            };

            let last_update = plan.state_fields().start.unwrap_or(plan.submit_time);
            let age = chrono::Utc::now().signed_duration_since(last_update);
            let resumable = age >= chrono::Duration::zero()
                && age.to_std().map(|d| d <= self.config.max_last_update).unwrap_or(false);

            if resumable {
                tracing::info!(plan_id = %plan_id, "resuming plan found Running at boot");
                reset_running_subtree(&mut plan);
                self.spawn_plan(plan);
            } else {
                tracing::warn!(plan_id = %plan_id, "plan exceeded recovery window, marking failed");
                plan.failure_reason = FailureReason::ExceedRecovery;
                plan.state.finish(Status::Failed);
                self.store.update_plan(&plan).await?;
            }
        }

        Ok(())
    }

    /// Validate `plan_id` and launch its plan machine in a
    /// background task under a fresh cancel scope.
    pub async fn start(self: &Arc<Self>, plan_id: EntityId) -> Result<(), ExecutorError> {
        let plan = match self.store.read(plan_id).await {
            Ok(plan) => plan,
            Err(crate::store::StoreError::NotFound(_)) => {
                return Err(ExecutorError::NotFound(plan_id))
            }
            Err(err) => return Err(err.into()),
        };
        self.validate_for_start(&plan)?;
        self.spawn_plan(plan);
        Ok(())
    }

    /// Cancel a running plan's scope. Its Deferred checks still run to
    /// completion under a detached context.
    pub fn stop(&self, plan_id: EntityId) -> Result<(), ExecutorError> {
        match self.cancels.get(&plan_id) {
            Some(token) => {
                token.cancel();
                Ok(())
            }
            None => Err(ExecutorError::NotFound(plan_id)),
        }
    }

    /// Block until `plan_id` reaches a terminal state. A caller that joins
    /// after the plan already finished observes completion immediately —
    /// the watch channel retains its last value.
    pub async fn wait(&self, plan_id: EntityId) -> Result<(), ExecutorError> {
        let mut rx = match self.completions.get(&plan_id) {
            Some(entry) => entry.value().clone(),
            None => {
                return if self.store.exists(plan_id).await? {
                    Ok(())
                } else {
                    Err(ExecutorError::NotFound(plan_id))
                };
            }
        };
        if *rx.borrow() {
            return Ok(());
        }
        rx.changed()
            .await
            .map_err(|_| ExecutorError::Internal("completion channel dropped before firing".into()))?;
        Ok(())
    }

    /// Validation at Start: plan non-nil (implicit — we hold an
    /// owned value), SubmitTime within MaxSubmit, every state freshly
    /// NotStarted, every action plugin-registered with no prior attempts,
    /// and every Checks action backed by a check-marked plugin.
    fn validate_for_start(&self, plan: &Plan) -> Result<(), ExecutorError> {
        if !plan.id.is_valid_v7() {
            return Err(ExecutorError::InvalidState("plan id is not a valid v7 uuid".into()));
        }

        let submit_age = chrono::Utc::now().signed_duration_since(plan.submit_time);
        if submit_age < chrono::Duration::zero() {
            return Err(ExecutorError::InvalidState("plan submit time is in the future".into()));
        }
        match submit_age.to_std() {
            Ok(d) if d <= self.config.max_submit => {}
            _ => return Err(ExecutorError::InvalidState("plan submit time exceeds MaxSubmit".into())),
        }

        for item in Walk::new(plan) {
            let fields = match item.value {
                Node::Plan(p) => p.state_fields(),
                Node::Checks(c) => c.state.get(),
                Node::Block(b) => b.state.get(),
                Node::Sequence(s) => s.state.get(),
                Node::Action(a) => a.state.get(),
            };
            if fields.status != Status::NotStarted || fields.start.is_some() || fields.end.is_some() {
                return Err(ExecutorError::InvalidState(format!(
                    "{:?} is not freshly NotStarted",
                    item.value.id()
                )));
            }

            if let Node::Action(action) = item.value {
                if !action.attempts.is_empty() {
                    return Err(ExecutorError::InvalidState(format!(
                        "action {} has prior attempts",
                        action.name
                    )));
                }
                let plugin = self
                    .registry
                    .get(&action.plugin)
                    .ok_or_else(|| ExecutorError::InvalidState(format!("unknown plugin: {}", action.plugin)))?;

                let inside_checks = item.chain.iter().any(|n| matches!(n, Node::Checks(_)));
                if inside_checks && !plugin.is_check_plugin() {
                    return Err(ExecutorError::InvalidState(format!(
                        "action {} uses a non-check plugin inside a checks group",
                        action.name
                    )));
                }
            }
        }

        Ok(())
    }

    fn spawn_plan(self: &Arc<Self>, mut plan: Plan) {
        let plan_id = plan.id;
        let cancel = CancellationToken::new();
        self.cancels.insert(plan_id, cancel.clone());

        let (tx, rx) = watch::channel(false);
        self.completions.insert(plan_id, rx);

        let service = self.clone();
        tokio::spawn(async move {
            let _ = run_plan(&mut plan, &service.registry, &service.store, &cancel).await;
            service.cancels.remove(&plan_id);
            let _ = tx.send(true);
        });
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::{Action, CheckRole, Checks};
    use crate::plugin::{Plugin, PluginContext, PluginError};
    use crate::store::{BlobStore, BlobStoreConfig};
    use async_trait::async_trait;
    use object_store::memory::InMemory;
    use serde::{Deserialize, Serialize};

    #[derive(Default, Serialize, Deserialize)]
    struct Req {}
    #[derive(Serialize, Deserialize)]
    struct Resp {}

    struct AlwaysOk;
    #[async_trait]
    impl Plugin for AlwaysOk {
        type Request = Req;
        type Response = Resp;
        fn name(&self) -> &str {
            "ok"
        }
        async fn execute(&self, _ctx: &PluginContext, _req: Req) -> Result<Resp, PluginError> {
            Ok(Resp {})
        }
    }

    struct CheckOk;
    #[async_trait]
    impl Plugin for CheckOk {
        type Request = Req;
        type Response = Resp;
        fn name(&self) -> &str {
            "check_ok"
        }
        fn is_check_plugin(&self) -> bool {
            true
        }
        async fn execute(&self, _ctx: &PluginContext, _req: Req) -> Result<Resp, PluginError> {
            Ok(Resp {})
        }
    }

    fn store() -> Arc<dyn Store> {
        Arc::new(BlobStore::new(Arc::new(InMemory::new()), BlobStoreConfig::default()))
    }

    #[tokio::test]
    async fn start_then_wait_completes_a_fresh_plan() {
        let store = store();
        let registry = PluginRegistry::builder().register(AlwaysOk).register(CheckOk).build();
        let service = ExecutionService::new(store.clone(), registry, ExecutorConfig::default())
            .await
            .unwrap();

        let mut plan = Plan::new("demo");
        plan.pre = Some(
            Checks::new(plan.id, CheckRole::Pre)
                .with_actions(vec![Action::new(plan.id, "a1", "check_ok", serde_json::json!({}))]),
        );
        let plan_id = plan.id;
        store.create(&plan).await.unwrap();

        service.start(plan_id).await.unwrap();
        service.wait(plan_id).await.unwrap();

        let stored = store.read(plan_id).await.unwrap();
        assert_eq!(stored.state.status(), Status::Completed);
    }

    #[tokio::test]
    async fn start_rejects_a_plan_with_an_unregistered_plugin() {
        let store = store();
        let registry = PluginRegistry::builder().build();
        let service = ExecutionService::new(store.clone(), registry, ExecutorConfig::default())
            .await
            .unwrap();

        let mut plan = Plan::new("demo");
        plan.blocks = vec![crate::model::Block::new(plan.id, "b1")
            .with_sequences(vec![crate::model::Sequence::new(plan.id, "s1")
                .with_actions(vec![Action::new(plan.id, "a1", "missing", serde_json::json!({}))])])];
        let plan_id = plan.id;
        store.create(&plan).await.unwrap();

        let err = service.start(plan_id).await.unwrap_err();
        assert!(matches!(err, ExecutorError::InvalidState(_)));
    }

    #[tokio::test]
    async fn start_rejects_a_check_action_on_a_non_check_plugin() {
        let store = store();
        let registry = PluginRegistry::builder().register(AlwaysOk).build();
        let service = ExecutionService::new(store.clone(), registry, ExecutorConfig::default())
            .await
            .unwrap();

        let mut plan = Plan::new("demo");
        plan.pre = Some(
            Checks::new(plan.id, CheckRole::Pre).with_actions(vec![Action::new(plan.id, "a1", "ok", serde_json::json!({}))]),
        );
        let plan_id = plan.id;
        store.create(&plan).await.unwrap();

        let err = service.start(plan_id).await.unwrap_err();
        assert!(matches!(err, ExecutorError::InvalidState(_)));
    }

    #[tokio::test]
    async fn start_on_an_unknown_plan_returns_not_found() {
        let store = store();
        let registry = PluginRegistry::builder().build();
        let service = ExecutionService::new(store, registry, ExecutorConfig::default())
            .await
            .unwrap();

        let err = service.start(EntityId::new()).await.unwrap_err();
        assert!(matches!(err, ExecutorError::NotFound(_)));
    }

    #[tokio::test]
    async fn stop_on_an_unknown_plan_returns_not_found() {
        let store = store();
        let registry = PluginRegistry::builder().build();
        let service = ExecutionService::new(store, registry, ExecutorConfig::default())
            .await
            .unwrap();

        let err = service.stop(EntityId::new()).unwrap_err();
        assert!(matches!(err, ExecutorError::NotFound(_)));
    }
}
