//! Checks supervisors: Bypass, Pre, Post, Deferred, and Continuous.
//!
//! Bypass/Pre/Post/Deferred share one "run actions in order, stop at the
//! first failure" shape. Continuous is its own periodic supervisor: it owns
//! its `Checks` object for the lifetime of the block/plan it guards and
//! reports back whether it ever tripped.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use tokio_util::sync::CancellationToken;

use crate::model::{Checks, EntityId, Status};
use crate::plugin::PluginRegistry;
use crate::store::Store;

use super::action_machine::run_action;
use super::error::ExecutorError;

/// Run one sequential checks group (Bypass/Pre/Post/Deferred) to completion.
///
/// Returns `true` if every action succeeded (Checks ends Completed), `false`
/// if the first failing action stopped the group (Checks ends Failed).
#[tracing::instrument(skip_all, fields(checks_id = %checks.id, role = ?checks.role))]
pub async fn run_sequential(
    checks: &mut Checks,
    plan_id: EntityId,
    registry: &PluginRegistry,
    store: &dyn Store,
    cancel: &CancellationToken,
) -> Result<bool, ExecutorError> {
    // A recovered checks group already terminal is trusted as-is.
    if checks.state.status().is_terminal() {
        return Ok(checks.state.status() == Status::Completed);
    }

    checks.state.start();
    store.update_checks(plan_id, checks).await?;

    let mut all_succeeded = true;
    for action in &mut checks.actions {
        if action.state.status().is_terminal() {
            if action.state.status() != Status::Completed {
                all_succeeded = false;
                break;
            }
            continue;
        }
        let plugin = registry
            .get(&action.plugin)
            .ok_or_else(|| ExecutorError::InvalidState(format!("unknown plugin: {}", action.plugin)))?;
        run_action(action, plan_id, plugin, store, cancel).await?;
        if action.state.status() != Status::Completed {
            all_succeeded = false;
            break;
        }
    }

    checks
        .state
        .finish(if all_succeeded { Status::Completed } else { Status::Failed });
    store.update_checks(plan_id, checks).await?;
    Ok(all_succeeded)
}

/// A running continuous-checks loop.
///
/// Spawned with ownership of the `Checks` object it guards; `stop` hands it
/// back along with whether it tripped a failure before being asked to stop.
pub struct ContinuousSupervisor {
    handle: tokio::task::JoinHandle<Checks>,
    stop_token: CancellationToken,
    tripped: Arc<AtomicBool>,
}

impl ContinuousSupervisor {
    /// Start the loop. `abort` is signaled (not just read) the moment a
    /// continuous action fails, so the owning plan/block machine can cancel
    /// whatever it is concurrently running without polling.
    pub fn spawn(
        mut checks: Checks,
        plan_id: EntityId,
        registry: PluginRegistry,
        store: Arc<dyn Store>,
        abort: CancellationToken,
    ) -> Self {
        let stop_token = CancellationToken::new();
        let tripped = Arc::new(AtomicBool::new(false));

        let loop_stop = stop_token.clone();
        let loop_tripped = tripped.clone();

        let handle = tokio::spawn(async move {
            let delay = checks.delay.max(Duration::from_millis(1));
            loop {
                tokio::select! {
                    biased;
                    _ = loop_stop.cancelled() => break,
                    _ = tokio::time::sleep(delay) => {}
                }
                if loop_stop.is_cancelled() {
                    break;
                }

                if checks.state.status() == Status::NotStarted {
                    checks.state.start();
                }

                let mut iteration_failed = false;
                for action in &mut checks.actions {
                    let Some(plugin) = registry.get(&action.plugin) else {
                        iteration_failed = true;
                        break;
                    };
                    if run_action(action, plan_id, plugin, store.as_ref(), &loop_stop)
                        .await
                        .is_err()
                    {
                        iteration_failed = true;
                        break;
                    }
                    if action.state.status() != Status::Completed {
                        iteration_failed = true;
                        break;
                    }
                }

                if iteration_failed {
                    checks.state.finish(Status::Failed);
                    let _ = store.update_checks(plan_id, &checks).await;
                    loop_tripped.store(true, Ordering::SeqCst);
                    abort.cancel();
                    break;
                }
            }

            if checks.state.status() == Status::Running {
                checks.state.finish(Status::Completed);
                let _ = store.update_checks(plan_id, &checks).await;
            }
            checks
        });

        Self {
            handle,
            stop_token,
            tripped,
        }
    }

    /// Signal the loop to stop at its next suspension point and wait for it
    /// to hand back the (possibly tripped) `Checks`.
    pub async fn stop(self) -> (Checks, bool) {
        self.stop_token.cancel();
        let checks = self.handle.await.unwrap_or_else(|_| {
            // The task panicked; there is nothing sensible to recover beyond
            // surfacing an empty, already-running checks group as tripped.
            Checks::new(EntityId::new(), crate::model::CheckRole::Cont)
        });
        let tripped = self.tripped.load(Ordering::SeqCst);
        (checks, tripped)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::{Action, CheckRole};
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

    struct AlwaysFails;
    #[async_trait]
    impl Plugin for AlwaysFails {
        type Request = Req;
        type Response = Resp;
        fn name(&self) -> &str {
            "fails"
        }
        async fn execute(&self, _ctx: &PluginContext, _req: Req) -> Result<Resp, PluginError> {
            Err(PluginError::permanent("nope"))
        }
    }

    fn store() -> BlobStore {
        BlobStore::new(Arc::new(InMemory::new()), BlobStoreConfig::default())
    }

    #[tokio::test]
    async fn sequential_checks_complete_when_all_actions_succeed() {
        let plan_id = EntityId::new();
        let registry = PluginRegistry::builder().register(AlwaysOk).build();
        let store = store();
        let mut checks = Checks::new(plan_id, CheckRole::Pre)
            .with_actions(vec![Action::new(plan_id, "a1", "ok", serde_json::json!({}))]);

        let ok = run_sequential(&mut checks, plan_id, &registry, &store, &CancellationToken::new())
            .await
            .unwrap();

        assert!(ok);
        assert_eq!(checks.state.status(), Status::Completed);
    }

    #[tokio::test]
    async fn sequential_checks_stop_at_first_failure() {
        let plan_id = EntityId::new();
        let registry = PluginRegistry::builder()
            .register(AlwaysFails)
            .register(AlwaysOk)
            .build();
        let store = store();
        let mut checks = Checks::new(plan_id, CheckRole::Pre).with_actions(vec![
            Action::new(plan_id, "a1", "fails", serde_json::json!({})),
            Action::new(plan_id, "a2", "ok", serde_json::json!({})),
        ]);

        let ok = run_sequential(&mut checks, plan_id, &registry, &store, &CancellationToken::new())
            .await
            .unwrap();

        assert!(!ok);
        assert_eq!(checks.state.status(), Status::Failed);
        assert_eq!(checks.actions[1].state.status(), Status::NotStarted);
    }

    #[tokio::test]
    async fn continuous_supervisor_stops_cleanly_when_never_tripped() {
        let plan_id = EntityId::new();
        let registry = PluginRegistry::builder().register(AlwaysOk).build();
        let store: Arc<dyn Store> = Arc::new(store());
        let checks = Checks::new(plan_id, CheckRole::Cont)
            .with_delay(Duration::from_millis(5))
            .with_actions(vec![Action::new(plan_id, "a1", "ok", serde_json::json!({}))]);

        let abort = CancellationToken::new();
        let supervisor = ContinuousSupervisor::spawn(checks, plan_id, registry, store, abort.clone());
        tokio::time::sleep(Duration::from_millis(20)).await;
        let (final_checks, tripped) = supervisor.stop().await;

        assert!(!tripped);
        assert!(!abort.is_cancelled());
        assert_ne!(final_checks.state.status(), Status::Failed);
    }

    #[tokio::test]
    async fn continuous_supervisor_trips_abort_on_failure() {
        let plan_id = EntityId::new();
        let registry = PluginRegistry::builder().register(AlwaysFails).build();
        let store: Arc<dyn Store> = Arc::new(store());
        let checks = Checks::new(plan_id, CheckRole::Cont)
            .with_delay(Duration::from_millis(5))
            .with_actions(vec![Action::new(plan_id, "a1", "fails", serde_json::json!({}))]);

        let abort = CancellationToken::new();
        let supervisor = ContinuousSupervisor::spawn(checks, plan_id, registry, store, abort.clone());
        tokio::time::sleep(Duration::from_millis(50)).await;

        assert!(abort.is_cancelled());
        let (final_checks, tripped) = supervisor.stop().await;
        assert!(tripped);
        assert_eq!(final_checks.state.status(), Status::Failed);
    }
}
