//! The per-action state machine: `Start -> Attempt -> (Retry? ->
//! Attempt)* -> End`. Retry/backoff reuses [`crate::retry::RetryPolicy`]
//! directly.

use std::sync::Arc;
use tokio_util::sync::CancellationToken;

use crate::model::{Action, Attempt, AttemptError, EntityId, Status};
use crate::plugin::{ErasedPlugin, PluginContext, PluginError};
use crate::store::Store;

use super::error::ExecutorError;

/// Run one action to completion, persisting every attempt before the next
/// begins: on crash, recovery sees at least the last completed attempt.
#[tracing::instrument(skip_all, fields(action_id = %action.id, plugin = %action.plugin))]
pub async fn run_action(
    action: &mut Action,
    plan_id: EntityId,
    plugin: Arc<dyn ErasedPlugin>,
    store: &dyn Store,
    cancel: &CancellationToken,
) -> Result<(), ExecutorError> {
    // A recovered action already in a terminal state is trusted as-is; only
    // an action reset to NotStarted by boot recovery is (re)run.
    if action.state.status().is_terminal() {
        return Ok(());
    }

    action.state.start();
    store.update_action(plan_id, action).await?;

    let max_attempts = action.retries + 1;
    let retry_policy = plugin.retry_policy();
    let mut attempt_num: u32 = 0;
    let mut last_was_success = false;

    loop {
        attempt_num += 1;

        if attempt_num > 1 {
            let delay = retry_policy.delay_for_attempt(attempt_num);
            if sleep_or_cancel(delay, cancel).await.is_err() {
                action.state.finish(Status::Stopped);
                store.update_action(plan_id, action).await?;
                return Ok(());
            }
        }

        let ctx = PluginContext {
            plan_id,
            action_id: action.id,
            attempt: attempt_num,
            max_attempts,
        };

        let mut attempt = Attempt::started();
        let outcome = tokio::select! {
            biased;
            _ = cancel.cancelled() => None,
            result = tokio::time::timeout(action.timeout, plugin.execute_json(&ctx, action.req.clone())) => Some(result),
        };

        match outcome {
            None => {
                action.attempts.push(attempt);
                action.state.finish(Status::Stopped);
                store.update_action(plan_id, action).await?;
                return Ok(());
            }
            Some(Ok(Ok(resp))) => {
                attempt.succeed(resp);
                action.attempts.push(attempt);
                last_was_success = true;
            }
            Some(Ok(Err(plugin_err))) => {
                attempt.fail(attempt_error_from(&plugin_err));
                action.attempts.push(attempt);
                store.update_action(plan_id, action).await?;

                let exhausted = !retry_policy.has_attempts_remaining(attempt_num)
                    || attempt_num >= max_attempts;
                if plugin_err.permanent || exhausted {
                    action.state.finish(Status::Failed);
                    store.update_action(plan_id, action).await?;
                    return Ok(());
                }
                continue;
            }
            Some(Err(_timeout)) => {
                attempt.fail(AttemptError::new("action timed out", false));
                action.attempts.push(attempt);
                store.update_action(plan_id, action).await?;

                let exhausted = attempt_num >= max_attempts;
                if exhausted {
                    action.state.finish(Status::Failed);
                    store.update_action(plan_id, action).await?;
                    return Ok(());
                }
                continue;
            }
        }

        store.update_action(plan_id, action).await?;
        break;
    }

    action
        .state
        .finish(if last_was_success { Status::Completed } else { Status::Failed });
    store.update_action(plan_id, action).await?;
    Ok(())
}

fn attempt_error_from(err: &PluginError) -> AttemptError {
    AttemptError::new(err.message.clone(), err.permanent)
}

/// Sleep for `delay`, returning `Err(())` if `cancel` fires first.
async fn sleep_or_cancel(delay: std::time::Duration, cancel: &CancellationToken) -> Result<(), ()> {
    if delay.is_zero() {
        if cancel.is_cancelled() {
            return Err(());
        }
        return Ok(());
    }
    tokio::select! {
        biased;
        _ = cancel.cancelled() => Err(()),
        _ = tokio::time::sleep(delay) => Ok(()),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::plugin::{Plugin, PluginRegistry};
    use crate::store::{BlobStore, BlobStoreConfig};
    use async_trait::async_trait;
    use object_store::memory::InMemory;
    use serde::{Deserialize, Serialize};
    use std::sync::atomic::{AtomicU32, Ordering};

    #[derive(Default, Serialize, Deserialize)]
    struct Req {}
    #[derive(Serialize, Deserialize)]
    struct Resp {}

    struct AlwaysFails;
    #[async_trait]
    impl Plugin for AlwaysFails {
        type Request = Req;
        type Response = Resp;
        fn name(&self) -> &str {
            "always_fails"
        }
        async fn execute(&self, _ctx: &PluginContext, _req: Req) -> Result<Resp, PluginError> {
            Err(PluginError::retryable("nope"))
        }
    }

    struct FailsTwiceThenSucceeds {
        calls: AtomicU32,
    }
    #[async_trait]
    impl Plugin for FailsTwiceThenSucceeds {
        type Request = Req;
        type Response = Resp;
        fn name(&self) -> &str {
            "flaky"
        }
        fn retry_policy(&self) -> crate::retry::RetryPolicy {
            crate::retry::RetryPolicy::exponential().with_initial_interval(std::time::Duration::ZERO)
        }
        async fn execute(&self, _ctx: &PluginContext, _req: Req) -> Result<Resp, PluginError> {
            if self.calls.fetch_add(1, Ordering::SeqCst) < 2 {
                Err(PluginError::retryable("not yet"))
            } else {
                Ok(Resp {})
            }
        }
    }

    fn store() -> BlobStore {
        BlobStore::new(std::sync::Arc::new(InMemory::new()), BlobStoreConfig::default())
    }

    #[tokio::test]
    async fn retries_are_capped_at_retries_plus_one() {
        let registry = PluginRegistry::builder().register(AlwaysFails).build();
        let plugin = registry.get("always_fails").unwrap();
        let store = store();
        let mut action = Action::new(EntityId::new(), "a", "always_fails", serde_json::json!({}))
            .with_retries(2);
        run_action(&mut action, EntityId::new(), plugin, &store, &CancellationToken::new())
            .await
            .unwrap();

        assert_eq!(action.attempts.len(), 3);
        assert_eq!(action.state.status(), Status::Failed);
    }

    #[tokio::test]
    async fn zero_retries_means_one_attempt() {
        let registry = PluginRegistry::builder().register(AlwaysFails).build();
        let plugin = registry.get("always_fails").unwrap();
        let store = store();
        let mut action = Action::new(EntityId::new(), "a", "always_fails", serde_json::json!({}));
        run_action(&mut action, EntityId::new(), plugin, &store, &CancellationToken::new())
            .await
            .unwrap();

        assert_eq!(action.attempts.len(), 1);
    }

    #[tokio::test]
    async fn succeeds_after_transient_failures() {
        let registry = PluginRegistry::builder()
            .register(FailsTwiceThenSucceeds { calls: AtomicU32::new(0) })
            .build();
        let plugin = registry.get("flaky").unwrap();
        let store = store();
        let mut action = Action::new(EntityId::new(), "a", "flaky", serde_json::json!({}))
            .with_retries(5);
        run_action(&mut action, EntityId::new(), plugin, &store, &CancellationToken::new())
            .await
            .unwrap();

        assert_eq!(action.state.status(), Status::Completed);
        assert_eq!(action.attempts.len(), 3);
        assert!(action.attempts.last().unwrap().succeeded());
    }

    #[tokio::test]
    async fn cancellation_mid_attempt_marks_stopped() {
        let registry = PluginRegistry::builder().register(AlwaysFails).build();
        let plugin = registry.get("always_fails").unwrap();
        let store = store();
        let mut action = Action::new(EntityId::new(), "a", "always_fails", serde_json::json!({}))
            .with_retries(3);
        let cancel = CancellationToken::new();
        cancel.cancel();
        run_action(&mut action, EntityId::new(), plugin, &store, &cancel)
            .await
            .unwrap();

        assert_eq!(action.state.status(), Status::Stopped);
    }
}
