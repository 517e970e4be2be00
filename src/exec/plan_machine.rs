//! The top-level plan state machine: `Start -> BypassChecks ->
//! PreChecks -> ContChecks(start) -> ExecBlocks -> ContChecks(stop) ->
//! PostChecks -> DeferredChecks -> End`.
//!
//! A mutable record (here, `plan` itself plus a couple of local flags)
//! threaded through each state, with every path funneling into one
//! terminal cleanup instead of returning early with a scattered error.

use std::sync::Arc;

use tokio_util::sync::CancellationToken;

use crate::model::{FailureReason, Plan, Status};
use crate::plugin::PluginRegistry;
use crate::store::Store;

use super::block_machine::run_block;
use super::checks::{run_sequential, ContinuousSupervisor};
use super::error::ExecutorError;

/// Drive `plan` to a terminal state, persisting every transition. Returns
/// once the plan has reached `End`; the final status is on `plan.state`.
#[tracing::instrument(skip_all, fields(plan_id = %plan.id, name = %plan.name))]
pub async fn run_plan(
    plan: &mut Plan,
    registry: &PluginRegistry,
    store: &Arc<dyn Store>,
    cancel: &CancellationToken,
) -> Result<(), ExecutorError> {
    // A plan resumed after a crash is already Running; only a fresh plan
    // needs the NotStarted -> Running transition.
    if plan.state.status() == Status::NotStarted {
        plan.state.start();
        store.update_plan(plan).await?;
    }

    if let Some(bypass) = plan.bypass.as_mut() {
        let completed = run_sequential(bypass, plan.id, registry, store.as_ref(), cancel).await?;
        if completed {
            plan.state.finish(Status::Completed);
            store.update_plan(plan).await?;
            return Ok(());
        }
    }

    let mut failed = false;
    let mut reason = FailureReason::Unknown;
    let mut pre_failed = false;

    if let Some(pre) = plan.pre.as_mut() {
        let completed = run_sequential(pre, plan.id, registry, store.as_ref(), cancel).await?;
        if !completed {
            failed = true;
            pre_failed = true;
            reason = FailureReason::PreCheck;
        }
    }

    // A failing plan-level Pre fails fast: ExecBlocks and Cont never run,
    // but Deferred always does.
    if !failed {
        let cont_supervisor = plan.cont.take().map(|cont| {
            ContinuousSupervisor::spawn(cont, plan.id, registry.clone(), store.clone(), cancel.clone())
        });

        let mut blocks_failed = false;
        for block in plan.blocks.iter_mut() {
            run_block(block, plan.id, registry, store, cancel).await?;
            if block.state.status() == Status::Failed {
                blocks_failed = true;
                break;
            }
            if cancel.is_cancelled() {
                break;
            }
        }

        let mut cont_tripped = false;
        if let Some(supervisor) = cont_supervisor {
            let (cont, tripped) = supervisor.stop().await;
            plan.cont = Some(cont);
            cont_tripped = tripped;
        }

        if cont_tripped {
            failed = true;
            reason = FailureReason::ContCheck;
        } else if blocks_failed {
            failed = true;
            reason = FailureReason::Block;
        }
    }

    // A failing plan-level Pre skips Post entirely (only Deferred still
    // runs); a Block/Cont failure still runs Post on the way to Deferred.
    if !pre_failed {
        if let Some(post) = plan.post.as_mut() {
            let completed = run_sequential(post, plan.id, registry, store.as_ref(), cancel).await?;
            if !completed && !failed {
                failed = true;
                reason = FailureReason::PostCheck;
            }
        }
    }

    if let Some(deferred) = plan.deferred.as_mut() {
        // Deferred runs detached: Stop must not cancel cleanup.
        let detached = CancellationToken::new();
        let completed = run_sequential(deferred, plan.id, registry, store.as_ref(), &detached).await?;
        if !completed && !failed {
            failed = true;
        }
    }

    plan.failure_reason = reason;
    let final_status = if failed {
        Status::Failed
    } else if cancel.is_cancelled() {
        Status::Stopped
    } else {
        Status::Completed
    };
    plan.state.finish(final_status);
    store.update_plan(plan).await?;
    Ok(())
}
