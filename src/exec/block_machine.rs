//! The block sub-machine and bounded-concurrency sequence dispatcher.
//!
//! A `FuturesUnordered` of in-flight sequences capped at `Concurrency`,
//! refilled as each completes, with dispatch halted and in-flight work
//! cancelled once `ToleratedFailures` is exceeded.

use std::sync::Arc;

use futures::future::FutureExt;
use futures::stream::{FuturesUnordered, StreamExt};
use tokio_util::sync::CancellationToken;

use crate::model::{Block, EntityId, Sequence, Status};
use crate::plugin::PluginRegistry;
use crate::store::Store;

use super::action_machine::run_action;
use super::checks::{run_sequential, ContinuousSupervisor};
use super::error::ExecutorError;
use super::util::sleep_cancellable;

/// Run one block to completion. Leaves `block.state` terminal on return.
#[tracing::instrument(skip_all, fields(block_id = %block.id, name = %block.name))]
pub async fn run_block(
    block: &mut Block,
    plan_id: EntityId,
    registry: &PluginRegistry,
    store: &Arc<dyn Store>,
    cancel: &CancellationToken,
) -> Result<(), ExecutorError> {
    // A recovered block already terminal is trusted as-is.
    if block.state.status().is_terminal() {
        return Ok(());
    }

    block.state.start();
    store.update_block(plan_id, block).await?;

    // A block-local scope: it observes the caller's cancellation but a
    // tripped Cont only needs to cancel this block's own in-flight work,
    // not siblings running under the same parent scope.
    let scope = cancel.child_token();

    if !block.entrance_delay.is_zero() && !sleep_cancellable(block.entrance_delay, &scope).await {
        block.state.finish(Status::Stopped);
        store.update_block(plan_id, block).await?;
        return Ok(());
    }

    if let Some(bypass) = block.bypass.as_mut() {
        let completed = run_sequential(bypass, plan_id, registry, store.as_ref(), &scope).await?;
        if completed {
            block.state.finish(Status::Completed);
            store.update_block(plan_id, block).await?;
            return Ok(());
        }
    }

    let mut pre_failed = false;
    if let Some(pre) = block.pre.as_mut() {
        let completed = run_sequential(pre, plan_id, registry, store.as_ref(), &scope).await?;
        pre_failed = !completed;
    }

    if !pre_failed {
        let cont_supervisor = block.cont.take().map(|cont| {
            ContinuousSupervisor::spawn(cont, plan_id, registry.clone(), store.clone(), scope.clone())
        });

        run_sequence_dispatch(block, plan_id, registry, store.as_ref(), &scope).await?;

        if let Some(supervisor) = cont_supervisor {
            let (cont, tripped) = supervisor.stop().await;
            block.cont = Some(cont);
            if tripped {
                pre_failed = true; // reuse the same "block body failed" flag below
            }
        }
    }

    if let Some(post) = block.post.as_mut() {
        run_sequential(post, plan_id, registry, store.as_ref(), &scope).await?;
    }

    if let Some(deferred) = block.deferred.as_mut() {
        let detached = CancellationToken::new();
        run_sequential(deferred, plan_id, registry, store.as_ref(), &detached).await?;
    }

    if !scope.is_cancelled() && !block.exit_delay.is_zero() {
        sleep_cancellable(block.exit_delay, &scope).await;
    }

    // Only genuine failures count against tolerance; a sequence left
    // Stopped by an external cancellation is not a tolerance breach.
    let sequence_failures = block
        .sequences
        .iter()
        .filter(|s| s.state.status() == Status::Failed)
        .count() as u32;
    let body_failed = pre_failed || sequence_failures > block.tolerated_failures;

    let final_status = if body_failed {
        Status::Failed
    } else if scope.is_cancelled() {
        Status::Stopped
    } else {
        Status::Completed
    };
    block.state.finish(final_status);
    store.update_block(plan_id, block).await?;
    Ok(())
}

/// The bounded-concurrency sequence dispatcher.
async fn run_sequence_dispatch(
    block: &mut Block,
    plan_id: EntityId,
    registry: &PluginRegistry,
    store: &dyn Store,
    cancel: &CancellationToken,
) -> Result<(), ExecutorError> {
    let concurrency = block.concurrency.max(1) as usize;
    let tolerated = block.tolerated_failures;
    let total = block.sequences.len();

    let mut pending: Vec<Option<&mut Sequence>> = block.sequences.iter_mut().map(Some).collect();
    let dispatch_cancel = cancel.child_token();

    let mut in_flight = FuturesUnordered::new();
    let mut next_index = 0usize;
    let mut failed_count: u32 = 0;
    let mut halted = false;

    let dispatch_one = |idx: usize, seq: &'_ mut Sequence| {
        run_one_sequence(seq, plan_id, registry, store, dispatch_cancel.clone()).map(move |r| (idx, r))
    };

    while next_index < total && in_flight.len() < concurrency {
        let seq = pending[next_index].take().unwrap();
        in_flight.push(dispatch_one(next_index, seq));
        next_index += 1;
    }

    while let Some((_, result)) = in_flight.next().await {
        match result {
            Ok(succeeded) => {
                if !succeeded {
                    failed_count += 1;
                    if failed_count > tolerated {
                        halted = true;
                        dispatch_cancel.cancel();
                    }
                }
            }
            Err(e) => return Err(e),
        }

        if !halted {
            while next_index < total && in_flight.len() < concurrency {
                let seq = pending[next_index].take().unwrap();
                in_flight.push(dispatch_one(next_index, seq));
                next_index += 1;
            }
        }
    }

    for slot in pending.iter_mut() {
        if let Some(seq) = slot.take() {
            seq.state.start();
            seq.state.finish(Status::Failed);
            store.update_sequence(plan_id, seq).await?;
        }
    }

    Ok(())
}

/// Run one sequence: its actions strictly in order, first failure stops it.
async fn run_one_sequence(
    sequence: &mut Sequence,
    plan_id: EntityId,
    registry: &PluginRegistry,
    store: &dyn Store,
    cancel: CancellationToken,
) -> Result<bool, ExecutorError> {
    // A recovered sequence already terminal is trusted as-is.
    if sequence.state.status().is_terminal() {
        return Ok(sequence.state.status() == Status::Completed);
    }

    sequence.state.start();
    store.update_sequence(plan_id, sequence).await?;

    let mut all_ok = true;
    for action in &mut sequence.actions {
        if cancel.is_cancelled() {
            all_ok = false;
            break;
        }
        let plugin = registry
            .get(&action.plugin)
            .ok_or_else(|| ExecutorError::InvalidState(format!("unknown plugin: {}", action.plugin)))?;
        run_action(action, plan_id, plugin, store, &cancel).await?;
        if action.state.status() != Status::Completed {
            all_ok = false;
            break;
        }
    }

    let final_status = if all_ok {
        Status::Completed
    } else if cancel.is_cancelled() {
        Status::Stopped
    } else {
        Status::Failed
    };
    sequence.state.finish(final_status);
    store.update_sequence(plan_id, sequence).await?;
    Ok(all_ok)
}
