//! Boot-time recovery support.
//!
//! An entity left `Running` when the process crashed is neither safely
//! resumable (its attempt may have been interrupted mid-flight) nor safely
//! terminal. Reset it to `NotStarted` so the normal machines re-run it from
//! scratch; anything already terminal is left untouched and trusted as-is.

use crate::model::{Block, Checks, Plan, Sequence, StateRecord, Status};

/// Walk every entity reachable from `plan` and reset any `Running` state
/// record back to `NotStarted`. Call this once, before re-entering
/// [`super::plan_machine::run_plan`] on a plan recovered from a crash.
pub(crate) fn reset_running_subtree(plan: &mut Plan) {
    reset_if_running(&mut plan.state);
    for checks in [
        &mut plan.bypass,
        &mut plan.pre,
        &mut plan.cont,
        &mut plan.post,
        &mut plan.deferred,
    ] {
        if let Some(checks) = checks.as_mut() {
            reset_checks(checks);
        }
    }
    for block in &mut plan.blocks {
        reset_block(block);
    }
}

fn reset_block(block: &mut Block) {
    reset_if_running(&mut block.state);
    for checks in [
        &mut block.bypass,
        &mut block.pre,
        &mut block.cont,
        &mut block.post,
        &mut block.deferred,
    ] {
        if let Some(checks) = checks.as_mut() {
            reset_checks(checks);
        }
    }
    for sequence in &mut block.sequences {
        reset_sequence(sequence);
    }
}

fn reset_checks(checks: &mut Checks) {
    reset_if_running(&mut checks.state);
    for action in &mut checks.actions {
        reset_if_running(&mut action.state);
    }
}

fn reset_sequence(sequence: &mut Sequence) {
    reset_if_running(&mut sequence.state);
    for action in &mut sequence.actions {
        reset_if_running(&mut action.state);
    }
}

fn reset_if_running(state: &mut StateRecord) {
    if state.status() == Status::Running {
        *state = StateRecord::new();
    }
}
