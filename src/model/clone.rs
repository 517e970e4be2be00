//! Deep-copy a plan subtree with secret redaction and completed-subtree
//! pruning.

use super::id::EntityId;
use super::plan::{Action, Attempt, Block, Checks, Plan, Sequence};
use super::state::{Status, StateRecord};

/// Top-level field names on a plugin's request/response that must be
/// redacted unless the clone explicitly keeps secrets.
#[derive(Debug, Clone, Copy, Default)]
pub struct SecureFields {
    pub req: &'static [&'static str],
    pub resp: &'static [&'static str],
}

/// How a plugin name maps to its secure field list. Implemented by the
/// plugin registry; kept as a trait here so the data model does not depend
/// on the plugin module.
pub trait SecureFieldsLookup {
    fn secure_fields(&self, plugin: &str) -> SecureFields;
}

/// A lookup with no secure fields — every action is copied verbatim.
pub struct NoSecrets;

impl SecureFieldsLookup for NoSecrets {
    fn secure_fields(&self, _plugin: &str) -> SecureFields {
        SecureFields::default()
    }
}

const REDACTED: &str = "[secret hidden]";

/// Options controlling [`clone_plan`].
#[derive(Debug, Clone, Copy)]
pub struct CloneOptions {
    /// Keep secret-tagged fields in plaintext. Default off.
    pub keep_secrets: bool,
    /// Prune completed sequences/blocks/plan to the minimal resubmittable
    /// remainder.
    pub remove_completed: bool,
    /// Preserve IDs, state records, and attempts (display/export). When
    /// false, IDs are regenerated and state/attempts reset to
    /// `NotStarted` — the shape required to resubmit the plan.
    pub keep_state: bool,
}

impl Default for CloneOptions {
    fn default() -> Self {
        Self {
            keep_secrets: false,
            remove_completed: false,
            keep_state: true,
        }
    }
}

pub fn clone_plan(plan: &Plan, opts: CloneOptions, secure: &dyn SecureFieldsLookup) -> Plan {
    let mut out = plan.clone();

    if !opts.keep_secrets {
        redact_plan(&mut out, secure);
    }

    if opts.remove_completed {
        prune_plan(&mut out);
    }

    if !opts.keep_state {
        reset_state(&mut out);
    }

    out
}

fn redact_action(action: &mut Action, secure: &dyn SecureFieldsLookup) {
    let fields = secure.secure_fields(&action.plugin);
    redact_value(&mut action.req, fields.req);
    for attempt in &mut action.attempts {
        if let Some(resp) = &mut attempt.resp {
            redact_value(resp, fields.resp);
        }
    }
}

fn redact_value(value: &mut serde_json::Value, fields: &[&str]) {
    if fields.is_empty() {
        return;
    }
    if let serde_json::Value::Object(map) = value {
        for field in fields {
            if let Some(entry) = map.get_mut(*field) {
                *entry = match entry {
                    serde_json::Value::String(_) => serde_json::Value::String(REDACTED.to_string()),
                    _ => serde_json::Value::Null,
                };
            }
        }
    }
}

fn redact_checks(checks: &mut Option<Checks>, secure: &dyn SecureFieldsLookup) {
    if let Some(c) = checks {
        for action in &mut c.actions {
            redact_action(action, secure);
        }
    }
}

fn redact_plan(plan: &mut Plan, secure: &dyn SecureFieldsLookup) {
    redact_checks(&mut plan.bypass, secure);
    redact_checks(&mut plan.pre, secure);
    redact_checks(&mut plan.cont, secure);
    redact_checks(&mut plan.post, secure);
    redact_checks(&mut plan.deferred, secure);
    for block in &mut plan.blocks {
        redact_checks(&mut block.bypass, secure);
        redact_checks(&mut block.pre, secure);
        redact_checks(&mut block.cont, secure);
        redact_checks(&mut block.post, secure);
        redact_checks(&mut block.deferred, secure);
        for seq in &mut block.sequences {
            for action in &mut seq.actions {
                redact_action(action, secure);
            }
        }
    }
}

fn checks_completed_or_absent(checks: &Option<Checks>) -> bool {
    checks
        .as_ref()
        .map(|c| c.state.status() == Status::Completed)
        .unwrap_or(true)
}

fn cont_not_failed(cont: &Option<Checks>) -> bool {
    cont.as_ref()
        .map(|c| c.state.status() != Status::Failed)
        .unwrap_or(true)
}

fn block_is_prunable(block: &Block) -> bool {
    block.sequences.is_empty()
        && checks_completed_or_absent(&block.pre)
        && checks_completed_or_absent(&block.post)
        && checks_completed_or_absent(&block.deferred)
        && cont_not_failed(&block.cont)
}

/// Clear a Completed checks slot to `None`: nothing remains for a
/// resubmission to redo there.
fn clear_if_completed(checks: &mut Option<Checks>) {
    if checks_completed_or_absent(checks) {
        *checks = None;
    }
}

fn prune_plan(plan: &mut Plan) {
    for block in &mut plan.blocks {
        block
            .sequences
            .retain(|seq| seq.state.status() != Status::Completed);
    }
    plan.blocks.retain(|block| !block_is_prunable(block));

    // "prune the Plan if similarly empty": once every Block is gone, the
    // Plan's own Pre/Post/Deferred are cleared the same way a pruned
    // Block's were, yielding the minimal resubmittable remainder.
    if plan.blocks.is_empty()
        && checks_completed_or_absent(&plan.pre)
        && checks_completed_or_absent(&plan.post)
        && checks_completed_or_absent(&plan.deferred)
        && cont_not_failed(&plan.cont)
    {
        clear_if_completed(&mut plan.pre);
        clear_if_completed(&mut plan.post);
        clear_if_completed(&mut plan.deferred);
    }
}

fn reset_checks(checks: &mut Option<Checks>, plan_id: EntityId) {
    if let Some(c) = checks {
        c.id = EntityId::new();
        c.plan_id = plan_id;
        c.state = StateRecord::new();
        for action in &mut c.actions {
            reset_action(action, plan_id);
        }
    }
}

fn reset_action(action: &mut Action, plan_id: EntityId) {
    action.id = EntityId::new();
    action.plan_id = plan_id;
    action.state = StateRecord::new();
    action.attempts = Vec::new();
}

fn reset_state(plan: &mut Plan) {
    plan.id = EntityId::new();
    let plan_id = plan.id;
    plan.submit_time = chrono::Utc::now();
    plan.failure_reason = Default::default();
    plan.state = StateRecord::new();

    reset_checks(&mut plan.bypass, plan_id);
    reset_checks(&mut plan.pre, plan_id);
    reset_checks(&mut plan.cont, plan_id);
    reset_checks(&mut plan.post, plan_id);
    reset_checks(&mut plan.deferred, plan_id);

    for block in &mut plan.blocks {
        block.id = EntityId::new();
        block.plan_id = plan_id;
        block.state = StateRecord::new();
        reset_checks(&mut block.bypass, plan_id);
        reset_checks(&mut block.pre, plan_id);
        reset_checks(&mut block.cont, plan_id);
        reset_checks(&mut block.post, plan_id);
        reset_checks(&mut block.deferred, plan_id);
        for seq in &mut block.sequences {
            seq.id = EntityId::new();
            seq.plan_id = plan_id;
            seq.state = StateRecord::new();
            for action in &mut seq.actions {
                reset_action(action, plan_id);
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    struct PasswordSecure;
    impl SecureFieldsLookup for PasswordSecure {
        fn secure_fields(&self, _plugin: &str) -> SecureFields {
            SecureFields {
                req: &["password"],
                resp: &["token"],
            }
        }
    }

    fn sample() -> Plan {
        let mut plan = Plan::new("demo");
        let mut action = Action::new(
            plan.id,
            "a1",
            "login",
            serde_json::json!({"password": "hunter2", "user": "bob"}),
        );
        let mut attempt = Attempt::started();
        attempt.succeed(serde_json::json!({"token": "abc123", "ok": true}));
        action.attempts.push(attempt);
        plan.pre = Some(
            Checks::new(plan.id, super::state::CheckRole::Pre).with_actions(vec![action]),
        );
        plan
    }

    #[test]
    fn redaction_hides_secure_string_fields() {
        let plan = sample();
        let out = clone_plan(&plan, CloneOptions::default(), &PasswordSecure);
        let action = &out.pre.as_ref().unwrap().actions[0];
        assert_eq!(action.req["password"], serde_json::json!(REDACTED));
        assert_eq!(action.req["user"], serde_json::json!("bob"));
        assert_eq!(action.attempts[0].resp.as_ref().unwrap()["token"], serde_json::json!(REDACTED));
    }

    #[test]
    fn redaction_is_idempotent() {
        let plan = sample();
        let once = clone_plan(&plan, CloneOptions::default(), &PasswordSecure);
        let twice = clone_plan(&once, CloneOptions::default(), &PasswordSecure);
        assert_eq!(
            once.pre.unwrap().actions[0].req,
            twice.pre.unwrap().actions[0].req
        );
    }

    #[test]
    fn keep_secrets_preserves_plaintext() {
        let plan = sample();
        let opts = CloneOptions {
            keep_secrets: true,
            ..Default::default()
        };
        let out = clone_plan(&plan, opts, &PasswordSecure);
        assert_eq!(out.pre.unwrap().actions[0].req["password"], serde_json::json!("hunter2"));
    }

    #[test]
    fn remove_completed_prunes_finished_sequences_and_blocks() {
        let mut plan = Plan::new("demo");
        let mut block = Block::new(plan.id, "b1");
        let seq = Sequence::new(plan.id, "s1");
        seq.state.start();
        seq.state.finish(Status::Completed);
        block.sequences = vec![seq];
        plan.blocks = vec![block];

        let out = clone_plan(
            &plan,
            CloneOptions {
                remove_completed: true,
                ..Default::default()
            },
            &NoSecrets,
        );
        assert!(out.blocks.is_empty());
    }

    #[test]
    fn remove_completed_clears_completed_plan_level_checks_once_blocks_are_gone() {
        let mut plan = Plan::new("demo");
        let mut pre = Checks::new(plan.id, super::state::CheckRole::Pre);
        pre.state.start();
        pre.state.finish(Status::Completed);
        plan.pre = Some(pre);

        let out = clone_plan(
            &plan,
            CloneOptions {
                remove_completed: true,
                ..Default::default()
            },
            &NoSecrets,
        );
        assert!(out.pre.is_none());
    }

    #[test]
    fn prune_idempotence() {
        let mut plan = Plan::new("demo");
        let mut block = Block::new(plan.id, "b1");
        let seq = Sequence::new(plan.id, "s1");
        seq.state.start();
        seq.state.finish(Status::Completed);
        block.sequences = vec![seq];
        plan.blocks = vec![block];

        let opts = CloneOptions {
            remove_completed: true,
            ..Default::default()
        };
        let once = clone_plan(&plan, opts, &NoSecrets);
        let twice = clone_plan(&once, opts, &NoSecrets);
        assert_eq!(once.blocks.len(), twice.blocks.len());
    }

    #[test]
    fn keep_state_false_regenerates_ids_and_clears_attempts() {
        let plan = sample();
        let original_id = plan.id;
        let opts = CloneOptions {
            keep_state: false,
            ..Default::default()
        };
        let out = clone_plan(&plan, opts, &PasswordSecure);
        assert_ne!(out.id, original_id);
        assert!(out.pre.as_ref().unwrap().actions[0].attempts.is_empty());
        assert_eq!(out.pre.as_ref().unwrap().plan_id, out.id);
    }
}
