//! The DTOs written as the individual blobs: `PlanEntry` (IDs +
//! denormalized state) and one reference-holding entry per non-leaf
//! sub-object (`BlockEntry`, `ChecksEntry`, `SequenceEntry`). `Action` is a
//! leaf (its only children are append-only `Attempt`s), so its blob is the
//! domain `Action` type directly.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::model::{
    Action, Block, CheckRole, Checks, EntityId, FailureReason, Plan, Sequence, StateFields,
    StateRecord,
};

use super::wire::{iso8601_duration, rfc3339_nanos};

/// `plans/<planID>-entry.json`. Denormalized fields mirror the blob
/// metadata (`planid, groupid, name, descr, submittime, state,
/// plantype=entry`); this crate keeps them in the body
/// since a custom-metadata attribute is not portable across every backend
/// `object_store` supports.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PlanEntry {
    pub plantype: String,
    pub plan_id: EntityId,
    pub group_id: Option<EntityId>,
    pub name: String,
    pub descr: String,
    #[serde(with = "meta_base64")]
    pub meta: Vec<u8>,
    #[serde(with = "rfc3339_nanos")]
    pub submit_time: DateTime<Utc>,
    pub failure_reason: FailureReason,
    pub state: StateFields,
    pub bypass: Option<EntityId>,
    pub pre: Option<EntityId>,
    pub cont: Option<EntityId>,
    pub post: Option<EntityId>,
    pub deferred: Option<EntityId>,
    pub blocks: Vec<EntityId>,
}

impl PlanEntry {
    pub fn from_plan(plan: &Plan) -> Self {
        Self {
            plantype: "entry".to_string(),
            plan_id: plan.id,
            group_id: plan.group_id,
            name: plan.name.clone(),
            descr: plan.descr.clone(),
            meta: plan.meta.clone(),
            submit_time: plan.submit_time,
            failure_reason: plan.failure_reason,
            state: plan.state_fields(),
            bypass: plan.bypass.as_ref().map(|c| c.id),
            pre: plan.pre.as_ref().map(|c| c.id),
            cont: plan.cont.as_ref().map(|c| c.id),
            post: plan.post.as_ref().map(|c| c.id),
            deferred: plan.deferred.as_ref().map(|c| c.id),
            blocks: plan.blocks.iter().map(|b| b.id).collect(),
        }
    }
}

/// `checks/<planID>/<checksID>.json`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ChecksEntry {
    pub id: EntityId,
    pub plan_id: EntityId,
    pub role: CheckRole,
    #[serde(with = "iso8601_duration")]
    pub delay: std::time::Duration,
    pub actions: Vec<EntityId>,
    pub state: StateFields,
}

impl ChecksEntry {
    pub fn from_checks(checks: &Checks) -> Self {
        Self {
            id: checks.id,
            plan_id: checks.plan_id,
            role: checks.role,
            delay: checks.delay,
            actions: checks.actions.iter().map(|a| a.id).collect(),
            state: checks.state.get(),
        }
    }
}

/// `sequences/<planID>/<seqID>.json`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SequenceEntry {
    pub id: EntityId,
    pub plan_id: EntityId,
    pub name: String,
    pub descr: String,
    pub actions: Vec<EntityId>,
    pub state: StateFields,
}

impl SequenceEntry {
    pub fn from_sequence(sequence: &Sequence) -> Self {
        Self {
            id: sequence.id,
            plan_id: sequence.plan_id,
            name: sequence.name.clone(),
            descr: sequence.descr.clone(),
            actions: sequence.actions.iter().map(|a| a.id).collect(),
            state: sequence.state.get(),
        }
    }
}

/// `blocks/<planID>/<blockID>.json`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BlockEntry {
    pub id: EntityId,
    pub plan_id: EntityId,
    pub name: String,
    pub descr: String,
    #[serde(with = "iso8601_duration")]
    pub entrance_delay: std::time::Duration,
    #[serde(with = "iso8601_duration")]
    pub exit_delay: std::time::Duration,
    pub concurrency: u32,
    pub tolerated_failures: u32,
    pub bypass: Option<EntityId>,
    pub pre: Option<EntityId>,
    pub cont: Option<EntityId>,
    pub post: Option<EntityId>,
    pub deferred: Option<EntityId>,
    pub sequences: Vec<EntityId>,
    pub state: StateFields,
}

impl BlockEntry {
    pub fn from_block(block: &Block) -> Self {
        Self {
            id: block.id,
            plan_id: block.plan_id,
            name: block.name.clone(),
            descr: block.descr.clone(),
            entrance_delay: block.entrance_delay,
            exit_delay: block.exit_delay,
            concurrency: block.concurrency,
            tolerated_failures: block.tolerated_failures,
            bypass: block.bypass.as_ref().map(|c| c.id),
            pre: block.pre.as_ref().map(|c| c.id),
            cont: block.cont.as_ref().map(|c| c.id),
            post: block.post.as_ref().map(|c| c.id),
            deferred: block.deferred.as_ref().map(|c| c.id),
            sequences: block.sequences.iter().map(|s| s.id).collect(),
            state: block.state.get(),
        }
    }
}

/// Rebuild a [`Checks`] from its entry plus the already-read `Action`s it
/// references, in the order the entry declares them.
pub fn checks_from_entry(entry: ChecksEntry, actions_by_id: &std::collections::HashMap<EntityId, Action>) -> Checks {
    Checks {
        id: entry.id,
        plan_id: entry.plan_id,
        role: entry.role,
        delay: entry.delay,
        actions: entry
            .actions
            .iter()
            .filter_map(|id| actions_by_id.get(id).cloned())
            .collect(),
        state: StateRecord::from_fields(entry.state),
    }
}

pub fn sequence_from_entry(
    entry: SequenceEntry,
    actions_by_id: &std::collections::HashMap<EntityId, Action>,
) -> Sequence {
    Sequence {
        id: entry.id,
        plan_id: entry.plan_id,
        name: entry.name,
        descr: entry.descr,
        actions: entry
            .actions
            .iter()
            .filter_map(|id| actions_by_id.get(id).cloned())
            .collect(),
        state: StateRecord::from_fields(entry.state),
    }
}

#[allow(clippy::too_many_arguments)]
pub fn block_from_entry(
    entry: BlockEntry,
    checks_by_id: &std::collections::HashMap<EntityId, Checks>,
    sequences_by_id: &std::collections::HashMap<EntityId, Sequence>,
) -> Block {
    Block {
        id: entry.id,
        plan_id: entry.plan_id,
        name: entry.name,
        descr: entry.descr,
        entrance_delay: entry.entrance_delay,
        exit_delay: entry.exit_delay,
        concurrency: entry.concurrency,
        tolerated_failures: entry.tolerated_failures,
        bypass: entry.bypass.and_then(|id| checks_by_id.get(&id).cloned()),
        pre: entry.pre.and_then(|id| checks_by_id.get(&id).cloned()),
        cont: entry.cont.and_then(|id| checks_by_id.get(&id).cloned()),
        post: entry.post.and_then(|id| checks_by_id.get(&id).cloned()),
        deferred: entry.deferred.and_then(|id| checks_by_id.get(&id).cloned()),
        sequences: entry
            .sequences
            .iter()
            .filter_map(|id| sequences_by_id.get(id).cloned())
            .collect(),
        state: StateRecord::from_fields(entry.state),
    }
}

pub fn plan_from_entry(
    entry: PlanEntry,
    checks_by_id: &std::collections::HashMap<EntityId, Checks>,
    blocks_by_id: &std::collections::HashMap<EntityId, Block>,
) -> Plan {
    Plan {
        id: entry.plan_id,
        group_id: entry.group_id,
        name: entry.name,
        descr: entry.descr,
        meta: entry.meta,
        submit_time: entry.submit_time,
        failure_reason: entry.failure_reason,
        bypass: entry.bypass.and_then(|id| checks_by_id.get(&id).cloned()),
        pre: entry.pre.and_then(|id| checks_by_id.get(&id).cloned()),
        cont: entry.cont.and_then(|id| checks_by_id.get(&id).cloned()),
        post: entry.post.and_then(|id| checks_by_id.get(&id).cloned()),
        deferred: entry.deferred.and_then(|id| checks_by_id.get(&id).cloned()),
        blocks: entry
            .blocks
            .iter()
            .filter_map(|id| blocks_by_id.get(id).cloned())
            .collect(),
        state: StateRecord::from_fields(entry.state),
    }
}

mod meta_base64 {
    use base64::Engine;
    use serde::{Deserialize, Deserializer, Serializer};

    pub fn serialize<S>(bytes: &[u8], serializer: S) -> Result<S::Ok, S::Error>
    where
        S: Serializer,
    {
        serializer.serialize_str(&base64::engine::general_purpose::STANDARD.encode(bytes))
    }

    pub fn deserialize<'de, D>(deserializer: D) -> Result<Vec<u8>, D::Error>
    where
        D: Deserializer<'de>,
    {
        let s = String::deserialize(deserializer)?;
        base64::engine::general_purpose::STANDARD
            .decode(s.as_bytes())
            .map_err(serde::de::Error::custom)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::{CheckRole, EntityId as Id};

    #[test]
    fn plan_entry_round_trips_through_json() {
        let plan = Plan::new("demo");
        let entry = PlanEntry::from_plan(&plan);
        let json = serde_json::to_string(&entry).unwrap();
        let back: PlanEntry = serde_json::from_str(&json).unwrap();
        assert_eq!(back.plan_id, plan.id);
        assert_eq!(back.plantype, "entry");
    }

    #[test]
    fn checks_entry_references_action_ids_not_bodies() {
        let plan_id = Id::new();
        let action = Action::new(plan_id, "a1", "noop", serde_json::json!({}));
        let checks = Checks::new(plan_id, CheckRole::Pre).with_actions(vec![action.clone()]);
        let entry = ChecksEntry::from_checks(&checks);
        assert_eq!(entry.actions, vec![action.id]);

        let mut by_id = std::collections::HashMap::new();
        by_id.insert(action.id, action.clone());
        let rebuilt = checks_from_entry(entry, &by_id);
        assert_eq!(rebuilt.actions.len(), 1);
        assert_eq!(rebuilt.actions[0].id, action.id);
    }
}
