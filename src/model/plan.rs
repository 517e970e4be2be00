//! The plan tree: `Plan -> Block -> Sequence -> Action`, plus `Checks`
//! attached at the Plan and Block level.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use super::id::EntityId;
use super::state::{CheckRole, FailureReason, StateFields, StateRecord};

/// One execution of an action, recorded append-only on `Action::attempts`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Attempt {
    pub resp: Option<serde_json::Value>,
    pub err: Option<AttemptError>,
    pub start: DateTime<Utc>,
    pub end: Option<DateTime<Utc>>,
}

impl Attempt {
    pub fn started() -> Self {
        Self {
            resp: None,
            err: None,
            start: Utc::now(),
            end: None,
        }
    }

    pub fn succeed(&mut self, resp: serde_json::Value) {
        self.resp = Some(resp);
        self.end = Some(Utc::now());
    }

    pub fn fail(&mut self, err: AttemptError) {
        self.err = Some(err);
        self.end = Some(Utc::now());
    }

    pub fn succeeded(&self) -> bool {
        self.end.is_some() && self.err.is_none()
    }
}

/// Structured error recorded on a failed attempt.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AttemptError {
    pub message: String,
    pub permanent: bool,
}

impl AttemptError {
    pub fn new(message: impl Into<String>, permanent: bool) -> Self {
        Self {
            message: message.into(),
            permanent,
        }
    }
}

/// One invocation of a plugin with a request/response pair.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Action {
    pub id: EntityId,
    pub plan_id: EntityId,
    pub name: String,
    pub descr: String,
    pub plugin: String,
    #[serde(with = "duration_millis")]
    pub timeout: std::time::Duration,
    pub retries: u32,
    pub req: serde_json::Value,
    pub attempts: Vec<Attempt>,
    pub state: StateRecord,
}

impl Action {
    pub fn new(
        plan_id: EntityId,
        name: impl Into<String>,
        plugin: impl Into<String>,
        req: serde_json::Value,
    ) -> Self {
        Self {
            id: EntityId::new(),
            plan_id,
            name: name.into(),
            descr: String::new(),
            plugin: plugin.into(),
            timeout: std::time::Duration::from_secs(30),
            retries: 0,
            req,
            attempts: Vec::new(),
            state: StateRecord::new(),
        }
    }

    pub fn with_retries(mut self, retries: u32) -> Self {
        self.retries = retries;
        self
    }

    pub fn with_timeout(mut self, timeout: std::time::Duration) -> Self {
        self.timeout = timeout;
        self
    }
}

/// A gate: an ordered list of actions used as Bypass/Pre/Cont/Post/Deferred.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Checks {
    pub id: EntityId,
    pub plan_id: EntityId,
    pub role: CheckRole,
    /// Only meaningful for the Cont role: the wait between iterations.
    #[serde(with = "duration_millis")]
    pub delay: std::time::Duration,
    pub actions: Vec<Action>,
    pub state: StateRecord,
}

impl Checks {
    pub fn new(plan_id: EntityId, role: CheckRole) -> Self {
        Self {
            id: EntityId::new(),
            plan_id,
            role,
            delay: std::time::Duration::ZERO,
            actions: Vec::new(),
            state: StateRecord::new(),
        }
    }

    pub fn with_delay(mut self, delay: std::time::Duration) -> Self {
        self.delay = delay;
        self
    }

    pub fn with_actions(mut self, actions: Vec<Action>) -> Self {
        self.actions = actions;
        self
    }
}

/// An ordered list of actions run strictly in sequence; failure of any
/// action fails the sequence.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Sequence {
    pub id: EntityId,
    pub plan_id: EntityId,
    pub name: String,
    pub descr: String,
    pub actions: Vec<Action>,
    pub state: StateRecord,
}

impl Sequence {
    pub fn new(plan_id: EntityId, name: impl Into<String>) -> Self {
        Self {
            id: EntityId::new(),
            plan_id,
            name: name.into(),
            descr: String::new(),
            actions: Vec::new(),
            state: StateRecord::new(),
        }
    }

    pub fn with_actions(mut self, actions: Vec<Action>) -> Self {
        self.actions = actions;
        self
    }
}

/// A bounded-concurrency group of sequences with its own checks and
/// tolerance.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Block {
    pub id: EntityId,
    pub plan_id: EntityId,
    pub name: String,
    pub descr: String,
    #[serde(with = "duration_millis")]
    pub entrance_delay: std::time::Duration,
    #[serde(with = "duration_millis")]
    pub exit_delay: std::time::Duration,
    pub concurrency: u32,
    pub tolerated_failures: u32,
    pub bypass: Option<Checks>,
    pub pre: Option<Checks>,
    pub cont: Option<Checks>,
    pub post: Option<Checks>,
    pub deferred: Option<Checks>,
    pub sequences: Vec<Sequence>,
    pub state: StateRecord,
}

impl Block {
    pub fn new(plan_id: EntityId, name: impl Into<String>) -> Self {
        Self {
            id: EntityId::new(),
            plan_id,
            name: name.into(),
            descr: String::new(),
            entrance_delay: std::time::Duration::ZERO,
            exit_delay: std::time::Duration::ZERO,
            concurrency: 1,
            tolerated_failures: 0,
            bypass: None,
            pre: None,
            cont: None,
            post: None,
            deferred: None,
            sequences: Vec::new(),
            state: StateRecord::new(),
        }
    }

    pub fn with_concurrency(mut self, concurrency: u32) -> Self {
        self.concurrency = concurrency.max(1);
        self
    }

    pub fn with_tolerated_failures(mut self, tolerated: u32) -> Self {
        self.tolerated_failures = tolerated;
        self
    }

    pub fn with_sequences(mut self, sequences: Vec<Sequence>) -> Self {
        self.sequences = sequences;
        self
    }
}

/// The root of a workflow: a tree of checks and blocks.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Plan {
    pub id: EntityId,
    pub group_id: Option<EntityId>,
    pub name: String,
    pub descr: String,
    #[serde(with = "serde_bytes_opt")]
    pub meta: Vec<u8>,
    pub submit_time: DateTime<Utc>,
    pub failure_reason: FailureReason,
    pub bypass: Option<Checks>,
    pub pre: Option<Checks>,
    pub cont: Option<Checks>,
    pub post: Option<Checks>,
    pub deferred: Option<Checks>,
    pub blocks: Vec<Block>,
    pub state: StateRecord,
}

impl Plan {
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            id: EntityId::new(),
            group_id: None,
            name: name.into(),
            descr: String::new(),
            meta: Vec::new(),
            submit_time: Utc::now(),
            failure_reason: FailureReason::Unknown,
            bypass: None,
            pre: None,
            cont: None,
            post: None,
            deferred: None,
            blocks: Vec::new(),
            state: StateRecord::new(),
        }
    }

    pub fn with_blocks(mut self, blocks: Vec<Block>) -> Self {
        self.blocks = blocks;
        self
    }

    pub fn state_fields(&self) -> StateFields {
        self.state.get()
    }
}

/// The plan tree round-trips through the blob store as a whole (the object
/// blob holds this type verbatim), so its durations use the same ISO-8601
/// string convention as the entry DTOs in `store/blob/wire.rs` rather than a
/// millisecond integer — there is no in-process-only `Duration` field on
/// this tree that stays off the wire.
mod duration_millis {
    pub use crate::store::blob::wire::iso8601_duration::{deserialize, serialize};
}

/// `meta` round-trips as a base64 string on the wire; kept simple since the
/// core treats it as fully opaque.
mod serde_bytes_opt {
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

    #[test]
    fn new_plan_has_zero_state() {
        let plan = Plan::new("demo");
        let fields = plan.state_fields();
        assert_eq!(fields.status, super::super::state::Status::NotStarted);
        assert!(fields.start.is_none());
        assert_eq!(plan.failure_reason, FailureReason::Unknown);
    }
}
