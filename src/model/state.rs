//! Atomic state records shared by every entity in a plan tree

use chrono::{DateTime, Utc};
use parking_lot::RwLock;
use serde::{Deserialize, Serialize};

/// Lifecycle status of any entity in the tree.
///
/// Transitions form a DAG: `NotStarted -> Running -> {Completed, Failed,
/// Stopped}`. No other transition is allowed.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Status {
    NotStarted,
    Running,
    Completed,
    Failed,
    Stopped,
}

impl Status {
    /// Whether `self -> next` is an allowed transition.
    pub fn can_transition_to(self, next: Status) -> bool {
        use Status::*;
        matches!(
            (self, next),
            (NotStarted, Running)
                | (Running, Completed)
                | (Running, Failed)
                | (Running, Stopped)
        )
    }

    pub fn is_terminal(self) -> bool {
        matches!(self, Status::Completed | Status::Failed | Status::Stopped)
    }
}

impl Default for Status {
    fn default() -> Self {
        Status::NotStarted
    }
}

/// Coarse classification of why a plan ended `Failed`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FailureReason {
    Unknown,
    PreCheck,
    ContCheck,
    PostCheck,
    Block,
    ExceedRecovery,
}

impl Default for FailureReason {
    fn default() -> Self {
        FailureReason::Unknown
    }
}

/// Kind of object a blob/ID refers to, used by the store to route reads.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ObjectType {
    Plan,
    Block,
    Checks,
    Sequence,
    Action,
}

/// Which of the five check roles a `Checks` group plays.
///
/// All five roles share the same shape (spec: "Checks... semantics differ
/// by role"); giving them an explicit enum lets the walk iterator and store
/// address "which checks group is this" generically instead of repeating
/// near-duplicate match arms per role.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CheckRole {
    Bypass,
    Pre,
    Cont,
    Post,
    Deferred,
}

/// `{Status, Start, End}` mutated atomically from concurrent readers and
/// writers.
///
/// Guarded by a `parking_lot::RwLock` rather than plain fields: this triple
/// must be read/written atomically, and block/sequence dispatch reads
/// status concurrently with the writer that owns the transition.
#[derive(Debug, Default)]
pub struct StateRecord {
    inner: RwLock<StateFields>,
}

#[derive(Debug, Clone, Copy, Default, Serialize, Deserialize)]
pub struct StateFields {
    pub status: Status,
    pub start: Option<DateTime<Utc>>,
    pub end: Option<DateTime<Utc>>,
}

impl StateRecord {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn from_fields(fields: StateFields) -> Self {
        Self {
            inner: RwLock::new(fields),
        }
    }

    pub fn get(&self) -> StateFields {
        *self.inner.read()
    }

    pub fn status(&self) -> Status {
        self.inner.read().status
    }

    /// Transition to `Running`, stamping `start = now`.
    ///
    /// Panics if the current status cannot transition to `Running` — this
    /// is an internal invariant violation (the executor never attempts an
    /// illegal transition), not a caller error to recover from.
    pub fn start(&self) {
        let mut fields = self.inner.write();
        assert!(
            fields.status.can_transition_to(Status::Running),
            "illegal transition {:?} -> Running",
            fields.status
        );
        fields.status = Status::Running;
        fields.start = Some(Utc::now());
    }

    /// Transition to a terminal status, stamping `end = now`.
    pub fn finish(&self, status: Status) {
        let mut fields = self.inner.write();
        assert!(status.is_terminal(), "finish() requires a terminal status");
        assert!(
            fields.status.can_transition_to(status),
            "illegal transition {:?} -> {:?}",
            fields.status,
            status
        );
        fields.status = status;
        fields.end = Some(Utc::now());
    }
}

impl Clone for StateRecord {
    fn clone(&self) -> Self {
        Self::from_fields(self.get())
    }
}

impl Serialize for StateRecord {
    fn serialize<S>(&self, serializer: S) -> Result<S::Ok, S::Error>
    where
        S: serde::Serializer,
    {
        self.get().serialize(serializer)
    }
}

impl<'de> Deserialize<'de> for StateRecord {
    fn deserialize<D>(deserializer: D) -> Result<Self, D::Error>
    where
        D: serde::Deserializer<'de>,
    {
        Ok(Self::from_fields(StateFields::deserialize(deserializer)?))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn submitted_state_is_not_started_with_zero_times() {
        let record = StateRecord::new();
        let fields = record.get();
        assert_eq!(fields.status, Status::NotStarted);
        assert!(fields.start.is_none());
        assert!(fields.end.is_none());
    }

    #[test]
    fn start_then_finish_stamps_both_times() {
        let record = StateRecord::new();
        record.start();
        assert_eq!(record.status(), Status::Running);
        assert!(record.get().start.is_some());

        record.finish(Status::Completed);
        let fields = record.get();
        assert_eq!(fields.status, Status::Completed);
        assert!(fields.start.unwrap() <= fields.end.unwrap());
    }

    #[test]
    #[should_panic]
    fn cannot_skip_running() {
        let record = StateRecord::new();
        record.finish(Status::Completed);
    }

    #[test]
    #[should_panic]
    fn cannot_transition_backwards() {
        let record = StateRecord::new();
        record.start();
        record.finish(Status::Failed);
        record.start();
    }
}
