//! Executor-facing error kinds.

use crate::model::EntityId;

#[derive(Debug, thiserror::Error)]
pub enum ExecutorError {
    #[error("plan not found: {0}")]
    NotFound(EntityId),

    /// The plan is not in a state `Start` accepts: not `NotStarted`, a
    /// stale submit time, a bad id, an unknown plugin, or an action with
    /// prior attempts.
    #[error("invalid state: {0}")]
    InvalidState(String),

    #[error("internal error: {0}")]
    Internal(String),
}

impl From<crate::store::StoreError> for ExecutorError {
    fn from(err: crate::store::StoreError) -> Self {
        match err {
            crate::store::StoreError::NotFound(msg) => {
                ExecutorError::Internal(format!("store NotFound outside a lookup path: {msg}"))
            }
            other => ExecutorError::Internal(other.to_string()),
        }
    }
}
