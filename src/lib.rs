// Durable workflow execution engine: hierarchical plans, nested
// state-machine executor, blob-backed store.

// Data model: entities, atomic state, walk iterator, clone/redaction
pub mod model;

// Action capability contract and registry
pub mod plugin;

// Retry/backoff policy shared by the action machine and plugin defaults
pub mod retry;

// Durable store contract and blob-backed implementation
pub mod store;

// Plan execution: nested state machines and the driving service
pub mod exec;

pub use exec::{ExecutionService, ExecutorConfig, ExecutorError};
pub use model::{
    Action, Attempt, AttemptError, Block, CheckRole, Checks, EntityId, FailureReason, ObjectType,
    Plan, Sequence, StateFields, StateRecord, Status,
};
pub use plugin::{Plugin, PluginContext, PluginError, PluginRegistry};
pub use store::{BlobStore, BlobStoreConfig, Store, StoreError};
