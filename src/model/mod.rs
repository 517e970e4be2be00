//! The hierarchical workflow data model: entities, atomic state records, the
//! walk iterator, and deep-clone/redaction semantics.

pub mod clone;
pub mod id;
pub mod plan;
pub mod state;
pub mod walk;

pub use clone::{clone_plan, CloneOptions, NoSecrets, SecureFields, SecureFieldsLookup};
pub use id::EntityId;
pub use plan::{Action, Attempt, AttemptError, Block, Checks, Plan, Sequence};
pub use state::{CheckRole, FailureReason, ObjectType, StateFields, StateRecord, Status};
pub use walk::{Node, Walk, WalkItem};
