//! Plan execution: the nested state machines (plan, block, action, checks)
//! and the service that drives them end to end.

mod action_machine;
mod block_machine;
mod checks;
mod error;
mod plan_machine;
mod recovery;
mod service;
mod util;

pub use error::ExecutorError;
pub use plan_machine::run_plan;
pub use service::{ExecutionService, ExecutorConfig};
