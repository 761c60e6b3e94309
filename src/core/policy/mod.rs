//! Policy execution: step-by-step state machine for commands drained from
//! the inbox, with progress persisted after every step.

pub mod coordinator;
pub mod executor;
pub mod results;
pub mod types;

use crate::core::inbox::InboxError;
use crate::core::outbox::OutboxError;
use crate::core::store::StoreError;

pub use coordinator::{CoordinatorConfig, DrainReport, PolicyCoordinator};
pub use executor::{ShellStepExecutor, StepContext, StepExecutor, StepOutput};
pub use results::PolicyResultStore;
pub use types::{
    ExecutionStatus, FinalStatus, PolicyDefinition, PolicyExecutionResult, PolicyStep,
    PolicyStepResult, RawCommand, ScriptExecutionResult,
};

#[derive(Debug, thiserror::Error)]
pub enum PolicyError {
    #[error("policy execution {0} is already finished")]
    AlreadyFinished(String),
    #[error("policy execution {execution_id} already holds all {total_steps} step result(s)")]
    StepOverflow {
        execution_id: String,
        total_steps: u32,
    },
    #[error("policy execution {execution_id} expected step {expected}, got step {got}")]
    OutOfOrderStep {
        execution_id: String,
        expected: u32,
        got: u32,
    },
    #[error("policy execution {execution_id} violates its invariants: {reason}")]
    InvariantViolation {
        execution_id: String,
        reason: String,
    },
    #[error(
        "policy execution {execution_id} was recorded with {recorded} step(s) but the policy defines {defined}"
    )]
    DefinitionMismatch {
        execution_id: String,
        recorded: u32,
        defined: usize,
    },
    #[error("policy defines too many steps ({0})")]
    TooManySteps(usize),
    #[error("failed to encode step results: {0}")]
    Serialization(#[from] serde_json::Error),
    #[error(transparent)]
    Inbox(#[from] InboxError),
    #[error(transparent)]
    Outbox(#[from] OutboxError),
    #[error(transparent)]
    Store(#[from] StoreError),
}

#[cfg(test)]
mod tests;
