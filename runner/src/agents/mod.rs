//! Model-backed workflow steps.
//!
//! Each agent owns its target schema, its system instruction and its payload
//! budget. Agents check their preconditions, build the request, and turn the
//! structured response into a partial state update. They never touch the
//! state directly and never retry.

use std::time::Duration;

use crate::core::graph::StepName;
use crate::core::schema::SchemaDescriptor;
use crate::core::state::StateUpdate;
use crate::error::WorkflowError;
use crate::io::responder::ResponseRequest;

pub mod generator;
pub mod planner;
pub mod validator;

/// What a step hands back to the engine.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StepOutput {
    pub update: StateUpdate,
    /// User payload sent to the capability, if one was invoked.
    pub payload: Option<String>,
}

/// Borrow a required input or fail with a precondition error naming it.
pub(crate) fn require<'a, T>(
    step: StepName,
    value: Option<&'a T>,
    field: &str,
) -> Result<&'a T, WorkflowError> {
    value.ok_or_else(|| WorkflowError::Precondition {
        step,
        detail: format!("{field} is missing"),
    })
}

pub(crate) fn prompt_error(step: StepName, err: anyhow::Error) -> WorkflowError {
    WorkflowError::Prompt {
        step,
        detail: format!("{err:#}"),
    }
}

pub(crate) fn request(
    run_id: &str,
    step: StepName,
    system_instruction: &str,
    user_payload: String,
    schema: &'static SchemaDescriptor,
    timeout: Duration,
) -> ResponseRequest {
    ResponseRequest {
        run_id: run_id.to_string(),
        step,
        system_instruction: system_instruction.to_string(),
        user_payload,
        schema,
        timeout,
    }
}
