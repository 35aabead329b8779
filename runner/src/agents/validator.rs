//! Validator agent: judges the current artifact against requirements and plan.

use std::time::Duration;

use tracing::{debug, instrument};

use crate::core::graph::StepName;
use crate::core::schema::{SchemaDescriptor, VALIDATION_RESULT};
use crate::core::state::{StateUpdate, WorkflowState};
use crate::core::types::ValidationResult;
use crate::error::WorkflowError;
use crate::io::prompt::{PromptBuilder, VALIDATOR_INSTRUCTION, ValidateInputs};
use crate::io::responder::{ResponseRequest, StructuredResponder, invoke_structured};

use super::{StepOutput, prompt_error, request, require};

const STEP: StepName = StepName::Validate;

#[derive(Debug, Clone)]
pub struct ValidatorAgent {
    prompts: PromptBuilder,
}

impl ValidatorAgent {
    pub fn new(prompt_budget_bytes: usize) -> Self {
        Self {
            prompts: PromptBuilder::new(prompt_budget_bytes),
        }
    }

    pub fn schema(&self) -> &'static SchemaDescriptor {
        &VALIDATION_RESULT
    }

    pub fn build_request(
        &self,
        run_id: &str,
        state: &WorkflowState,
        timeout: Duration,
    ) -> Result<ResponseRequest, WorkflowError> {
        let requirements = require(STEP, state.requirements.as_ref(), "requirements")?;
        let plan = require(STEP, state.plan_result.as_ref(), "plan_result")?;
        let generation = require(STEP, state.generation_result.as_ref(), "generation_result")?;

        let payload = self
            .prompts
            .build_validate(&ValidateInputs {
                requirements,
                plan_summary: &plan.summary,
                plan: &plan.plan_body,
                artifact: &generation.artifact,
                generator_comments: &generation.comments,
            })
            .map_err(|err| prompt_error(STEP, err))?
            .render();
        Ok(request(
            run_id,
            STEP,
            VALIDATOR_INSTRUCTION,
            payload,
            self.schema(),
            timeout,
        ))
    }

    #[instrument(skip_all, fields(run_id = %run_id, retry_count = state.retry_count))]
    pub async fn run<R: StructuredResponder + ?Sized>(
        &self,
        responder: &R,
        run_id: &str,
        state: &WorkflowState,
        timeout: Duration,
    ) -> Result<StepOutput, WorkflowError> {
        let request = self.build_request(run_id, state, timeout)?;
        let validation: ValidationResult = invoke_structured(responder, &request).await?;
        debug!(outcome = validation.outcome.as_str(), "artifact validated");
        Ok(StepOutput {
            update: StateUpdate {
                validation_result: Some(validation),
                ..StateUpdate::default()
            },
            payload: Some(request.user_payload),
        })
    }
}
