//! Planner agent: turns requirements into a modeling plan, once per run.

use std::time::Duration;

use tracing::{debug, instrument};

use crate::core::graph::StepName;
use crate::core::schema::{PLAN_RESULT, SchemaDescriptor};
use crate::core::state::{StateUpdate, WorkflowState};
use crate::core::types::PlanResult;
use crate::error::WorkflowError;
use crate::io::prompt::{PLANNER_INSTRUCTION, PlanInputs, PromptBuilder};
use crate::io::responder::{ResponseRequest, StructuredResponder, invoke_structured};

use super::{StepOutput, prompt_error, request, require};

const STEP: StepName = StepName::Plan;

#[derive(Debug, Clone)]
pub struct PlannerAgent {
    prompts: PromptBuilder,
}

impl PlannerAgent {
    pub fn new(prompt_budget_bytes: usize) -> Self {
        Self {
            prompts: PromptBuilder::new(prompt_budget_bytes),
        }
    }

    pub fn schema(&self) -> &'static SchemaDescriptor {
        &PLAN_RESULT
    }

    pub fn build_request(
        &self,
        run_id: &str,
        state: &WorkflowState,
        timeout: Duration,
    ) -> Result<ResponseRequest, WorkflowError> {
        let requirements = require(STEP, state.requirements.as_ref(), "requirements")?;
        if state.plan_result.is_some() {
            return Err(WorkflowError::Precondition {
                step: STEP,
                detail: "plan_result already exists; planning happens once per run".to_string(),
            });
        }

        let payload = self
            .prompts
            .build_plan(&PlanInputs { requirements })
            .map_err(|err| prompt_error(STEP, err))?
            .render();
        Ok(request(
            run_id,
            STEP,
            PLANNER_INSTRUCTION,
            payload,
            self.schema(),
            timeout,
        ))
    }

    #[instrument(skip_all, fields(run_id = %run_id))]
    pub async fn run<R: StructuredResponder + ?Sized>(
        &self,
        responder: &R,
        run_id: &str,
        state: &WorkflowState,
        timeout: Duration,
    ) -> Result<StepOutput, WorkflowError> {
        let request = self.build_request(run_id, state, timeout)?;
        let plan: PlanResult = invoke_structured(responder, &request).await?;
        debug!(plan_bytes = plan.plan_body.len(), "plan produced");
        Ok(StepOutput {
            update: StateUpdate {
                plan_result: Some(plan),
                ..StateUpdate::default()
            },
            payload: Some(request.user_payload),
        })
    }
}
