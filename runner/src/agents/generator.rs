//! Generator agent: produces the model artifact, and revises it after an
//! invalid validation.

use std::time::Duration;

use tracing::{debug, instrument};

use crate::core::graph::StepName;
use crate::core::schema::{GENERATION_RESULT, SchemaDescriptor};
use crate::core::state::{StateUpdate, WorkflowState};
use crate::core::types::{GenerationResult, ValidationOutcome};
use crate::error::WorkflowError;
use crate::io::prompt::{GENERATOR_INSTRUCTION, GenerateInputs, PreviousAttempt, PromptBuilder};
use crate::io::responder::{ResponseRequest, StructuredResponder, invoke_structured};

use super::{StepOutput, prompt_error, request, require};

const STEP: StepName = StepName::Generate;

#[derive(Debug, Clone)]
pub struct GeneratorAgent {
    prompts: PromptBuilder,
}

impl GeneratorAgent {
    pub fn new(prompt_budget_bytes: usize) -> Self {
        Self {
            prompts: PromptBuilder::new(prompt_budget_bytes),
        }
    }

    pub fn schema(&self) -> &'static SchemaDescriptor {
        &GENERATION_RESULT
    }

    /// Build the request for a first attempt or, after an invalid validation,
    /// for a regeneration that carries the rejected artifact and its feedback.
    ///
    /// Entering with a `valid` outcome on record is a precondition failure.
    pub fn build_request(
        &self,
        run_id: &str,
        state: &WorkflowState,
        timeout: Duration,
    ) -> Result<ResponseRequest, WorkflowError> {
        let requirements = require(STEP, state.requirements.as_ref(), "requirements")?;
        let plan = require(STEP, state.plan_result.as_ref(), "plan_result")?;

        let previous = match &state.validation_result {
            None => None,
            Some(validation) if validation.outcome == ValidationOutcome::Valid => {
                return Err(WorkflowError::Precondition {
                    step: STEP,
                    detail: "the last validation was valid; nothing to regenerate".to_string(),
                });
            }
            Some(validation) => {
                let generation = require(STEP, state.generation_result.as_ref(), "generation_result")?;
                Some(PreviousAttempt {
                    artifact: &generation.artifact,
                    comments: &generation.comments,
                    feedback: &validation.feedback,
                })
            }
        };
        debug!(regeneration = previous.is_some(), retry_count = state.retry_count, "building generate payload");

        let payload = self
            .prompts
            .build_generate(&GenerateInputs {
                requirements,
                plan: &plan.plan_body,
                previous,
            })
            .map_err(|err| prompt_error(STEP, err))?
            .render();
        Ok(request(
            run_id,
            STEP,
            GENERATOR_INSTRUCTION,
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
        let generation: GenerationResult = invoke_structured(responder, &request).await?;
        debug!(artifact_bytes = generation.artifact.len(), "artifact generated");
        Ok(StepOutput {
            update: StateUpdate {
                generation_result: Some(generation),
                ..StateUpdate::default()
            },
            payload: Some(request.user_payload),
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::test_support::{
        ScriptedResponder, generation_reply, initialized_state, model_text, plan_result,
        validated_state,
    };

    const TIMEOUT: Duration = Duration::from_secs(5);

    fn planned_state() -> WorkflowState {
        let mut state = initialized_state("The bulb shall emit 800 lm.", 2);
        state.plan_result = Some(plan_result());
        state
    }

    #[tokio::test]
    async fn first_attempt_sends_requirements_and_plan_only() {
        let responder = ScriptedResponder::new().with(StepName::Generate, [generation_reply(1)]);

        let output = GeneratorAgent::new(10_000)
            .run(&responder, "run-1", &planned_state(), TIMEOUT)
            .await
            .expect("generate");

        let generation = output.update.generation_result.expect("generation");
        assert_eq!(generation.artifact, model_text(1));
        let payload = &responder.payloads(StepName::Generate)[0];
        assert!(payload.contains("The bulb shall emit 800 lm."));
        assert!(payload.contains("1. Define part Bulb."));
        assert!(!payload.contains("<Feedback>"));
    }

    /// After an invalid validation the payload carries the prior artifact and
    /// the validator's feedback text.
    #[tokio::test]
    async fn regeneration_includes_prior_artifact_and_feedback() {
        let responder = ScriptedResponder::new().with(StepName::Generate, [generation_reply(2)]);
        let state = validated_state(ValidationOutcome::Invalid, "add attribute luminousFlux");

        GeneratorAgent::new(10_000)
            .run(&responder, "run-1", &state, TIMEOUT)
            .await
            .expect("regenerate");

        let payload = &responder.payloads(StepName::Generate)[0];
        assert!(payload.contains(&model_text(1)));
        assert!(payload.contains("add attribute luminousFlux"));
        assert!(payload.contains("<Previous Model>"));
    }

    #[tokio::test]
    async fn valid_outcome_is_a_precondition_failure() {
        let responder = ScriptedResponder::new().with(StepName::Generate, [generation_reply(2)]);
        let state = validated_state(ValidationOutcome::Valid, "");

        let err = GeneratorAgent::new(10_000)
            .run(&responder, "run-1", &state, TIMEOUT)
            .await
            .unwrap_err();

        assert!(matches!(err, WorkflowError::Precondition { step: StepName::Generate, .. }));
        assert_eq!(responder.calls(StepName::Generate), 0);
    }

    #[tokio::test]
    async fn missing_plan_is_a_precondition_failure() {
        let responder = ScriptedResponder::new();
        let err = GeneratorAgent::new(10_000)
            .build_request("run-1", &initialized_state("reqs", 2), TIMEOUT)
            .unwrap_err();

        assert!(err.to_string().contains("plan_result is missing"));
        assert_eq!(responder.calls(StepName::Generate), 0);
    }

    #[test]
    fn request_targets_generation_schema() {
        let request = GeneratorAgent::new(10_000)
            .build_request("run-1", &planned_state(), TIMEOUT)
            .expect("request");
        assert_eq!(request.schema.name(), "generation_result");
        assert_eq!(request.step, StepName::Generate);
        assert_eq!(request.timeout, TIMEOUT);
    }
}
