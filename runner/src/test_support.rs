//! Test-only helpers: a scripted responder, canned step outputs and temp projects.

use std::collections::{HashMap, VecDeque};
use std::fs;
use std::path::{Path, PathBuf};
use std::sync::Mutex;

use anyhow::{Context, Result};
use async_trait::async_trait;
use serde_json::{Value, json};
use tempfile::TempDir;

use crate::core::graph::StepName;
use crate::core::state::{RunConfig, StateUpdate, WorkflowState, initialize};
use crate::core::types::{GenerationResult, PlanResult, ValidationOutcome, ValidationResult};
use crate::error::CapabilityError;
use crate::io::init::{InitOptions, RunnerPaths, init_runner};
use crate::io::responder::{ResponseRequest, StructuredResponder};

/// One scripted answer for a capability call.
#[derive(Debug, Clone)]
pub enum ScriptedReply {
    /// Serialize the value as the response body.
    Json(Value),
    /// Return the text verbatim (for malformed-response tests).
    Raw(String),
    /// Fail with a backend error.
    Fail(String),
    /// Never answer; the call only ends by timeout or cancellation.
    Hang,
}

/// A capability call as the scripted responder saw it.
#[derive(Debug, Clone)]
pub struct RecordedRequest {
    pub run_id: String,
    pub step: StepName,
    pub system_instruction: String,
    pub user_payload: String,
    pub schema: &'static str,
}

/// Responder that replays queued replies per step and records every request.
///
/// A call for a step with an empty queue fails with a backend error, so tests
/// notice unexpected extra invocations.
#[derive(Debug, Default)]
pub struct ScriptedResponder {
    replies: Mutex<HashMap<StepName, VecDeque<ScriptedReply>>>,
    requests: Mutex<Vec<RecordedRequest>>,
}

impl ScriptedResponder {
    pub fn new() -> Self {
        Self::default()
    }

    /// Builder form of [`ScriptedResponder::push`].
    pub fn with(self, step: StepName, replies: impl IntoIterator<Item = ScriptedReply>) -> Self {
        for reply in replies {
            self.push(step, reply);
        }
        self
    }

    pub fn push(&self, step: StepName, reply: ScriptedReply) {
        self.replies
            .lock()
            .expect("replies lock")
            .entry(step)
            .or_default()
            .push_back(reply);
    }

    pub fn requests(&self) -> Vec<RecordedRequest> {
        self.requests.lock().expect("requests lock").clone()
    }

    /// Number of calls made for `step`.
    pub fn calls(&self, step: StepName) -> usize {
        self.requests
            .lock()
            .expect("requests lock")
            .iter()
            .filter(|r| r.step == step)
            .count()
    }

    /// Payloads sent for `step`, in call order.
    pub fn payloads(&self, step: StepName) -> Vec<String> {
        self.requests
            .lock()
            .expect("requests lock")
            .iter()
            .filter(|r| r.step == step)
            .map(|r| r.user_payload.clone())
            .collect()
    }

    /// Replies still queued for `step`.
    pub fn remaining(&self, step: StepName) -> usize {
        self.replies
            .lock()
            .expect("replies lock")
            .get(&step)
            .map_or(0, VecDeque::len)
    }
}

#[async_trait]
impl StructuredResponder for ScriptedResponder {
    async fn respond(&self, request: &ResponseRequest) -> Result<String, CapabilityError> {
        self.requests
            .lock()
            .expect("requests lock")
            .push(RecordedRequest {
                run_id: request.run_id.clone(),
                step: request.step,
                system_instruction: request.system_instruction.clone(),
                user_payload: request.user_payload.clone(),
                schema: request.schema.name(),
            });
        let reply = self
            .replies
            .lock()
            .expect("replies lock")
            .get_mut(&request.step)
            .and_then(VecDeque::pop_front);

        match reply {
            Some(ScriptedReply::Json(value)) => Ok(value.to_string()),
            Some(ScriptedReply::Raw(text)) => Ok(text),
            Some(ScriptedReply::Fail(msg)) => Err(CapabilityError::Backend(msg)),
            Some(ScriptedReply::Hang) => {
                std::future::pending::<Result<String, CapabilityError>>().await
            }
            None => Err(CapabilityError::Backend(format!(
                "no scripted reply for {} step",
                request.step
            ))),
        }
    }
}

pub fn plan_reply() -> ScriptedReply {
    ScriptedReply::Json(json!({
        "summary": "Bulb with power, light output and socket.",
        "plan_body": "1. Declare package Bulb.\n2. Define part def Bulb with attributes.",
        "feedback_notes": "",
    }))
}

/// Generation reply whose artifact is `model v{attempt}`.
pub fn generation_reply(attempt: usize) -> ScriptedReply {
    ScriptedReply::Json(json!({
        "artifact": model_text(attempt),
        "comments": format!("attempt {attempt}"),
    }))
}

pub fn model_text(attempt: usize) -> String {
    format!("package Bulb {{ part def Bulb; }} // model v{attempt}")
}

/// Validation reply; invalid replies carry `fix {attempt}` as feedback.
pub fn validation_reply(outcome: ValidationOutcome, attempt: usize) -> ScriptedReply {
    let feedback = match outcome {
        ValidationOutcome::Valid => String::new(),
        ValidationOutcome::Invalid => feedback_text(attempt),
    };
    ScriptedReply::Json(json!({
        "outcome": outcome.as_str(),
        "comments": format!("checked attempt {attempt}"),
        "feedback": feedback,
    }))
}

pub fn feedback_text(attempt: usize) -> String {
    format!("fix {attempt}: add attribute luminousFlux")
}

/// Responder scripted for a full run: one plan, then one generation and one
/// validation per entry in `outcomes`.
pub fn scripted_run(outcomes: &[ValidationOutcome]) -> ScriptedResponder {
    let responder = ScriptedResponder::new().with(StepName::Plan, [plan_reply()]);
    for (i, outcome) in outcomes.iter().enumerate() {
        let attempt = i + 1;
        responder.push(StepName::Generate, generation_reply(attempt));
        responder.push(StepName::Validate, validation_reply(*outcome, attempt));
    }
    responder
}

/// State right after the init step.
pub fn initialized_state(requirements: &str, retry_limit: u32) -> WorkflowState {
    WorkflowState::default().merged(initialize(
        &RunConfig::new(requirements).with_retry_limit(retry_limit),
    ))
}

pub fn plan_result() -> PlanResult {
    PlanResult {
        summary: "summary".to_string(),
        plan_body: "1. Define part Bulb.".to_string(),
        feedback_notes: String::new(),
    }
}

pub fn generation_result(artifact: &str) -> GenerationResult {
    GenerationResult {
        artifact: artifact.to_string(),
        comments: String::new(),
    }
}

pub fn validation_result(outcome: ValidationOutcome, feedback: &str) -> ValidationResult {
    ValidationResult {
        outcome,
        comments: String::new(),
        feedback: feedback.to_string(),
    }
}

/// State after plan, one generation and one validation.
pub fn validated_state(outcome: ValidationOutcome, feedback: &str) -> WorkflowState {
    initialized_state("The bulb shall emit 800 lm.", 2).merged(StateUpdate {
        plan_result: Some(plan_result()),
        generation_result: Some(generation_result(&model_text(1))),
        validation_result: Some(validation_result(outcome, feedback)),
        ..StateUpdate::default()
    })
}

/// A temporary project directory with `.runner/` initialized.
pub struct TestProject {
    temp: TempDir,
}

impl TestProject {
    pub fn new() -> Result<Self> {
        let temp = tempfile::tempdir().context("create tempdir")?;
        init_runner(temp.path(), &InitOptions { force: false })?;
        Ok(Self { temp })
    }

    pub fn root(&self) -> &Path {
        self.temp.path()
    }

    pub fn paths(&self) -> RunnerPaths {
        RunnerPaths::new(self.root())
    }

    /// Write a requirements file at the project root and return its path.
    pub fn write_requirements(&self, contents: &str) -> Result<PathBuf> {
        let path = self.root().join("requirements.md");
        fs::write(&path, contents).with_context(|| format!("write {}", path.display()))?;
        Ok(path)
    }
}
