//! Workflow state threaded through every step, and the partial updates steps
//! return.
//!
//! Steps never mutate [`WorkflowState`] directly. They return a [`StateUpdate`]
//! naming only the fields they changed, and the engine merges it: set fields
//! overwrite, unset fields persist. Because an unset field means "unchanged",
//! no update can null out a field written by an earlier step.

use serde::{Deserialize, Serialize};

use crate::core::types::{
    GenerationResult, PlanResult, RunOutcome, RunResult, ValidationOutcome, ValidationResult,
};

/// Default number of feedback iterations when neither config nor caller sets one.
pub const DEFAULT_RETRY_LIMIT: u32 = 2;

/// Accumulated state of a single run.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct WorkflowState {
    /// Problem statement. Set by the init step, never rewritten.
    pub requirements: Option<String>,
    /// Upper bound on feedback iterations.
    pub retry_limit: u32,
    /// Feedback iterations taken so far. Only the router bumps it.
    pub retry_count: u32,
    pub plan_result: Option<PlanResult>,
    pub generation_result: Option<GenerationResult>,
    pub validation_result: Option<ValidationResult>,
}

/// Partial update returned by a step.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct StateUpdate {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub requirements: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub retry_limit: Option<u32>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub retry_count: Option<u32>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub plan_result: Option<PlanResult>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub generation_result: Option<GenerationResult>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub validation_result: Option<ValidationResult>,
}

impl StateUpdate {
    pub fn is_empty(&self) -> bool {
        self.fields().is_empty()
    }

    /// Names of the fields this update sets, in declaration order.
    pub fn fields(&self) -> Vec<&'static str> {
        let mut fields = Vec::new();
        if self.requirements.is_some() {
            fields.push("requirements");
        }
        if self.retry_limit.is_some() {
            fields.push("retry_limit");
        }
        if self.retry_count.is_some() {
            fields.push("retry_count");
        }
        if self.plan_result.is_some() {
            fields.push("plan_result");
        }
        if self.generation_result.is_some() {
            fields.push("generation_result");
        }
        if self.validation_result.is_some() {
            fields.push("validation_result");
        }
        fields
    }

    /// Compose two updates into one; fields set in `later` win.
    ///
    /// Applying `a.then(b)` equals applying `a` and then `b`.
    pub fn then(self, later: StateUpdate) -> StateUpdate {
        StateUpdate {
            requirements: later.requirements.or(self.requirements),
            retry_limit: later.retry_limit.or(self.retry_limit),
            retry_count: later.retry_count.or(self.retry_count),
            plan_result: later.plan_result.or(self.plan_result),
            generation_result: later.generation_result.or(self.generation_result),
            validation_result: later.validation_result.or(self.validation_result),
        }
    }
}

impl WorkflowState {
    /// Merge `update` into the state: set fields overwrite, the rest persist.
    pub fn merge(&mut self, update: StateUpdate) {
        if let Some(requirements) = update.requirements {
            self.requirements = Some(requirements);
        }
        if let Some(retry_limit) = update.retry_limit {
            self.retry_limit = retry_limit;
        }
        if let Some(retry_count) = update.retry_count {
            self.retry_count = retry_count;
        }
        if let Some(plan) = update.plan_result {
            self.plan_result = Some(plan);
        }
        if let Some(generation) = update.generation_result {
            self.generation_result = Some(generation);
        }
        if let Some(validation) = update.validation_result {
            self.validation_result = Some(validation);
        }
    }

    /// By-value variant of [`WorkflowState::merge`].
    pub fn merged(mut self, update: StateUpdate) -> Self {
        self.merge(update);
        self
    }

    pub fn last_outcome(&self) -> Option<ValidationOutcome> {
        self.validation_result.as_ref().map(|v| v.outcome)
    }

    /// Project the terminal view of this state.
    pub fn to_run_result(&self, outcome: RunOutcome) -> RunResult {
        RunResult {
            final_artifact: self
                .generation_result
                .as_ref()
                .map(|g| g.artifact.clone())
                .unwrap_or_default(),
            outcome,
            iterations_used: self.retry_count,
            last_feedback: self
                .validation_result
                .as_ref()
                .map(|v| v.feedback.clone())
                .unwrap_or_default(),
        }
    }
}

/// Inputs consumed by the init step.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RunConfig {
    pub requirements: String,
    /// Falls back to [`DEFAULT_RETRY_LIMIT`] when unset.
    pub retry_limit: Option<u32>,
}

impl RunConfig {
    pub fn new(requirements: impl Into<String>) -> Self {
        Self {
            requirements: requirements.into(),
            retry_limit: None,
        }
    }

    pub fn with_retry_limit(mut self, retry_limit: u32) -> Self {
        self.retry_limit = Some(retry_limit);
        self
    }
}

/// The init step: deterministic assignment, no failure modes.
pub fn initialize(config: &RunConfig) -> StateUpdate {
    StateUpdate {
        requirements: Some(config.requirements.clone()),
        retry_limit: Some(config.retry_limit.unwrap_or(DEFAULT_RETRY_LIMIT)),
        retry_count: Some(0),
        ..StateUpdate::default()
    }
}
