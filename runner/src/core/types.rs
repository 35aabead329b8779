//! Shared deterministic types for the workflow core.
//!
//! These records are what the model-backed steps produce and what a run hands
//! back to its caller. They carry no behavior beyond small accessors and must
//! serialize stably, because checkpoints and step logs persist them verbatim.

use serde::{Deserialize, Serialize};

/// Planning output, written once per run by the plan step.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PlanResult {
    /// Condensed view of the requirements, including noted dependencies.
    pub summary: String,
    /// Numbered instructions handed to the generation step.
    pub plan_body: String,
    /// How reviewer feedback was folded into the plan (often empty).
    pub feedback_notes: String,
}

/// Generation output. Each generate invocation replaces the previous one.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct GenerationResult {
    /// The generated model text.
    pub artifact: String,
    /// Generator remarks, e.g. how feedback was applied.
    pub comments: String,
}

/// Validator verdict. Any other literal is a schema-conformance failure.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ValidationOutcome {
    Valid,
    Invalid,
}

impl ValidationOutcome {
    pub fn as_str(self) -> &'static str {
        match self {
            ValidationOutcome::Valid => "valid",
            ValidationOutcome::Invalid => "invalid",
        }
    }
}

/// Validation output, read by the router.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ValidationResult {
    pub outcome: ValidationOutcome,
    pub comments: String,
    /// Issues for the generator to address; empty when the model is valid.
    pub feedback: String,
}

/// How a run reached the terminal node.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum RunOutcome {
    /// The validator accepted the artifact.
    Valid,
    /// The retry budget ran out while the artifact was still invalid.
    Exhausted,
}

impl RunOutcome {
    pub fn as_str(self) -> &'static str {
        match self {
            RunOutcome::Valid => "valid",
            RunOutcome::Exhausted => "exhausted",
        }
    }
}

/// Result handed to the caller once a run terminates.
///
/// Exhaustion is reported through `outcome`, never as an error.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RunResult {
    /// Artifact from the last generation (empty if none was produced).
    pub final_artifact: String,
    pub outcome: RunOutcome,
    /// Number of feedback iterations taken (the final `retry_count`).
    pub iterations_used: u32,
    /// Feedback from the last validation; empty when none was given.
    pub last_feedback: String,
}
