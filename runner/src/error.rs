//! Error taxonomy for workflow runs.
//!
//! Every variant is fatal to the current run and names the step it came from.
//! Retry-budget exhaustion is deliberately absent: it is a normal
//! [`RunOutcome`](crate::core::types::RunOutcome), not an error.

use std::time::Duration;

use thiserror::Error;

use crate::core::graph::StepName;
use crate::core::state::WorkflowState;

/// Failure reported by a structured-response backend.
#[derive(Debug, Error)]
pub enum CapabilityError {
    /// The backend did not answer within the allotted time.
    #[error("no response within {0:?}")]
    Timeout(Duration),
    /// Transport, process, or provider failure.
    #[error("{0}")]
    Backend(String),
}

impl CapabilityError {
    pub fn backend(err: anyhow::Error) -> Self {
        CapabilityError::Backend(format!("{err:#}"))
    }
}

/// Why a run stopped without reaching the terminal node.
#[derive(Debug, Error)]
pub enum WorkflowError {
    /// The capability produced no result at all.
    #[error("{step} step: capability failed: {source}")]
    Capability {
        step: StepName,
        #[source]
        source: CapabilityError,
    },
    /// The capability answered, but not in the shape the schema demands.
    #[error("{step} step: response does not conform to schema '{schema}' at '{field}': {detail}")]
    SchemaConformance {
        step: StepName,
        schema: String,
        field: String,
        detail: String,
    },
    /// A step was entered with state it cannot work from.
    #[error("{step} step: precondition failed: {detail}")]
    Precondition { step: StepName, detail: String },
    /// A merge would break a state invariant.
    #[error("{step} step: state invariants violated: {}", violations.join("; "))]
    InvariantViolation {
        step: StepName,
        violations: Vec<String>,
    },
    /// The payload template failed to render.
    #[error("{step} step: prompt rendering failed: {detail}")]
    Prompt { step: StepName, detail: String },
    /// The run's wall-clock budget ran out before the step could start.
    #[error("{step} step: run time budget exhausted")]
    RunTimeout { step: StepName },
    /// The caller cancelled the run.
    #[error("run cancelled during {step} step")]
    Cancelled { step: StepName },
    /// Saving or loading a checkpoint failed.
    #[error("checkpoint store: {0:#}")]
    Checkpoint(anyhow::Error),
}

impl WorkflowError {
    /// Step the error is attributed to, when it has one.
    pub fn step(&self) -> Option<StepName> {
        match self {
            WorkflowError::Capability { step, .. }
            | WorkflowError::SchemaConformance { step, .. }
            | WorkflowError::Precondition { step, .. }
            | WorkflowError::InvariantViolation { step, .. }
            | WorkflowError::Prompt { step, .. }
            | WorkflowError::RunTimeout { step }
            | WorkflowError::Cancelled { step } => Some(*step),
            WorkflowError::Checkpoint(_) => None,
        }
    }

    pub fn is_cancelled(&self) -> bool {
        matches!(self, WorkflowError::Cancelled { .. })
    }
}

/// A failed run: the error plus the last state that merged cleanly.
///
/// The same state is in the checkpoint store, so the run can be resumed.
#[derive(Debug, Error)]
#[error("run {run_id} failed: {error}")]
pub struct RunFailure {
    pub run_id: String,
    /// State as of the last completed step.
    pub state: WorkflowState,
    #[source]
    pub error: WorkflowError,
}
