//! Semantic invariants over workflow state and step updates.

use crate::core::graph::StepName;
use crate::core::state::{StateUpdate, WorkflowState};

/// Who produced an update.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum UpdateSource {
    Step(StepName),
    Router,
}

/// Check invariants that must hold after every merge:
/// - `retry_count <= retry_limit`
/// - validation implies generation, generation implies a plan,
///   a plan implies requirements
pub fn validate_state_invariants(state: &WorkflowState) -> Vec<String> {
    let mut errors = Vec::new();

    if state.retry_count > state.retry_limit {
        errors.push(format!(
            "retry_count {} exceeds retry_limit {}",
            state.retry_count, state.retry_limit
        ));
    }
    if state.validation_result.is_some() && state.generation_result.is_none() {
        errors.push("validation_result present without generation_result".to_string());
    }
    if state.generation_result.is_some() && state.plan_result.is_none() {
        errors.push("generation_result present without plan_result".to_string());
    }
    if state.plan_result.is_some() && state.requirements.is_none() {
        errors.push("plan_result present without requirements".to_string());
    }

    errors
}

/// Check that `update` only touches what `source` owns, given the state it
/// will be merged into.
pub fn validate_update(
    source: UpdateSource,
    prev: &WorkflowState,
    update: &StateUpdate,
) -> Vec<String> {
    let mut errors = Vec::new();
    let owned = owned_fields(source);
    for field in update.fields() {
        if !owned.contains(&field) {
            errors.push(format!("{} may not write '{}'", describe(source), field));
        }
    }

    match source {
        UpdateSource::Step(StepName::Init) => {
            if prev.requirements.is_some() && update.requirements.is_some() {
                errors.push("requirements are already set".to_string());
            }
            if update.retry_count.is_some_and(|count| count != 0) {
                errors.push("init must start retry_count at 0".to_string());
            }
        }
        UpdateSource::Step(StepName::Plan) => {
            if prev.plan_result.is_some() && update.plan_result.is_some() {
                errors.push("plan_result is written once per run".to_string());
            }
        }
        UpdateSource::Step(StepName::Validate) => {
            if prev.generation_result.is_none() && update.validation_result.is_some() {
                errors.push("validation_result written before any generation_result".to_string());
            }
        }
        UpdateSource::Step(StepName::Generate) => {}
        UpdateSource::Router => {
            if let Some(count) = update.retry_count
                && count != prev.retry_count + 1
            {
                errors.push(format!(
                    "router must increment retry_count by one ({} -> {})",
                    prev.retry_count, count
                ));
            }
        }
    }

    errors
}

fn owned_fields(source: UpdateSource) -> &'static [&'static str] {
    match source {
        UpdateSource::Step(StepName::Init) => &["requirements", "retry_limit", "retry_count"],
        UpdateSource::Step(StepName::Plan) => &["plan_result"],
        UpdateSource::Step(StepName::Generate) => &["generation_result"],
        UpdateSource::Step(StepName::Validate) => &["validation_result"],
        UpdateSource::Router => &["retry_count"],
    }
}

fn describe(source: UpdateSource) -> String {
    match source {
        UpdateSource::Step(step) => format!("{step} step"),
        UpdateSource::Router => "router".to_string(),
    }
}
