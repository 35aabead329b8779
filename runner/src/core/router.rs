//! Conditional router evaluated after the validate step.
//!
//! Pure decision over state. The only state change it may request is bumping
//! `retry_count` when it loops back to generation.

use crate::core::graph::StepName;
use crate::core::state::{StateUpdate, WorkflowState};
use crate::core::types::{RunOutcome, ValidationOutcome};
use crate::error::WorkflowError;

/// Where the router sends the run.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Route {
    /// Stop at the terminal node with the given outcome.
    Finish(RunOutcome),
    /// Loop back to generation for another attempt.
    Retry,
}

impl Route {
    pub fn as_str(&self) -> &'static str {
        match self {
            Route::Finish(outcome) => outcome.as_str(),
            Route::Retry => "retry",
        }
    }
}

/// Router decision plus the update to merge before following it.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RouteDecision {
    pub route: Route,
    pub update: StateUpdate,
}

impl RouteDecision {
    /// Next step to execute, or `None` for the terminal node.
    pub fn next_step(&self) -> Option<StepName> {
        match self.route {
            Route::Finish(_) => None,
            Route::Retry => Some(StepName::Generate),
        }
    }
}

/// Decide what follows validation.
///
/// - `valid` finishes with [`RunOutcome::Valid`] and changes nothing.
/// - `invalid` with budget left increments `retry_count` and retries.
/// - `invalid` with no budget left finishes with [`RunOutcome::Exhausted`].
pub fn route(state: &WorkflowState) -> Result<RouteDecision, WorkflowError> {
    let validation = state
        .validation_result
        .as_ref()
        .ok_or_else(|| WorkflowError::Precondition {
            step: StepName::Validate,
            detail: "router reached without a validation result".to_string(),
        })?;

    let decision = match validation.outcome {
        ValidationOutcome::Valid => RouteDecision {
            route: Route::Finish(RunOutcome::Valid),
            update: StateUpdate::default(),
        },
        ValidationOutcome::Invalid if state.retry_count < state.retry_limit => RouteDecision {
            route: Route::Retry,
            update: StateUpdate {
                retry_count: Some(state.retry_count + 1),
                ..StateUpdate::default()
            },
        },
        ValidationOutcome::Invalid => RouteDecision {
            route: Route::Finish(RunOutcome::Exhausted),
            update: StateUpdate::default(),
        },
    };
    Ok(decision)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::types::ValidationResult;

    fn state_with(outcome: ValidationOutcome, retry_count: u32, retry_limit: u32) -> WorkflowState {
        WorkflowState {
            requirements: Some("reqs".to_string()),
            retry_limit,
            retry_count,
            validation_result: Some(ValidationResult {
                outcome,
                comments: String::new(),
                feedback: "fix it".to_string(),
            }),
            ..WorkflowState::default()
        }
    }

    #[test]
    fn valid_outcome_finishes_without_update() {
        let decision = route(&state_with(ValidationOutcome::Valid, 0, 2)).expect("route");
        assert_eq!(decision.route, Route::Finish(RunOutcome::Valid));
        assert!(decision.update.is_empty());
        assert_eq!(decision.next_step(), None);
    }

    #[test]
    fn invalid_with_budget_retries_and_bumps_count() {
        let decision = route(&state_with(ValidationOutcome::Invalid, 1, 2)).expect("route");
        assert_eq!(decision.route, Route::Retry);
        assert_eq!(decision.update.retry_count, Some(2));
        assert_eq!(decision.update.fields(), vec!["retry_count"]);
        assert_eq!(decision.next_step(), Some(StepName::Generate));
    }

    #[test]
    fn invalid_without_budget_finishes_exhausted() {
        let decision = route(&state_with(ValidationOutcome::Invalid, 2, 2)).expect("route");
        assert_eq!(decision.route, Route::Finish(RunOutcome::Exhausted));
        assert!(decision.update.is_empty());
    }

    #[test]
    fn zero_budget_exhausts_on_first_invalid() {
        let decision = route(&state_with(ValidationOutcome::Invalid, 0, 0)).expect("route");
        assert_eq!(decision.route, Route::Finish(RunOutcome::Exhausted));
    }

    #[test]
    fn missing_validation_is_a_precondition_error() {
        let state = WorkflowState {
            requirements: Some("reqs".to_string()),
            ..WorkflowState::default()
        };
        let err = route(&state).unwrap_err();
        assert!(matches!(err, WorkflowError::Precondition { .. }));
    }

    /// Routing never produces a `retry_count` above the limit, for any limit.
    #[test]
    fn retry_count_never_exceeds_limit() {
        for limit in 0..6 {
            for count in 0..=limit {
                let decision =
                    route(&state_with(ValidationOutcome::Invalid, count, limit)).expect("route");
                if let Some(next) = decision.update.retry_count {
                    assert!(next <= limit, "count {next} > limit {limit}");
                    assert_eq!(next, count + 1);
                }
            }
        }
    }
}
