//! Engine-level scenarios for the plan/generate/validate loop.
//!
//! These tests drive `WorkflowEngine` with scripted responders and an
//! in-memory checkpoint store to pin down routing, retry accounting and
//! failure behavior across whole runs.

use mbse_runner::core::graph::StepName;
use mbse_runner::core::state::RunConfig;
use mbse_runner::core::types::ValidationOutcome::{self, Invalid, Valid};
use mbse_runner::core::types::{RunOutcome, RunResult};
use mbse_runner::engine::{EngineConfig, StepRecord, WorkflowEngine};
use mbse_runner::error::{RunFailure, WorkflowError};
use mbse_runner::io::checkpoint::{CheckpointStore, MemoryCheckpointStore};
use mbse_runner::test_support::{
    ScriptedReply, ScriptedResponder, feedback_text, generation_reply, model_text, scripted_run,
};
use serde_json::json;
use tokio_util::sync::CancellationToken;

const REQUIREMENTS: &str = "The bulb shall emit 800 lm at 230 V.";

fn engine(responder: ScriptedResponder) -> WorkflowEngine<ScriptedResponder, MemoryCheckpointStore> {
    WorkflowEngine::new(responder, MemoryCheckpointStore::new(), EngineConfig::default())
}

async fn run_with_limit(
    engine: &WorkflowEngine<ScriptedResponder, MemoryCheckpointStore>,
    retry_limit: u32,
    records: &mut Vec<StepRecord>,
) -> Result<RunResult, RunFailure> {
    engine
        .start(
            "scenario",
            &RunConfig::new(REQUIREMENTS).with_retry_limit(retry_limit),
            &CancellationToken::new(),
            |record| records.push(record.clone()),
        )
        .await
}

fn steps(records: &[StepRecord]) -> Vec<StepName> {
    records.iter().map(|record| record.step).collect()
}

/// Two invalid verdicts then a valid one with a retry limit of 2.
///
/// Execution sequence:
/// 1. init, plan
/// 2. generate, validate (invalid) -> retry (retry_count=1)
/// 3. generate, validate (invalid) -> retry (retry_count=2)
/// 4. generate, validate (valid) -> finish
#[tokio::test]
async fn invalid_twice_then_valid_finishes_within_budget() {
    let engine = engine(scripted_run(&[Invalid, Invalid, Valid]));
    let mut records = Vec::new();

    let result = run_with_limit(&engine, 2, &mut records).await.expect("run");

    assert_eq!(result.outcome, RunOutcome::Valid);
    assert_eq!(result.iterations_used, 2);
    assert_eq!(result.final_artifact, model_text(3));
    assert_eq!(result.last_feedback, "");
    assert_eq!(engine.responder().calls(StepName::Plan), 1);
    assert_eq!(engine.responder().calls(StepName::Generate), 3);
    assert_eq!(engine.responder().calls(StepName::Validate), 3);
    assert_eq!(
        steps(&records),
        vec![
            StepName::Init,
            StepName::Plan,
            StepName::Generate,
            StepName::Validate,
            StepName::Generate,
            StepName::Validate,
            StepName::Generate,
            StepName::Validate,
        ]
    );
}

/// With no retries allowed, a single invalid verdict ends the run as exhausted.
#[tokio::test]
async fn zero_retry_limit_exhausts_after_one_attempt() {
    let engine = engine(scripted_run(&[Invalid]));
    let mut records = Vec::new();

    let result = run_with_limit(&engine, 0, &mut records).await.expect("run");

    assert_eq!(result.outcome, RunOutcome::Exhausted);
    assert_eq!(result.iterations_used, 0);
    assert_eq!(result.final_artifact, model_text(1));
    assert_eq!(result.last_feedback, feedback_text(1));
    assert_eq!(engine.responder().calls(StepName::Generate), 1);
    assert_eq!(engine.responder().calls(StepName::Validate), 1);
}

/// A planning failure stops the run before any generation or validation.
#[tokio::test]
async fn plan_failure_stops_before_generation() {
    let engine = engine(
        ScriptedResponder::new()
            .with(StepName::Plan, [ScriptedReply::Fail("model unavailable".to_string())]),
    );
    let mut records = Vec::new();

    let failure = run_with_limit(&engine, 2, &mut records).await.unwrap_err();

    assert!(matches!(
        failure.error,
        WorkflowError::Capability { step: StepName::Plan, .. }
    ));
    assert!(failure.state.plan_result.is_none());
    assert_eq!(steps(&records), vec![StepName::Init]);
    assert_eq!(engine.responder().calls(StepName::Generate), 0);
    assert_eq!(engine.responder().calls(StepName::Validate), 0);

    let checkpoint = engine
        .store()
        .load("scenario")
        .expect("load")
        .expect("checkpoint");
    assert_eq!(checkpoint.next, Some(StepName::Plan));
}

/// An outcome outside `{valid, invalid}` fails the run; it is never retried.
#[tokio::test]
async fn unknown_verdict_fails_without_retry() {
    let responder = scripted_run(&[]);
    responder.push(StepName::Generate, generation_reply(1));
    responder.push(
        StepName::Validate,
        ScriptedReply::Json(json!({ "outcome": "maybe", "comments": "", "feedback": "" })),
    );
    let engine = engine(responder);
    let mut records = Vec::new();

    let failure = run_with_limit(&engine, 2, &mut records).await.unwrap_err();

    match &failure.error {
        WorkflowError::SchemaConformance { step, field, .. } => {
            assert_eq!(*step, StepName::Validate);
            assert_eq!(field, "outcome");
        }
        other => panic!("unexpected error: {other}"),
    }
    assert_eq!(engine.responder().calls(StepName::Generate), 1);
    assert_eq!(failure.state.retry_count, 0);
    assert!(failure.state.validation_result.is_none());
}

/// Generation never runs more than `retry_limit + 1` times.
#[tokio::test]
async fn generation_count_is_bounded_by_retry_limit() {
    for limit in 0..=5u32 {
        let outcomes: Vec<ValidationOutcome> = vec![Invalid; limit as usize + 3];
        let engine = engine(scripted_run(&outcomes));
        let mut records = Vec::new();

        let result = run_with_limit(&engine, limit, &mut records).await.expect("run");

        assert_eq!(result.outcome, RunOutcome::Exhausted, "limit {limit}");
        assert_eq!(result.iterations_used, limit);
        assert_eq!(
            engine.responder().calls(StepName::Generate),
            limit as usize + 1,
            "limit {limit}"
        );
    }
}

/// `retry_count` never decreases across steps and only moves on a retry route.
#[tokio::test]
async fn retry_count_is_monotonic() {
    let engine = engine(scripted_run(&[Invalid, Invalid, Invalid, Valid]));
    let mut records = Vec::new();

    run_with_limit(&engine, 3, &mut records).await.expect("run");

    let counts: Vec<u32> = records.iter().map(|record| record.retry_count).collect();
    assert!(counts.windows(2).all(|pair| pair[0] <= pair[1]), "{counts:?}");
    assert_eq!(counts.last(), Some(&3));
}

/// Each regeneration payload carries the previous artifact and its feedback.
#[tokio::test]
async fn regeneration_payloads_carry_prior_attempt() {
    let engine = engine(scripted_run(&[Invalid, Invalid, Valid]));
    let mut records = Vec::new();

    run_with_limit(&engine, 2, &mut records).await.expect("run");

    let payloads = engine.responder().payloads(StepName::Generate);
    assert_eq!(payloads.len(), 3);
    assert!(!payloads[0].contains("<Feedback>"));
    for attempt in 1..=2 {
        let payload = &payloads[attempt];
        assert!(payload.contains(&model_text(attempt)), "attempt {attempt}");
        assert!(payload.contains(&feedback_text(attempt)), "attempt {attempt}");
    }
}
