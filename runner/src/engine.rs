//! Workflow engine: interprets the static step graph for individual runs.
//!
//! Each run owns a fresh [`WorkflowState`]. The engine executes one step at a
//! time, checks the step's update against the state invariants, merges it,
//! follows the outgoing edge (evaluating the router after validation) and
//! saves a checkpoint before the next step starts. A failed or cancelled run
//! leaves the checkpoint as of its last completed step, so it can be resumed.

use std::time::{Duration, Instant};

use anyhow::anyhow;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, instrument, warn};

use crate::agents::StepOutput;
use crate::agents::generator::GeneratorAgent;
use crate::agents::planner::PlannerAgent;
use crate::agents::validator::ValidatorAgent;
use crate::core::budget::remaining_budget;
use crate::core::graph::{Edge, StepName, WORKFLOW, WorkflowGraph};
use crate::core::invariants::{UpdateSource, validate_state_invariants, validate_update};
use crate::core::router::{self, Route};
use crate::core::run_id::validate_run_id;
use crate::core::state::{RunConfig, StateUpdate, WorkflowState, initialize};
use crate::core::types::{RunOutcome, RunResult};
use crate::error::{RunFailure, WorkflowError};
use crate::io::checkpoint::{Checkpoint, CheckpointStore};
use crate::io::config::RunnerConfig;
use crate::io::responder::StructuredResponder;

/// Engine-wide settings shared by every run it executes.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct EngineConfig {
    /// Wall-clock budget for one `start` or `resume` call.
    pub run_timeout: Duration,
    pub prompt_budget_bytes: usize,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self::from(&RunnerConfig::default())
    }
}

impl From<&RunnerConfig> for EngineConfig {
    fn from(cfg: &RunnerConfig) -> Self {
        Self {
            run_timeout: cfg.run_timeout(),
            prompt_budget_bytes: cfg.prompt_budget_bytes,
        }
    }
}

/// One merged step, reported to the caller after its checkpoint is saved.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StepRecord {
    pub run_id: String,
    /// 1-based position of the step within the run.
    pub seq: u32,
    pub step: StepName,
    pub payload: Option<String>,
    /// Step update followed by the router's update, if the router ran.
    pub update: StateUpdate,
    pub route: Option<Route>,
    /// `retry_count` after the merge.
    pub retry_count: u32,
    pub duration: Duration,
}

pub struct WorkflowEngine<R, S> {
    responder: R,
    store: S,
    graph: &'static WorkflowGraph,
    planner: PlannerAgent,
    generator: GeneratorAgent,
    validator: ValidatorAgent,
    run_timeout: Duration,
}

impl<R: StructuredResponder, S: CheckpointStore> WorkflowEngine<R, S> {
    pub fn new(responder: R, store: S, config: EngineConfig) -> Self {
        Self {
            responder,
            store,
            graph: &WORKFLOW,
            planner: PlannerAgent::new(config.prompt_budget_bytes),
            generator: GeneratorAgent::new(config.prompt_budget_bytes),
            validator: ValidatorAgent::new(config.prompt_budget_bytes),
            run_timeout: config.run_timeout,
        }
    }

    pub fn responder(&self) -> &R {
        &self.responder
    }

    pub fn store(&self) -> &S {
        &self.store
    }

    /// Execute a new run from the graph's entry step to the terminal node.
    ///
    /// Fails without running anything if `run_id` already has a checkpoint.
    #[instrument(skip_all, fields(run_id = %run_id))]
    pub async fn start<F: FnMut(&StepRecord)>(
        &self,
        run_id: &str,
        config: &RunConfig,
        cancel: &CancellationToken,
        on_step: F,
    ) -> Result<RunResult, RunFailure> {
        let fail = |error| RunFailure {
            run_id: run_id.to_string(),
            state: WorkflowState::default(),
            error,
        };
        let entry = self.graph.entry();
        validate_run_id(run_id).map_err(|detail| {
            fail(WorkflowError::Precondition {
                step: entry,
                detail: format!("invalid run id: {detail}"),
            })
        })?;
        let existing = self
            .store
            .load(run_id)
            .map_err(|err| fail(WorkflowError::Checkpoint(err)))?;
        if existing.is_some() {
            return Err(fail(WorkflowError::Precondition {
                step: entry,
                detail: format!("run {run_id} already exists; resume it instead"),
            }));
        }

        info!(retry_limit = ?config.retry_limit, "run started");
        let checkpoint = Checkpoint {
            run_id: run_id.to_string(),
            next: Some(entry),
            steps_completed: 0,
            state: WorkflowState::default(),
            result: None,
        };
        self.drive(checkpoint, Some(config), cancel, on_step).await
    }

    /// Continue a run from its latest checkpoint.
    ///
    /// A finished run returns its recorded result without executing anything.
    #[instrument(skip_all, fields(run_id = %run_id))]
    pub async fn resume<F: FnMut(&StepRecord)>(
        &self,
        run_id: &str,
        cancel: &CancellationToken,
        on_step: F,
    ) -> Result<RunResult, RunFailure> {
        let fail = |state, error| RunFailure {
            run_id: run_id.to_string(),
            state,
            error,
        };
        validate_run_id(run_id).map_err(|detail| {
            fail(
                WorkflowState::default(),
                WorkflowError::Precondition {
                    step: self.graph.entry(),
                    detail: format!("invalid run id: {detail}"),
                },
            )
        })?;
        let checkpoint = self
            .store
            .load(run_id)
            .map_err(|err| fail(WorkflowState::default(), WorkflowError::Checkpoint(err)))?
            .ok_or_else(|| {
                fail(
                    WorkflowState::default(),
                    WorkflowError::Checkpoint(anyhow!("no checkpoint for run {run_id}")),
                )
            })?;

        let violations = validate_state_invariants(&checkpoint.state);
        if !violations.is_empty() {
            let step = checkpoint.next.unwrap_or(StepName::Validate);
            return Err(fail(
                checkpoint.state,
                WorkflowError::InvariantViolation { step, violations },
            ));
        }

        info!(next = ?checkpoint.next, steps_completed = checkpoint.steps_completed, "run resumed");
        self.drive(checkpoint, None, cancel, on_step).await
    }

    async fn drive<F: FnMut(&StepRecord)>(
        &self,
        mut checkpoint: Checkpoint,
        config: Option<&RunConfig>,
        cancel: &CancellationToken,
        mut on_step: F,
    ) -> Result<RunResult, RunFailure> {
        let deadline = Instant::now() + self.run_timeout;
        loop {
            let Some(step) = checkpoint.next else {
                return recorded_result(checkpoint);
            };
            match self
                .advance(&mut checkpoint, step, config, cancel, deadline)
                .await
            {
                Ok(record) => on_step(&record),
                Err(error) => {
                    warn!(%step, err = %error, "run stopped");
                    return Err(RunFailure {
                        run_id: checkpoint.run_id,
                        state: checkpoint.state,
                        error,
                    });
                }
            }
        }
    }

    /// Execute `step`, merge its update, follow its edge and persist the result.
    ///
    /// `checkpoint` is only replaced once the new snapshot has been saved.
    async fn advance(
        &self,
        checkpoint: &mut Checkpoint,
        step: StepName,
        config: Option<&RunConfig>,
        cancel: &CancellationToken,
        deadline: Instant,
    ) -> Result<StepRecord, WorkflowError> {
        if cancel.is_cancelled() {
            return Err(WorkflowError::Cancelled { step });
        }
        let timeout = remaining_budget(deadline).ok_or(WorkflowError::RunTimeout { step })?;
        let run_id = checkpoint.run_id.clone();
        let started = Instant::now();
        debug!(%step, retry_count = checkpoint.state.retry_count, "executing step");

        let output = tokio::select! {
            biased;
            _ = cancel.cancelled() => return Err(WorkflowError::Cancelled { step }),
            output = self.execute_step(step, &run_id, &checkpoint.state, config, timeout) => output?,
        };

        let mut state = checkpoint.state.clone();
        merge_checked(UpdateSource::Step(step), step, &mut state, output.update.clone())?;

        let (next, route, update) = match self.graph.edge(step) {
            Some(Edge::To(next)) => (Some(next), None, output.update),
            Some(Edge::Route) => {
                let decision = router::route(&state)?;
                merge_checked(UpdateSource::Router, step, &mut state, decision.update.clone())?;
                debug!(route = decision.route.as_str(), retry_count = state.retry_count, "routed");
                (
                    decision.next_step(),
                    Some(decision.route),
                    output.update.then(decision.update),
                )
            }
            None => {
                return Err(WorkflowError::Precondition {
                    step,
                    detail: "step has no outgoing edge".to_string(),
                });
            }
        };

        let result = match route {
            Some(Route::Finish(outcome)) => {
                let result = state.to_run_result(outcome);
                match outcome {
                    RunOutcome::Valid => info!(iterations_used = result.iterations_used, "run finished valid"),
                    RunOutcome::Exhausted => warn!(
                        iterations_used = result.iterations_used,
                        "retry budget exhausted; finishing with last artifact"
                    ),
                }
                Some(result)
            }
            Some(Route::Retry) | None => None,
        };

        let saved = Checkpoint {
            run_id: run_id.clone(),
            next,
            steps_completed: checkpoint.steps_completed + 1,
            state,
            result,
        };
        self.store.save(&saved).map_err(WorkflowError::Checkpoint)?;

        let record = StepRecord {
            run_id,
            seq: saved.steps_completed,
            step,
            payload: output.payload,
            update,
            route,
            retry_count: saved.state.retry_count,
            duration: started.elapsed(),
        };
        *checkpoint = saved;
        Ok(record)
    }

    /// The step table: one handler per [`StepName`].
    async fn execute_step(
        &self,
        step: StepName,
        run_id: &str,
        state: &WorkflowState,
        config: Option<&RunConfig>,
        timeout: Duration,
    ) -> Result<StepOutput, WorkflowError> {
        match step {
            StepName::Init => {
                let config = config.ok_or_else(|| WorkflowError::Precondition {
                    step,
                    detail: "run configuration is missing".to_string(),
                })?;
                Ok(StepOutput {
                    update: initialize(config),
                    payload: None,
                })
            }
            StepName::Plan => {
                self.planner
                    .run(&self.responder, run_id, state, timeout)
                    .await
            }
            StepName::Generate => {
                self.generator
                    .run(&self.responder, run_id, state, timeout)
                    .await
            }
            StepName::Validate => {
                self.validator
                    .run(&self.responder, run_id, state, timeout)
                    .await
            }
        }
    }
}

/// Merge `update` into `state` if `source` may write it and the result keeps
/// the state invariants. `state` is left untouched on rejection.
fn merge_checked(
    source: UpdateSource,
    step: StepName,
    state: &mut WorkflowState,
    update: StateUpdate,
) -> Result<(), WorkflowError> {
    let violations = validate_update(source, state, &update);
    if !violations.is_empty() {
        return Err(WorkflowError::InvariantViolation { step, violations });
    }
    let merged = state.clone().merged(update);
    let violations = validate_state_invariants(&merged);
    if !violations.is_empty() {
        return Err(WorkflowError::InvariantViolation { step, violations });
    }
    *state = merged;
    Ok(())
}

fn recorded_result(checkpoint: Checkpoint) -> Result<RunResult, RunFailure> {
    match checkpoint.result {
        Some(result) => Ok(result),
        None => Err(RunFailure {
            error: WorkflowError::Checkpoint(anyhow!(
                "run {} reached the end without a recorded result",
                checkpoint.run_id
            )),
            run_id: checkpoint.run_id,
            state: checkpoint.state,
        }),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::types::ValidationOutcome::{Invalid, Valid};
    use crate::error::CapabilityError;
    use crate::io::checkpoint::{FileCheckpointStore, MemoryCheckpointStore};
    use crate::test_support::{
        ScriptedReply, ScriptedResponder, generation_reply, initialized_state, model_text,
        plan_reply, scripted_run, validation_reply,
    };

    fn engine(responder: ScriptedResponder) -> WorkflowEngine<ScriptedResponder, MemoryCheckpointStore> {
        WorkflowEngine::new(responder, MemoryCheckpointStore::new(), EngineConfig::default())
    }

    fn config(retry_limit: u32) -> RunConfig {
        RunConfig::new("The bulb shall emit 800 lm.").with_retry_limit(retry_limit)
    }

    #[tokio::test]
    async fn valid_first_attempt_finishes_after_four_steps() {
        let engine = engine(scripted_run(&[Valid]));
        let mut steps = Vec::new();

        let result = engine
            .start("run-1", &config(2), &CancellationToken::new(), |r| steps.push(r.step))
            .await
            .expect("run");

        assert_eq!(result.outcome, RunOutcome::Valid);
        assert_eq!(result.final_artifact, model_text(1));
        assert_eq!(result.iterations_used, 0);
        assert_eq!(
            steps,
            vec![StepName::Init, StepName::Plan, StepName::Generate, StepName::Validate]
        );

        let checkpoint = engine.store().load("run-1").expect("load").expect("present");
        assert!(checkpoint.is_finished());
        assert_eq!(checkpoint.steps_completed, 4);
        assert_eq!(checkpoint.result, Some(result));
    }

    /// Every record is emitted after its checkpoint was saved, with a
    /// monotonically increasing sequence number.
    #[tokio::test]
    async fn records_follow_saved_checkpoints() {
        let engine = engine(scripted_run(&[Invalid, Valid]));
        let mut records = Vec::new();

        engine
            .start("run-1", &config(2), &CancellationToken::new(), |r| {
                records.push(r.clone());
            })
            .await
            .expect("run");

        let seqs: Vec<u32> = records.iter().map(|r| r.seq).collect();
        assert_eq!(seqs, vec![1, 2, 3, 4, 5, 6]);
        let validate = &records[3];
        assert_eq!(validate.step, StepName::Validate);
        assert_eq!(validate.route, Some(Route::Retry));
        assert_eq!(validate.retry_count, 1);
        assert_eq!(validate.update.retry_count, Some(1));
        assert!(records[0].payload.is_none(), "init invokes no capability");
        assert!(records[1].payload.is_some());
    }

    /// A capability failure keeps the last good state in both the failure and
    /// the checkpoint, and the run can then be resumed to completion.
    #[tokio::test]
    async fn failed_step_can_be_resumed() {
        let responder = ScriptedResponder::new()
            .with(StepName::Plan, [ScriptedReply::Fail("connection reset".to_string()), plan_reply()])
            .with(StepName::Generate, [generation_reply(1)])
            .with(StepName::Validate, [validation_reply(Valid, 1)]);
        let engine = engine(responder);
        let cancel = CancellationToken::new();

        let failure = engine
            .start("run-1", &config(2), &cancel, |_| {})
            .await
            .unwrap_err();
        assert!(matches!(failure.error, WorkflowError::Capability { step: StepName::Plan, .. }));
        assert!(failure.state.requirements.is_some());
        assert!(failure.state.plan_result.is_none());
        let checkpoint = engine.store().load("run-1").expect("load").expect("present");
        assert_eq!(checkpoint.next, Some(StepName::Plan));
        assert_eq!(checkpoint.state, failure.state);

        let result = engine.resume("run-1", &cancel, |_| {}).await.expect("resume");
        assert_eq!(result.outcome, RunOutcome::Valid);
        assert_eq!(engine.responder().calls(StepName::Plan), 2);
    }

    #[tokio::test]
    async fn resuming_a_finished_run_returns_recorded_result() {
        let engine = engine(scripted_run(&[Valid]));
        let cancel = CancellationToken::new();
        let first = engine.start("run-1", &config(2), &cancel, |_| {}).await.expect("run");
        let calls = engine.responder().requests().len();

        let again = engine.resume("run-1", &cancel, |_| {}).await.expect("resume");

        assert_eq!(again, first);
        assert_eq!(engine.responder().requests().len(), calls);
    }

    #[tokio::test]
    async fn starting_an_existing_run_is_rejected() {
        let engine = engine(scripted_run(&[Valid]));
        let cancel = CancellationToken::new();
        engine.start("run-1", &config(2), &cancel, |_| {}).await.expect("run");

        let failure = engine
            .start("run-1", &config(2), &cancel, |_| {})
            .await
            .unwrap_err();
        assert!(failure.error.to_string().contains("already exists"));
    }

    #[tokio::test]
    async fn invalid_run_id_is_rejected() {
        let engine = engine(ScriptedResponder::new());
        let failure = engine
            .start("../escape", &config(2), &CancellationToken::new(), |_| {})
            .await
            .unwrap_err();
        assert!(failure.error.to_string().contains("invalid run id"));
    }

    /// Resume validates the id before touching the store, so a file store
    /// never reads or rewrites a checkpoint outside its runs directory.
    #[tokio::test]
    async fn resume_rejects_run_id_escaping_runs_dir() {
        let temp = tempfile::tempdir().expect("tempdir");
        let runs_dir = temp.path().join("runs");
        std::fs::create_dir_all(&runs_dir).expect("runs dir");
        let store = FileCheckpointStore::new(&runs_dir);
        let outside = Checkpoint {
            run_id: "../escape".to_string(),
            next: Some(StepName::Plan),
            steps_completed: 1,
            state: initialized_state("reqs", 2),
            result: None,
        };
        store.save(&outside).expect("seed checkpoint");
        let outside_path = temp.path().join("escape").join("checkpoint.json");
        let before = std::fs::read_to_string(&outside_path).expect("outside checkpoint");

        let engine = WorkflowEngine::new(scripted_run(&[Valid]), store, EngineConfig::default());
        let failure = engine
            .resume("../escape", &CancellationToken::new(), |_| {})
            .await
            .unwrap_err();

        assert!(matches!(failure.error, WorkflowError::Precondition { .. }));
        assert!(failure.error.to_string().contains("invalid run id"));
        assert_eq!(engine.responder().calls(StepName::Plan), 0);
        assert_eq!(std::fs::read_to_string(&outside_path).expect("unchanged"), before);
    }

    #[tokio::test]
    async fn resume_of_unknown_run_fails() {
        let engine = engine(ScriptedResponder::new());
        let failure = engine
            .resume("run-404", &CancellationToken::new(), |_| {})
            .await
            .unwrap_err();
        assert!(matches!(failure.error, WorkflowError::Checkpoint(_)));
    }

    /// A tampered checkpoint is rejected before any step runs.
    #[tokio::test]
    async fn resume_checks_state_invariants() {
        let engine = engine(scripted_run(&[Valid]));
        let mut state = WorkflowState::default().merged(initialize(&config(1)));
        state.retry_count = 5;
        engine
            .store()
            .save(&Checkpoint {
                run_id: "run-1".to_string(),
                next: Some(StepName::Plan),
                steps_completed: 1,
                state,
                result: None,
            })
            .expect("save");

        let failure = engine
            .resume("run-1", &CancellationToken::new(), |_| {})
            .await
            .unwrap_err();
        assert!(matches!(failure.error, WorkflowError::InvariantViolation { .. }));
        assert!(engine.responder().requests().is_empty());
    }

    #[tokio::test]
    async fn cancellation_between_steps_stops_before_next_step() {
        let engine = engine(scripted_run(&[Valid]));
        let cancel = CancellationToken::new();

        let failure = engine
            .start("run-1", &config(2), &cancel, |r| {
                if r.step == StepName::Plan {
                    cancel.cancel();
                }
            })
            .await
            .unwrap_err();

        assert!(matches!(failure.error, WorkflowError::Cancelled { step: StepName::Generate }));
        assert_eq!(engine.responder().calls(StepName::Generate), 0);
        let checkpoint = engine.store().load("run-1").expect("load").expect("present");
        assert_eq!(checkpoint.next, Some(StepName::Generate));
        assert!(checkpoint.state.plan_result.is_some());
    }

    /// Cancelling while a capability call is in flight abandons the call and
    /// keeps the checkpoint at the last completed step.
    #[tokio::test]
    async fn cancellation_aborts_in_flight_call() {
        let responder = ScriptedResponder::new()
            .with(StepName::Plan, [plan_reply()])
            .with(StepName::Generate, [ScriptedReply::Hang]);
        let engine = engine(responder);
        let cancel = CancellationToken::new();

        let cfg = config(2);
        let (outcome, ()) = tokio::join!(
            engine.start("run-1", &cfg, &cancel, |_| {}),
            async {
                tokio::time::sleep(Duration::from_millis(20)).await;
                cancel.cancel();
            }
        );

        let failure = outcome.unwrap_err();
        assert!(failure.error.is_cancelled());
        assert_eq!(failure.error.step(), Some(StepName::Generate));
        let checkpoint = engine.store().load("run-1").expect("load").expect("present");
        assert_eq!(checkpoint.steps_completed, 2);
        assert_eq!(checkpoint.next, Some(StepName::Generate));
    }

    #[tokio::test(start_paused = true)]
    async fn hanging_capability_times_out_with_run_budget() {
        let responder = ScriptedResponder::new().with(StepName::Plan, [ScriptedReply::Hang]);
        let engine = WorkflowEngine::new(
            responder,
            MemoryCheckpointStore::new(),
            EngineConfig {
                run_timeout: Duration::from_secs(2),
                ..EngineConfig::default()
            },
        );

        let failure = engine
            .start("run-1", &config(2), &CancellationToken::new(), |_| {})
            .await
            .unwrap_err();

        assert!(matches!(
            failure.error,
            WorkflowError::Capability {
                step: StepName::Plan,
                source: CapabilityError::Timeout(_),
            }
        ));
    }

    /// Runs sharing one engine keep separate state and checkpoints.
    #[tokio::test]
    async fn concurrent_runs_are_isolated() {
        let responder = scripted_run(&[Valid]);
        responder.push(StepName::Plan, plan_reply());
        responder.push(StepName::Generate, generation_reply(1));
        responder.push(StepName::Validate, validation_reply(Valid, 1));
        let engine = engine(responder);
        let cancel = CancellationToken::new();

        let cfg_a = config(2);
        let cfg_b = RunConfig::new("The socket shall be E27.").with_retry_limit(1);
        let (a, b) = tokio::join!(
            engine.start("run-a", &cfg_a, &cancel, |_| {}),
            engine.start(
                "run-b",
                &cfg_b,
                &cancel,
                |_| {}
            ),
        );

        assert_eq!(a.expect("a").outcome, RunOutcome::Valid);
        assert_eq!(b.expect("b").outcome, RunOutcome::Valid);
        let a = engine.store().load("run-a").expect("load").expect("a");
        let b = engine.store().load("run-b").expect("load").expect("b");
        assert_eq!(a.state.retry_limit, 2);
        assert_eq!(b.state.retry_limit, 1);
        assert_eq!(b.state.requirements.as_deref(), Some("The socket shall be E27."));
        let run_ids: Vec<String> = engine
            .responder()
            .requests()
            .into_iter()
            .map(|r| r.run_id)
            .collect();
        assert_eq!(run_ids.iter().filter(|id| *id == "run-a").count(), 3);
        assert_eq!(run_ids.iter().filter(|id| *id == "run-b").count(), 3);
    }
}
