//! Orchestration for runs rooted in a project directory.
//!
//! Wires the engine to the file checkpoint store, the step log under
//! `.runner/runs/<run_id>/` and the configured responder. Starting a run
//! creates `.runner/` if it is missing.

use std::fs;
use std::path::{Path, PathBuf};

use anyhow::{Context, Result, anyhow, bail};
use serde::Serialize;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::core::run_id::{base_run_id, run_id_candidates, validate_run_id};
use crate::core::state::RunConfig;
use crate::core::types::RunResult;
use crate::engine::{EngineConfig, StepRecord, WorkflowEngine};
use crate::error::RunFailure;
use crate::io::checkpoint::{Checkpoint, CheckpointStore, FileCheckpointStore};
use crate::io::codex::CodexResponder;
use crate::io::config::load_config;
use crate::io::init::{InitOptions, RunnerPaths, init_runner};
use crate::io::responder::StructuredResponder;
use crate::io::step_log::{StepMeta, StepWriteRequest, write_result, write_step};

/// Inputs for `mbse-runner run`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RunRequest {
    pub requirements: String,
    /// Overrides `retry_limit` from the config file.
    pub retry_limit: Option<u32>,
    /// Explicit run id; generated from the requirements when absent.
    pub run_id: Option<String>,
}

/// What a finished run reports on stdout.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct RunReport {
    pub run_id: String,
    #[serde(flatten)]
    pub result: RunResult,
}

/// Build the process-backed responder from the project's config.
pub fn codex_responder(root: &Path) -> Result<CodexResponder> {
    let paths = RunnerPaths::new(root);
    let cfg = load_config(&paths.config_path)?;
    Ok(CodexResponder::new(
        &cfg.responder,
        root,
        &paths.scratch_dir,
        cfg.output_limit_bytes,
    ))
}

/// Start a new run in `root`.
///
/// On failure the returned error wraps a [`RunFailure`]; the checkpoint keeps
/// the last completed step so the run can be resumed.
pub async fn start_run<R: StructuredResponder>(
    root: &Path,
    responder: R,
    request: RunRequest,
    cancel: &CancellationToken,
) -> Result<RunReport> {
    let paths = ensure_initialized(root)?;
    let cfg = load_config(&paths.config_path)?;

    let run_id = match request.run_id {
        Some(id) => {
            validate_run_id(&id).map_err(|msg| anyhow!(msg))?;
            if paths.run_dir(&id).exists() {
                bail!("run {id} already exists (use `mbse-runner resume {id}`)");
            }
            id
        }
        None => next_run_id(&paths.runs_dir, &request.requirements)?,
    };
    let config = RunConfig {
        requirements: request.requirements,
        retry_limit: Some(request.retry_limit.unwrap_or(cfg.retry_limit)),
    };
    info!(run_id = %run_id, retry_limit = ?config.retry_limit, "starting run");

    let engine = WorkflowEngine::new(
        responder,
        FileCheckpointStore::new(&paths.runs_dir),
        EngineConfig::from(&cfg),
    );
    let mut log = StepLog::new(&paths, &run_id);
    let outcome = engine
        .start(&run_id, &config, cancel, |record| log.record(record))
        .await;
    finish(&paths, &run_id, outcome, log)
}

/// Continue a run from its checkpoint.
pub async fn resume_run<R: StructuredResponder>(
    root: &Path,
    responder: R,
    run_id: &str,
    cancel: &CancellationToken,
) -> Result<RunReport> {
    let paths = existing_paths(root)?;
    validate_run_id(run_id).map_err(|msg| anyhow!(msg))?;
    let cfg = load_config(&paths.config_path)?;
    info!(run_id = %run_id, "resuming run");

    let engine = WorkflowEngine::new(
        responder,
        FileCheckpointStore::new(&paths.runs_dir),
        EngineConfig::from(&cfg),
    );
    let mut log = StepLog::new(&paths, run_id);
    let outcome = engine
        .resume(run_id, cancel, |record| log.record(record))
        .await;
    finish(&paths, run_id, outcome, log)
}

/// Latest checkpoint of `run_id`.
pub fn load_status(root: &Path, run_id: &str) -> Result<Checkpoint> {
    let paths = existing_paths(root)?;
    validate_run_id(run_id).map_err(|msg| anyhow!(msg))?;
    FileCheckpointStore::new(&paths.runs_dir)
        .load(run_id)?
        .ok_or_else(|| anyhow!("no checkpoint for run {run_id}"))
}

/// First unused id derived from `requirements`: `run-<hash>`, `run-<hash>-2`, ...
pub fn next_run_id(runs_dir: &Path, requirements: &str) -> Result<String> {
    let base = base_run_id(requirements);
    run_id_candidates(&base)
        .find(|id| !runs_dir.join(id).exists())
        .ok_or_else(|| anyhow!("no free run id left for {base}"))
}

fn ensure_initialized(root: &Path) -> Result<RunnerPaths> {
    let paths = RunnerPaths::new(root);
    if !paths.runner_dir.exists() {
        debug!(root = %root.display(), "initializing .runner");
        init_runner(root, &InitOptions { force: false }).context("runner init")?;
    }
    Ok(paths)
}

fn existing_paths(root: &Path) -> Result<RunnerPaths> {
    let paths = RunnerPaths::new(root);
    if !paths.runner_dir.is_dir() {
        bail!(
            "missing {} (run `mbse-runner init` first)",
            paths.runner_dir.display()
        );
    }
    Ok(paths)
}

fn finish(
    paths: &RunnerPaths,
    run_id: &str,
    outcome: Result<RunResult, RunFailure>,
    log: StepLog,
) -> Result<RunReport> {
    let failure_path = paths.failure_path(run_id);
    match outcome {
        Ok(result) => {
            log.into_result()?;
            write_result(&paths.result_path(run_id), &result)?;
            if failure_path.exists() {
                fs::remove_file(&failure_path)
                    .with_context(|| format!("remove {}", failure_path.display()))?;
            }
            info!(run_id, outcome = result.outcome.as_str(), "run finished");
            Ok(RunReport {
                run_id: run_id.to_string(),
                result,
            })
        }
        Err(failure) => {
            if let Err(err) = log.into_result() {
                warn!(err = %err, "step log incomplete");
            }
            if paths.run_dir(run_id).is_dir() {
                fs::write(&failure_path, format!("{failure}\n"))
                    .with_context(|| format!("write {}", failure_path.display()))?;
            }
            Err(anyhow::Error::new(failure))
        }
    }
}

/// Step observer writing `steps/<seq>-<step>/`. Keeps the first write error
/// and stops writing after it.
struct StepLog {
    run_id: String,
    steps_dir: PathBuf,
    error: Option<anyhow::Error>,
}

impl StepLog {
    fn new(paths: &RunnerPaths, run_id: &str) -> Self {
        Self {
            run_id: run_id.to_string(),
            steps_dir: paths.steps_dir(run_id),
            error: None,
        }
    }

    fn record(&mut self, record: &StepRecord) {
        if self.error.is_some() {
            return;
        }
        let meta = StepMeta {
            run_id: self.run_id.clone(),
            seq: record.seq,
            step: record.step,
            retry_count: record.retry_count,
            route: record.route.map(|route| route.as_str().to_string()),
            duration_ms: u64::try_from(record.duration.as_millis()).unwrap_or(u64::MAX),
        };
        let written = write_step(&StepWriteRequest {
            steps_dir: &self.steps_dir,
            meta: &meta,
            payload: record.payload.as_deref(),
            update: &record.update,
        });
        if let Err(err) = written {
            warn!(err = %err, seq = record.seq, "failed to write step log");
            self.error = Some(err);
        }
    }

    fn into_result(self) -> Result<()> {
        match self.error {
            Some(err) => Err(err.context("write step log")),
            None => Ok(()),
        }
    }
}
