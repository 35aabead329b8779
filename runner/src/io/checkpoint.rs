//! Per-run checkpoints: the merged state after every step, keyed by run id.
//!
//! A run can be resumed from its latest checkpoint after a crash or a
//! cancellation. Checkpoints for different run ids never interact.

use std::collections::HashMap;
use std::fs;
use std::path::PathBuf;
use std::sync::Mutex;

use anyhow::{Context, Result, anyhow};
use serde::{Deserialize, Serialize};
use tracing::debug;

use crate::core::graph::StepName;
use crate::core::state::WorkflowState;
use crate::core::types::RunResult;
use crate::io::atomic::write_atomic;

const CHECKPOINT_FILE: &str = "checkpoint.json";

/// Snapshot of a run between steps.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct Checkpoint {
    pub run_id: String,
    /// Step to execute next; `None` once the run reached the terminal node.
    pub next: Option<StepName>,
    /// Number of steps merged so far.
    pub steps_completed: u32,
    pub state: WorkflowState,
    /// Final result, recorded when `next` becomes `None`.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub result: Option<RunResult>,
}

impl Checkpoint {
    pub fn is_finished(&self) -> bool {
        self.next.is_none()
    }
}

/// Storage for run checkpoints.
///
/// Implementations must be safe to share between concurrent runs.
pub trait CheckpointStore: Send + Sync {
    /// Latest checkpoint for `run_id`, or `None` if the run is unknown.
    fn load(&self, run_id: &str) -> Result<Option<Checkpoint>>;
    /// Replace the checkpoint for `checkpoint.run_id`.
    fn save(&self, checkpoint: &Checkpoint) -> Result<()>;
}

/// In-process store, lost when the process exits.
#[derive(Debug, Default)]
pub struct MemoryCheckpointStore {
    checkpoints: Mutex<HashMap<String, Checkpoint>>,
}

impl MemoryCheckpointStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Run ids with a stored checkpoint, sorted.
    pub fn run_ids(&self) -> Vec<String> {
        let mut ids = match self.checkpoints.lock() {
            Ok(guard) => guard.keys().cloned().collect::<Vec<_>>(),
            Err(poisoned) => poisoned.into_inner().keys().cloned().collect(),
        };
        ids.sort();
        ids
    }
}

impl CheckpointStore for MemoryCheckpointStore {
    fn load(&self, run_id: &str) -> Result<Option<Checkpoint>> {
        let guard = self
            .checkpoints
            .lock()
            .map_err(|_| anyhow!("checkpoint store lock poisoned"))?;
        Ok(guard.get(run_id).cloned())
    }

    fn save(&self, checkpoint: &Checkpoint) -> Result<()> {
        let mut guard = self
            .checkpoints
            .lock()
            .map_err(|_| anyhow!("checkpoint store lock poisoned"))?;
        guard.insert(checkpoint.run_id.clone(), checkpoint.clone());
        Ok(())
    }
}

/// Store writing `<runs_dir>/<run_id>/checkpoint.json`.
#[derive(Debug, Clone)]
pub struct FileCheckpointStore {
    runs_dir: PathBuf,
}

impl FileCheckpointStore {
    pub fn new(runs_dir: impl Into<PathBuf>) -> Self {
        Self {
            runs_dir: runs_dir.into(),
        }
    }

    pub fn checkpoint_path(&self, run_id: &str) -> PathBuf {
        self.runs_dir.join(run_id).join(CHECKPOINT_FILE)
    }
}

impl CheckpointStore for FileCheckpointStore {
    fn load(&self, run_id: &str) -> Result<Option<Checkpoint>> {
        let path = self.checkpoint_path(run_id);
        if !path.exists() {
            return Ok(None);
        }
        debug!(path = %path.display(), "loading checkpoint");
        let contents = fs::read_to_string(&path)
            .with_context(|| format!("read checkpoint {}", path.display()))?;
        let checkpoint: Checkpoint = serde_json::from_str(&contents)
            .with_context(|| format!("parse checkpoint {}", path.display()))?;
        if checkpoint.run_id != run_id {
            return Err(anyhow!(
                "checkpoint {} belongs to run {}",
                path.display(),
                checkpoint.run_id
            ));
        }
        Ok(Some(checkpoint))
    }

    fn save(&self, checkpoint: &Checkpoint) -> Result<()> {
        let path = self.checkpoint_path(&checkpoint.run_id);
        debug!(
            path = %path.display(),
            next = ?checkpoint.next,
            steps_completed = checkpoint.steps_completed,
            "writing checkpoint"
        );
        let mut buf = serde_json::to_string_pretty(checkpoint)?;
        buf.push('\n');
        write_atomic(&path, &buf)
    }
}
