//! Step logging helpers for `.runner/runs/<run_id>/steps/`.
//!
//! Every merged step gets its own directory holding the payload that was sent
//! and the structured output that came back, so a run can be audited or
//! replayed by hand.

use std::fs;
use std::path::{Path, PathBuf};

use anyhow::{Context, Result};
use serde::Serialize;

use crate::core::graph::StepName;
use crate::core::state::StateUpdate;
use crate::core::types::RunResult;

#[derive(Debug, Clone, Serialize)]
pub struct StepMeta {
    pub run_id: String,
    pub seq: u32,
    pub step: StepName,
    /// `retry_count` after the step (and any routing) was merged.
    pub retry_count: u32,
    /// Router decision taken after this step, if any.
    pub route: Option<String>,
    pub duration_ms: u64,
}

#[derive(Debug, Clone)]
pub struct StepLogPaths {
    pub dir: PathBuf,
    pub meta_path: PathBuf,
    pub payload_path: PathBuf,
    pub output_path: PathBuf,
}

impl StepLogPaths {
    pub fn new(steps_dir: &Path, seq: u32, step: StepName) -> Self {
        let dir = steps_dir.join(format!("{seq:03}-{step}"));
        Self {
            dir: dir.clone(),
            meta_path: dir.join("meta.json"),
            payload_path: dir.join("payload.md"),
            output_path: dir.join("output.json"),
        }
    }
}

pub struct StepWriteRequest<'a> {
    pub steps_dir: &'a Path,
    pub meta: &'a StepMeta,
    pub payload: Option<&'a str>,
    pub update: &'a StateUpdate,
}

pub fn write_step(request: &StepWriteRequest<'_>) -> Result<StepLogPaths> {
    let paths = StepLogPaths::new(request.steps_dir, request.meta.seq, request.meta.step);
    fs::create_dir_all(&paths.dir)
        .with_context(|| format!("create step dir {}", paths.dir.display()))?;

    write_json(&paths.meta_path, request.meta)?;
    if let Some(payload) = request.payload {
        write_text(&paths.payload_path, payload)?;
    }
    write_json(&paths.output_path, request.update)?;

    Ok(paths)
}

/// Write the final result of a run.
pub fn write_result(path: &Path, result: &RunResult) -> Result<()> {
    if let Some(parent) = path.parent() {
        fs::create_dir_all(parent)
            .with_context(|| format!("create directory {}", parent.display()))?;
    }
    write_json(path, result)
}

fn write_text(path: &Path, contents: &str) -> Result<()> {
    fs::write(path, contents).with_context(|| format!("write {}", path.display()))
}

fn write_json<T: Serialize>(path: &Path, value: &T) -> Result<()> {
    let mut buf = serde_json::to_string_pretty(value)?;
    buf.push('\n');
    write_text(path, &buf)
}
