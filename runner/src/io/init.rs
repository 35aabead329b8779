//! Initialization helpers for `.runner/` scaffolding.

use std::fs;
use std::path::{Path, PathBuf};

use anyhow::{Context, Result, anyhow};

use super::config::{RunnerConfig, write_config};

const SAMPLE_REQUIREMENTS: &str = include_str!("prompts/sample_requirements.md");
const RUNNER_GITIGNORE: &str = "runs/\nscratch/\n";

/// All canonical paths within `.runner/` for a project root.
#[derive(Debug, Clone)]
pub struct RunnerPaths {
    pub root: PathBuf,
    pub runner_dir: PathBuf,
    pub runs_dir: PathBuf,
    pub scratch_dir: PathBuf,
    pub gitignore_path: PathBuf,
    pub config_path: PathBuf,
    pub requirements_path: PathBuf,
}

impl RunnerPaths {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        let root = root.into();
        let runner_dir = root.join(".runner");
        Self {
            root: root.clone(),
            runner_dir: runner_dir.clone(),
            runs_dir: runner_dir.join("runs"),
            scratch_dir: runner_dir.join("scratch"),
            gitignore_path: runner_dir.join(".gitignore"),
            config_path: runner_dir.join("config.toml"),
            requirements_path: runner_dir.join("REQUIREMENTS.md"),
        }
    }

    pub fn run_dir(&self, run_id: &str) -> PathBuf {
        self.runs_dir.join(run_id)
    }

    pub fn steps_dir(&self, run_id: &str) -> PathBuf {
        self.run_dir(run_id).join("steps")
    }

    pub fn result_path(&self, run_id: &str) -> PathBuf {
        self.run_dir(run_id).join("result.json")
    }

    pub fn failure_path(&self, run_id: &str) -> PathBuf {
        self.run_dir(run_id).join("failure.txt")
    }
}

/// Options for `init_runner`.
#[derive(Debug, Clone)]
pub struct InitOptions {
    /// If true, overwrite existing runner-owned files.
    pub force: bool,
}

/// Create `.runner/` scaffolding in `root`.
///
/// Fails if `.runner/` already exists unless `options.force` is set. Run
/// history under `runs/` is never removed.
pub fn init_runner(root: &Path, options: &InitOptions) -> Result<RunnerPaths> {
    let paths = RunnerPaths::new(root);
    if paths.runner_dir.exists() && !paths.runner_dir.is_dir() {
        return Err(anyhow!(
            "runner init: .runner exists but is not a directory"
        ));
    }
    if paths.runner_dir.exists() && !options.force {
        return Err(anyhow!(
            "runner init: .runner already exists (use --force to overwrite)"
        ));
    }

    create_dir(&paths.runner_dir)?;
    create_dir(&paths.runs_dir)?;
    create_dir(&paths.scratch_dir)?;

    write_file(&paths.gitignore_path, RUNNER_GITIGNORE)?;
    write_file(&paths.requirements_path, SAMPLE_REQUIREMENTS)?;
    write_config(&paths.config_path, &RunnerConfig::default())?;

    Ok(paths)
}

fn create_dir(path: &Path) -> Result<()> {
    fs::create_dir_all(path).with_context(|| format!("create directory {}", path.display()))
}

fn write_file(path: &Path, contents: &str) -> Result<()> {
    if let Some(parent) = path.parent() {
        create_dir(parent)?;
    }
    fs::write(path, contents).with_context(|| format!("write file {}", path.display()))
}
