//! Runner configuration stored under `.runner/config.toml`.

use std::fs;
use std::path::Path;
use std::time::Duration;

use anyhow::{Context, Result, anyhow};
use serde::{Deserialize, Serialize};

use crate::core::state::DEFAULT_RETRY_LIMIT;
use crate::io::atomic::write_atomic;

/// Runner configuration (TOML).
///
/// This file is intended to be edited by humans. Missing fields fall back to
/// the defaults below.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(default)]
pub struct RunnerConfig {
    /// Regeneration attempts allowed after the first generation.
    pub retry_limit: u32,

    /// Wall-clock budget for a whole run in seconds.
    pub run_timeout_secs: u64,

    /// Upper bound on a rendered user payload; droppable sections go first.
    pub prompt_budget_bytes: usize,

    /// Truncate responder stdout/stderr logs beyond this many bytes.
    pub output_limit_bytes: usize,

    pub responder: ResponderConfig,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(default)]
pub struct ResponderConfig {
    /// Program and leading arguments (e.g. `["codex","exec"]`).
    pub command: Vec<String>,
    /// Extra arguments inserted before the schema/output flags.
    pub args: Vec<String>,
}

impl Default for ResponderConfig {
    fn default() -> Self {
        Self {
            command: vec!["codex".to_string(), "exec".to_string()],
            args: vec![
                "-c".to_string(),
                "model_reasoning_effort=medium".to_string(),
                "--sandbox".to_string(),
                "read-only".to_string(),
            ],
        }
    }
}

impl Default for RunnerConfig {
    fn default() -> Self {
        Self {
            retry_limit: DEFAULT_RETRY_LIMIT,
            run_timeout_secs: 60 * 60,
            prompt_budget_bytes: 200_000,
            output_limit_bytes: 200_000,
            responder: ResponderConfig::default(),
        }
    }
}

impl RunnerConfig {
    pub fn validate(&self) -> Result<()> {
        if self.run_timeout_secs == 0 {
            return Err(anyhow!("run_timeout_secs must be > 0"));
        }
        if self.prompt_budget_bytes == 0 {
            return Err(anyhow!("prompt_budget_bytes must be > 0"));
        }
        if self.output_limit_bytes == 0 {
            return Err(anyhow!("output_limit_bytes must be > 0"));
        }
        if self.responder.command.is_empty() || self.responder.command[0].trim().is_empty() {
            return Err(anyhow!("responder.command must be a non-empty array"));
        }
        Ok(())
    }

    pub fn run_timeout(&self) -> Duration {
        Duration::from_secs(self.run_timeout_secs)
    }
}

/// Load config from a TOML file.
///
/// If the file is missing, returns `RunnerConfig::default()`.
pub fn load_config(path: &Path) -> Result<RunnerConfig> {
    if !path.exists() {
        let cfg = RunnerConfig::default();
        cfg.validate()?;
        return Ok(cfg);
    }
    let contents = fs::read_to_string(path).with_context(|| format!("read {}", path.display()))?;
    let cfg: RunnerConfig =
        toml::from_str(&contents).with_context(|| format!("parse {}", path.display()))?;
    cfg.validate()
        .with_context(|| format!("invalid config {}", path.display()))?;
    Ok(cfg)
}

/// Atomically write config to disk (temp file + rename).
pub fn write_config(path: &Path, cfg: &RunnerConfig) -> Result<()> {
    cfg.validate()?;
    let mut buf = toml::to_string_pretty(cfg).context("serialize config toml")?;
    buf.push('\n');
    write_atomic(path, &buf)
}
