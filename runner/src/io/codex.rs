//! Structured responder backed by `codex exec`.
//!
//! The system instruction and payload are fed on stdin, the target schema is
//! written next to the expected output file and passed via `--output-schema`,
//! and the last message is read back from `--output-last-message`.

use std::fs;
use std::path::{Path, PathBuf};

use anyhow::{Context, Result, anyhow};
use async_trait::async_trait;
use tokio::process::Command;
use tracing::{debug, info, instrument, warn};

use crate::error::CapabilityError;
use crate::io::config::ResponderConfig;
use crate::io::process::{CommandOutput, run_command};
use crate::io::responder::{ResponseRequest, StructuredResponder};

/// Responder that spawns `codex exec` (or a compatible command) per request.
#[derive(Debug, Clone)]
pub struct CodexResponder {
    command: Vec<String>,
    args: Vec<String>,
    workdir: PathBuf,
    scratch_dir: PathBuf,
    output_limit_bytes: usize,
}

impl CodexResponder {
    pub fn new(
        config: &ResponderConfig,
        workdir: impl Into<PathBuf>,
        scratch_dir: impl Into<PathBuf>,
        output_limit_bytes: usize,
    ) -> Self {
        Self {
            command: config.command.clone(),
            args: config.args.clone(),
            workdir: workdir.into(),
            scratch_dir: scratch_dir.into(),
            output_limit_bytes,
        }
    }

    /// Scratch files for one request. Run ids keep concurrent runs apart.
    fn request_paths(&self, request: &ResponseRequest) -> RequestPaths {
        let dir = self.scratch_dir.join(&request.run_id);
        let step = request.step.as_str();
        RequestPaths {
            schema_path: dir.join(format!("{step}.schema.json")),
            output_path: dir.join(format!("{step}.output.json")),
            log_path: dir.join(format!("{step}.log")),
            dir,
        }
    }

    fn build_command(&self, paths: &RequestPaths) -> Result<Command> {
        let (program, leading) = self
            .command
            .split_first()
            .ok_or_else(|| anyhow!("responder command is empty"))?;
        let mut cmd = Command::new(program);
        cmd.args(leading)
            .args(&self.args)
            // Allow running in directories without a git repository.
            .arg("--skip-git-repo-check")
            .arg("--output-schema")
            .arg(&paths.schema_path)
            .arg("--output-last-message")
            .arg(&paths.output_path)
            .arg("-")
            .current_dir(&self.workdir);
        Ok(cmd)
    }

    async fn exec(&self, request: &ResponseRequest) -> Result<String> {
        let paths = self.request_paths(request);
        fs::create_dir_all(&paths.dir)
            .with_context(|| format!("create scratch dir {}", paths.dir.display()))?;
        fs::write(&paths.schema_path, request.schema.raw())
            .with_context(|| format!("write schema {}", paths.schema_path.display()))?;
        if paths.output_path.exists() {
            fs::remove_file(&paths.output_path).with_context(|| {
                format!("remove stale output {}", paths.output_path.display())
            })?;
        }

        let prompt = format!(
            "{}\n\n{}\n",
            request.system_instruction.trim(),
            request.user_payload.trim()
        );
        let cmd = self.build_command(&paths)?;
        let output = run_command(cmd, Some(prompt.as_bytes()), self.output_limit_bytes)
            .await
            .context("run codex exec")?;
        write_responder_log(&paths.log_path, &output, self.output_limit_bytes)?;

        if !output.status.success() {
            warn!(exit_code = ?output.status.code(), log = %paths.log_path.display(), "codex exec failed");
            return Err(anyhow!(
                "codex exec failed with status {:?} (see {})",
                output.status.code(),
                paths.log_path.display()
            ));
        }
        if !paths.output_path.exists() {
            return Err(anyhow!(
                "missing responder output {}",
                paths.output_path.display()
            ));
        }
        let contents = fs::read_to_string(&paths.output_path)
            .with_context(|| format!("read responder output {}", paths.output_path.display()))?;
        debug!(bytes = contents.len(), "codex exec completed successfully");
        Ok(contents)
    }
}

#[async_trait]
impl StructuredResponder for CodexResponder {
    #[instrument(skip_all, fields(run_id = %request.run_id, step = %request.step))]
    async fn respond(&self, request: &ResponseRequest) -> Result<String, CapabilityError> {
        info!(workdir = %self.workdir.display(), "starting codex exec");
        self.exec(request).await.map_err(CapabilityError::backend)
    }
}

#[derive(Debug)]
struct RequestPaths {
    dir: PathBuf,
    schema_path: PathBuf,
    output_path: PathBuf,
    log_path: PathBuf,
}

fn write_responder_log(path: &Path, output: &CommandOutput, output_limit: usize) -> Result<()> {
    let mut buf = String::new();
    buf.push_str("=== stdout ===\n");
    buf.push_str(&String::from_utf8_lossy(&output.stdout));
    buf.push_str(&output.stdout_truncated_notice("responder"));
    buf.push_str("\n=== stderr ===\n");
    buf.push_str(&String::from_utf8_lossy(&output.stderr));
    buf.push_str(&output.stderr_truncated_notice("responder"));

    if buf.len() > output_limit {
        let mut cut = output_limit;
        while !buf.is_char_boundary(cut) {
            cut -= 1;
        }
        let dropped = buf.len() - cut;
        buf.truncate(cut);
        buf.push_str(&format!("\n[truncated {dropped} bytes]\n"));
    }

    fs::write(path, buf).with_context(|| format!("write responder log {}", path.display()))
}
