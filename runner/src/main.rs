//! Plan/generate/validate workflow runner.
//!
//! Turns a requirements document into a SysML v2 model by planning once,
//! generating, and regenerating with validator feedback until the model is
//! valid or the retry budget is spent. Runs live under `.runner/runs/` and
//! can be resumed from their last checkpoint.

use std::fs;
use std::path::{Path, PathBuf};

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use mbse_runner::error::RunFailure;
use mbse_runner::exit_codes;
use mbse_runner::io::init::{InitOptions, init_runner};
use mbse_runner::logging;
use mbse_runner::run::{
    RunReport, RunRequest, codex_responder, load_status, resume_run, start_run,
};
use tokio_util::sync::CancellationToken;
use tracing::warn;

#[derive(Parser)]
#[command(
    name = "mbse-runner",
    version,
    about = "Plan, generate and validate SysML v2 models from requirements"
)]
struct Cli {
    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand)]
enum Command {
    /// Create `.runner/` with a default config and sample requirements.
    Init {
        /// Overwrite config and sample requirements (runs are kept).
        #[arg(short, long)]
        force: bool,
    },
    /// Start a new run for a requirements file.
    Run {
        /// Path to the requirements document.
        #[arg(short, long)]
        requirements: PathBuf,
        /// Maximum number of regenerations after an invalid validation.
        #[arg(long)]
        retry_limit: Option<u32>,
        /// Run id; derived from the requirements when omitted.
        #[arg(long)]
        run_id: Option<String>,
    },
    /// Continue a run from its last checkpoint.
    Resume { run_id: String },
    /// Print a run's checkpoint as JSON.
    Status { run_id: String },
}

#[tokio::main]
async fn main() {
    logging::init();
    let cli = Cli::parse();
    let code = match run(cli).await {
        Ok(code) => code,
        Err(err) => {
            eprintln!("{:#}", err);
            exit_code_for(&err)
        }
    };
    std::process::exit(code);
}

async fn run(cli: Cli) -> Result<i32> {
    let root = std::env::current_dir().context("resolve current directory")?;
    match cli.command {
        Command::Init { force } => cmd_init(&root, force),
        Command::Run {
            requirements,
            retry_limit,
            run_id,
        } => cmd_run(&root, &requirements, retry_limit, run_id).await,
        Command::Resume { run_id } => cmd_resume(&root, &run_id).await,
        Command::Status { run_id } => cmd_status(&root, &run_id),
    }
}

fn cmd_init(root: &Path, force: bool) -> Result<i32> {
    let paths = init_runner(root, &InitOptions { force })?;
    println!("initialized {}", paths.runner_dir.display());
    Ok(exit_codes::OK)
}

async fn cmd_run(
    root: &Path,
    requirements: &Path,
    retry_limit: Option<u32>,
    run_id: Option<String>,
) -> Result<i32> {
    let requirements = fs::read_to_string(requirements)
        .with_context(|| format!("read {}", requirements.display()))?;
    let cancel = cancel_on_interrupt();
    let report = start_run(
        root,
        codex_responder(root)?,
        RunRequest {
            requirements,
            retry_limit,
            run_id,
        },
        &cancel,
    )
    .await?;
    print_report(&report)
}

async fn cmd_resume(root: &Path, run_id: &str) -> Result<i32> {
    let cancel = cancel_on_interrupt();
    let report = resume_run(root, codex_responder(root)?, run_id, &cancel).await?;
    print_report(&report)
}

fn cmd_status(root: &Path, run_id: &str) -> Result<i32> {
    let checkpoint = load_status(root, run_id)?;
    let json = serde_json::to_string_pretty(&checkpoint).context("serialize checkpoint")?;
    println!("{json}");
    Ok(exit_codes::OK)
}

fn print_report(report: &RunReport) -> Result<i32> {
    let json = serde_json::to_string_pretty(report).context("serialize run result")?;
    println!("{json}");
    Ok(exit_codes::for_outcome(report.result.outcome))
}

fn exit_code_for(err: &anyhow::Error) -> i32 {
    match err.downcast_ref::<RunFailure>() {
        Some(failure) if failure.error.is_cancelled() => exit_codes::CANCELLED,
        _ => exit_codes::FAILED,
    }
}

/// Token cancelled on the first Ctrl-C.
fn cancel_on_interrupt() -> CancellationToken {
    let cancel = CancellationToken::new();
    let token = cancel.clone();
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            warn!("interrupt received; cancelling run");
            token.cancel();
        }
    });
    cancel
}
