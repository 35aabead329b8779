//! Plan, generate and validate SysML v2 models from natural-language
//! requirements.
//!
//! A run walks a fixed graph: `init -> plan -> generate -> validate`, after
//! which a router either finishes the run or sends it back to `generate` with
//! the validator's feedback. Retries are bounded by the run's retry limit.
//!
//! - **[`core`]**: Pure, deterministic logic (state, graph, router, invariants,
//!   schemas). No I/O, fully testable in isolation.
//! - **[`io`]**: Side-effecting operations (responder processes, prompts,
//!   checkpoints, step logs, config).
//! - **[`agents`]**: One agent per model-backed step, turning state into a
//!   structured request and the response into a state update.
//!
//! [`engine`] drives the graph; [`run`] wires it to a project directory for
//! the CLI.

pub mod agents;
pub mod core;
pub mod engine;
pub mod error;
pub mod exit_codes;
pub mod io;
pub mod logging;
pub mod run;
#[cfg(any(test, feature = "test-support"))]
pub mod test_support;
