//! I/O helpers for the workflow engine and CLI commands.

pub mod atomic;
pub mod checkpoint;
pub mod codex;
pub mod config;
pub mod init;
pub mod process;
pub mod prompt;
pub mod responder;
pub mod step_log;
