//! Stable exit codes for runner CLI commands.

use crate::core::types::RunOutcome;

/// Command succeeded; for `run` and `resume` the model was judged valid.
pub const OK: i32 = 0;
/// Command failed: bad layout, config or run id, or a step failed.
pub const FAILED: i32 = 1;
/// The run ended with the retry budget spent and the model still invalid.
pub const EXHAUSTED: i32 = 2;
/// The run was cancelled (Ctrl-C); it can be resumed.
pub const CANCELLED: i32 = 3;

pub fn for_outcome(outcome: RunOutcome) -> i32 {
    match outcome {
        RunOutcome::Valid => OK,
        RunOutcome::Exhausted => EXHAUSTED,
    }
}
