//! Stable exit codes for `stepflow` CLI commands.

use crate::core::types::RunStatus;

/// Command succeeded or the run finished with `succeeded`.
pub const OK: i32 = 0;
/// Command failed due to invalid config/flow/run identity or other errors.
pub const INVALID: i32 = 1;
/// The run halted with status `failed`.
pub const FAILED: i32 = 2;
/// The run escalated and needs external intervention.
pub const ESCALATED: i32 = 3;
/// The flow deadline was exceeded.
pub const TIMEOUT: i32 = 4;
/// The run was interrupted (cancel request) and can be resumed.
pub const INTERRUPTED: i32 = 5;
/// The run has not reached a terminal state (`pending` or `running`).
pub const IN_PROGRESS: i32 = 6;

/// Map a run status to the exit code reported by `start`, `resume` and `status`.
pub fn for_status(status: RunStatus) -> i32 {
    match status {
        RunStatus::Succeeded => OK,
        RunStatus::Failed => FAILED,
        RunStatus::Escalated => ESCALATED,
        RunStatus::Timeout => TIMEOUT,
        RunStatus::Interrupted => INTERRUPTED,
        RunStatus::Pending | RunStatus::Running => IN_PROGRESS,
    }
}
