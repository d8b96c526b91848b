//! Resumable stepwise flow orchestration kernel.
//!
//! A flow is an ordered list of steps, each bound to an external executor. The
//! kernel drives one run of a flow at a time per thread, checkpoints a receipt
//! and a handoff after every attempt, and decides what happens next from the
//! classified outcome. The architecture enforces a strict separation:
//!
//! - **[`core`]**: Pure, deterministic logic (classification, circuit breaker,
//!   deadline clamping, routing, microloop convergence, run transitions).
//!   No I/O, fully testable in isolation.
//! - **[`io`]**: Side-effecting operations (checkpoint store, run record,
//!   event log, executor supervision, child processes, configuration).
//!
//! [`runner`] coordinates core logic with I/O to drive a run; [`kernel`] is the
//! public entry point (`start_run`, `resume_run`, `run_status`).

pub mod core;
pub mod exit_codes;
pub mod flow;
pub mod io;
pub mod kernel;
pub mod logging;
pub mod runner;
#[cfg(any(test, feature = "test-support"))]
pub mod test_support;
