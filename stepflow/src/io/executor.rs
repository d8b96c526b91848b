//! Step executor abstraction.
//!
//! The [`StepExecutor`] trait decouples the kernel from whatever performs the
//! step's work. [`CommandExecutor`] runs a configured command per executor
//! reference; tests use scripted executors that return predetermined
//! outcomes without spawning processes.

use std::collections::BTreeMap;
use std::fs;
use std::path::{Path, PathBuf};
use std::process::Command;
use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result, anyhow, bail};
use jsonschema::validator_for;
use serde::Serialize;
use serde_json::Value;
use tracing::{debug, info, instrument, warn};

use crate::core::deadline::{Deadline, ScopeLimits};
use crate::core::types::{Handoff, RawOutcome, StepStatus};
use crate::flow::{StepDef, StepRole};
use crate::io::clock::Clock;
use crate::io::process::{CommandOutput, run_command_with_timeout};
use crate::io::supervisor::{CancelToken, EvidenceSink};

const STEP_OUTPUT_SCHEMA: &str = include_str!("../../schemas/step_output.schema.json");

/// Exit code reported for a command killed at its deadline, matching `timeout(1)`.
const EXIT_TIMED_OUT: i32 = 124;

/// Everything an executor gets to know about the attempt it runs.
#[derive(Clone)]
pub struct StepContext {
    pub run_id: String,
    pub step_id: String,
    pub attempt: u32,
    /// Directory reserved for this attempt's evidence files.
    pub evidence_dir: PathBuf,
    /// Step deadline (already clamped to the flow deadline).
    pub deadline: Deadline,
    pub unit_limits: ScopeLimits,
    pub cancel: CancelToken,
    pub evidence: EvidenceSink,
    /// Most recent handoff of the run, if any.
    pub last_handoff: Option<Handoff>,
    pub clock: Arc<dyn Clock>,
}

impl StepContext {
    pub fn remaining_ms(&self) -> u64 {
        self.deadline.remaining_ms(self.clock.now())
    }

    /// Deadline for one unit of work inside the step.
    pub fn unit_deadline(&self, requested_ms: Option<u64>) -> Deadline {
        self.deadline
            .child(self.clock.now(), requested_ms, self.unit_limits)
    }

    pub fn is_cancelled(&self) -> bool {
        self.cancel.is_cancelled()
    }
}

/// Executes one attempt of a step.
///
/// Implementations should observe `ctx.cancel` and stop promptly once it
/// fires. An `Err` is recorded as a failed outcome carrying the error chain.
pub trait StepExecutor: Send + Sync {
    fn execute(&self, step: &StepDef, ctx: &StepContext) -> Result<RawOutcome>;
}

/// Context passed to a command on stdin.
#[derive(Debug, Serialize)]
struct CommandInput<'a> {
    run_id: &'a str,
    step_id: &'a str,
    attempt: u32,
    executor: &'a str,
    role: StepRole,
    deadline: String,
    last_handoff: Option<&'a Handoff>,
}

/// Runs the argv configured for the step's executor reference.
///
/// Environment: `STEPFLOW_RUN_ID`, `STEPFLOW_STEP_ID`, `STEPFLOW_ATTEMPT`,
/// `STEPFLOW_OUTPUT` (where a JSON report may be written) and
/// `STEPFLOW_EVIDENCE_DIR`. A report, when present, must match the step
/// output schema; otherwise the outcome derives from the exit status.
pub struct CommandExecutor {
    agents: BTreeMap<String, Vec<String>>,
    output_limit_bytes: usize,
    workdir: Option<PathBuf>,
}

impl CommandExecutor {
    pub fn new(agents: BTreeMap<String, Vec<String>>, output_limit_bytes: usize) -> Self {
        Self {
            agents,
            output_limit_bytes,
            workdir: None,
        }
    }

    pub fn with_workdir(mut self, workdir: impl Into<PathBuf>) -> Self {
        self.workdir = Some(workdir.into());
        self
    }
}

impl StepExecutor for CommandExecutor {
    #[instrument(skip_all, fields(step_id = %step.id, executor = %step.executor, attempt = ctx.attempt))]
    fn execute(&self, step: &StepDef, ctx: &StepContext) -> Result<RawOutcome> {
        let argv = self
            .agents
            .get(&step.executor)
            .with_context(|| format!("no agent command configured for '{}'", step.executor))?;
        let (program, args) = argv
            .split_first()
            .ok_or_else(|| anyhow!("agent command for '{}' is empty", step.executor))?;

        fs::create_dir_all(&ctx.evidence_dir)
            .with_context(|| format!("create evidence dir {}", ctx.evidence_dir.display()))?;
        let output_path = ctx.evidence_dir.join("output.json");
        let log_path = ctx.evidence_dir.join("executor.log");

        let deadline = ctx.unit_deadline(Some(ctx.remaining_ms()));
        let timeout = Duration::from_millis(deadline.remaining_ms(ctx.clock.now()));
        let input = CommandInput {
            run_id: &ctx.run_id,
            step_id: &step.id,
            attempt: ctx.attempt,
            executor: &step.executor,
            role: step.role,
            deadline: deadline.at.to_rfc3339(),
            last_handoff: ctx.last_handoff.as_ref(),
        };
        let stdin = serde_json::to_vec(&input).context("serialize command input")?;

        let mut cmd = Command::new(program);
        cmd.args(args)
            .env("STEPFLOW_RUN_ID", &ctx.run_id)
            .env("STEPFLOW_STEP_ID", &step.id)
            .env("STEPFLOW_ATTEMPT", ctx.attempt.to_string())
            .env("STEPFLOW_OUTPUT", &output_path)
            .env("STEPFLOW_EVIDENCE_DIR", &ctx.evidence_dir);
        if let Some(workdir) = &self.workdir {
            cmd.current_dir(workdir);
        }

        info!(program = %program, timeout_ms = timeout.as_millis() as u64, "starting agent command");
        let output = run_command_with_timeout(
            cmd,
            Some(&stdin),
            timeout,
            self.output_limit_bytes,
            Some(&ctx.cancel),
        )
        .with_context(|| format!("run agent command for '{}'", step.executor))?;

        write_executor_log(&log_path, &output, self.output_limit_bytes)?;
        ctx.evidence.record(&log_path);

        if output.cancelled {
            let mut outcome = RawOutcome::new(StepStatus::Interrupted);
            outcome.message = Some("agent command cancelled".to_string());
            outcome.exit_code = Some(output.exit_code());
            return Ok(outcome);
        }
        if output.timed_out {
            warn!(timeout_ms = timeout.as_millis() as u64, "agent command timed out");
            let mut outcome = RawOutcome::new(StepStatus::Timeout);
            outcome.message = Some(format!("agent command timed out after {timeout:?}"));
            outcome.exit_code = Some(EXIT_TIMED_OUT);
            return Ok(outcome);
        }

        let exit_code = output.exit_code();
        let mut outcome = if output_path.is_file() {
            ctx.evidence.record(&output_path);
            load_step_report(&output_path)?
        } else if exit_code == 0 {
            RawOutcome::succeeded()
        } else {
            RawOutcome::failed(last_line(&output.stderr).unwrap_or_else(|| {
                format!("agent command exited with code {exit_code}")
            }))
        };
        if outcome.exit_code.is_none() {
            outcome.exit_code = Some(exit_code);
        }
        debug!(status = outcome.status.as_str(), exit_code, "agent command finished");
        Ok(outcome)
    }
}

/// Load a step report written by an agent command, validated against the
/// step output schema.
pub fn load_step_report(path: &Path) -> Result<RawOutcome> {
    let contents =
        fs::read_to_string(path).with_context(|| format!("read step report {}", path.display()))?;
    let value: Value = serde_json::from_str(&contents)
        .with_context(|| format!("parse step report {}", path.display()))?;
    validate_step_report(&value).with_context(|| format!("validate {}", path.display()))?;
    serde_json::from_value(value).with_context(|| format!("deserialize {}", path.display()))
}

fn validate_step_report(report: &Value) -> Result<()> {
    let schema: Value =
        serde_json::from_str(STEP_OUTPUT_SCHEMA).context("parse step output schema")?;
    let compiled = validator_for(&schema).map_err(|err| anyhow!("invalid schema: {err}"))?;
    let messages: Vec<String> = compiled
        .iter_errors(report)
        .map(|err| err.to_string())
        .collect();
    if !messages.is_empty() {
        bail!("schema validation failed: {}", messages.join("; "));
    }
    Ok(())
}

fn last_line(bytes: &[u8]) -> Option<String> {
    String::from_utf8_lossy(bytes)
        .lines()
        .rev()
        .map(str::trim)
        .find(|line| !line.is_empty())
        .map(str::to_string)
}

fn write_executor_log(path: &Path, output: &CommandOutput, output_limit: usize) -> Result<()> {
    if let Some(parent) = path.parent() {
        fs::create_dir_all(parent)
            .with_context(|| format!("create executor log dir {}", parent.display()))?;
    }
    let buf = output.render_log("executor");
    if buf.len() > output_limit {
        let mut cut = output_limit;
        while !buf.is_char_boundary(cut) {
            cut -= 1;
        }
        let truncated = format!("{}\n[truncated {} bytes]\n", &buf[..cut], buf.len() - cut);
        return fs::write(path, truncated)
            .with_context(|| format!("write executor log {}", path.display()));
    }
    fs::write(path, buf).with_context(|| format!("write executor log {}", path.display()))
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn valid_report_parses_into_outcome() {
        let report = json!({
            "status": "succeeded",
            "message": "reviewed",
            "review": {"verified": false, "can_further_iteration_help": true},
            "concerns": [{"severity": "high", "description": "missing tests"}],
        });
        validate_step_report(&report).expect("valid");
        let outcome: RawOutcome = serde_json::from_value(report).expect("parse");
        assert_eq!(outcome.concerns.len(), 1);
        assert_eq!(outcome.review.map(|r| r.verified), Some(false));
    }

    #[test]
    fn report_with_unknown_status_is_rejected() {
        let report = json!({"status": "done"});
        let err = validate_step_report(&report).expect_err("invalid");
        assert!(err.to_string().contains("schema validation failed"));
    }

    #[test]
    fn last_line_skips_blank_lines() {
        assert_eq!(last_line(b"first\nsecond\n\n"), Some("second".to_string()));
        assert_eq!(last_line(b""), None);
    }
}
