//! Public entry point: create, drive, inspect and cancel runs.

use std::fmt;
use std::fs;
use std::io::ErrorKind as IoErrorKind;
use std::sync::Arc;

use anyhow::{Context, Result, bail};
use chrono::{DateTime, Utc};
use rand::Rng;
use rand::distributions::Alphanumeric;
use serde::Serialize;
use serde_json::json;
use tracing::{info, warn};

use crate::core::deadline::clamp_ms;
use crate::core::progress::RunRecord;
use crate::core::types::{RunStatus, StepStatus};
use crate::flow::{Flow, validate_flow, validate_id};
use crate::io::checkpoint::CheckpointStore;
use crate::io::clock::{Clock, SystemClock};
use crate::io::config::KernelConfig;
use crate::io::events::EventLog;
use crate::io::executor::{CommandExecutor, StepExecutor};
use crate::io::run_state::{freeze_flow, load_frozen_flow, load_run_record, write_run_record};
use crate::io::summary::write_summary;
use crate::runner::{FlowRunner, RunOutcome, reconcile};

/// How many times run id allocation retries after a collision.
const RUN_ID_ATTEMPTS: usize = 8;

/// No run record exists for `run_id`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RunNotFoundError {
    pub run_id: String,
}

impl fmt::Display for RunNotFoundError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "run not found: {}", self.run_id)
    }
}

impl std::error::Error for RunNotFoundError {}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum PlanAction {
    Skip,
    Run,
}

impl PlanAction {
    pub fn as_str(self) -> &'static str {
        match self {
            PlanAction::Skip => "SKIP",
            PlanAction::Run => "RUN",
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct PlanEntry {
    pub step_id: String,
    pub action: PlanAction,
    pub reason: String,
}

/// What a resume would do, step by step, without executing anything.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct ResumePlan {
    pub run_id: String,
    pub status: RunStatus,
    pub entries: Vec<PlanEntry>,
}

pub struct Kernel {
    config: KernelConfig,
    store: CheckpointStore,
    executor: Arc<dyn StepExecutor>,
    clock: Arc<dyn Clock>,
}

impl Kernel {
    pub fn new(config: KernelConfig, executor: Arc<dyn StepExecutor>, clock: Arc<dyn Clock>) -> Self {
        let store = CheckpointStore::new(&config.runs_dir);
        Self {
            config,
            store,
            executor,
            clock,
        }
    }

    /// Kernel with the command executor and the wall clock.
    pub fn from_config(config: KernelConfig) -> Self {
        let executor = CommandExecutor::new(config.agents.clone(), config.output_limit_bytes);
        Self::new(config, Arc::new(executor), Arc::new(SystemClock))
    }

    pub fn config(&self) -> &KernelConfig {
        &self.config
    }

    pub fn store(&self) -> &CheckpointStore {
        &self.store
    }

    /// Validate and freeze `flow` into a new pending run.
    pub fn create_run(&self, flow: &Flow) -> Result<String> {
        let errors = validate_flow(flow);
        if !errors.is_empty() {
            bail!("invalid flow '{}':\n  {}", flow.id, errors.join("\n  "));
        }

        let now = self.clock.now();
        let run_id = self.allocate_run_id(now)?;
        let paths = self.store.paths(&run_id);
        freeze_flow(&paths, flow)?;

        let budget = clamp_ms(flow.deadline_ms, self.config.timeouts.flow, None);
        let record = RunRecord::new(&run_id, flow, budget, now);
        write_run_record(&paths.record_path, &record)?;
        EventLog::new(&paths.events_path, &run_id).append(
            now,
            "run_created",
            json!({"flow_id": flow.id, "flow_budget_ms": budget, "steps": flow.steps.len()}),
        )?;
        info!(run_id = %run_id, flow_id = %flow.id, flow_budget_ms = budget, "run created");
        Ok(run_id)
    }

    /// Create a run and drive it to completion on the calling thread.
    pub fn start_run(&self, flow: &Flow) -> Result<RunOutcome> {
        let run_id = self.create_run(flow)?;
        self.runner().drive(&run_id)
    }

    /// Continue a run from its last checkpoint. Terminal runs are returned as
    /// they are.
    pub fn resume_run(&self, run_id: &str) -> Result<RunOutcome> {
        self.ensure_exists(run_id)?;
        self.runner().drive(run_id)
    }

    pub fn run_status(&self, run_id: &str) -> Result<RunStatus> {
        Ok(self.run_record(run_id)?.status)
    }

    pub fn run_record(&self, run_id: &str) -> Result<RunRecord> {
        self.ensure_exists(run_id)?;
        load_run_record(&self.store.paths(run_id).record_path)
    }

    /// Request cancellation. The driving thread stops at its next check and
    /// leaves the run `interrupted`. A run nobody drives yet is interrupted
    /// immediately. Terminal runs are unaffected.
    pub fn cancel_run(&self, run_id: &str) -> Result<RunStatus> {
        let mut record = self.run_record(run_id)?;
        if record.status.is_terminal() {
            return Ok(record.status);
        }
        let paths = self.store.paths(run_id);
        let now = self.clock.now();
        fs::write(&paths.cancel_path, now.to_rfc3339().as_bytes())
            .with_context(|| format!("write cancel marker {}", paths.cancel_path.display()))?;
        let events = EventLog::new(&paths.events_path, run_id);
        events.append(now, "cancel_requested", json!({"status": record.status}))?;
        info!(run_id, status = %record.status, "cancel requested");

        if record.status == RunStatus::Pending {
            record.finish(RunStatus::Interrupted, "cancel requested", None, now);
            write_run_record(&paths.record_path, &record)?;
            write_summary(&paths, &load_frozen_flow(&paths)?, &record)?;
            events.append(now, "run_interrupted", json!({"status": record.status}))?;
        }
        Ok(record.status)
    }

    /// Most recently updated runs first.
    pub fn list_runs(&self, limit: usize) -> Result<Vec<RunRecord>> {
        let mut records = Vec::new();
        for run_id in self.store.run_ids()? {
            let path = self.store.paths(&run_id).record_path;
            match load_run_record(&path) {
                Ok(record) => records.push(record),
                Err(err) => warn!(run_id, err = %format!("{err:#}"), "skipping unreadable run"),
            }
        }
        records.sort_by(|a, b| {
            b.updated_at
                .cmp(&a.updated_at)
                .then_with(|| b.run_id.cmp(&a.run_id))
        });
        records.truncate(limit);
        Ok(records)
    }

    /// Plan a resume from the reconciled checkpoint state without running
    /// anything or writing to disk.
    pub fn resume_plan(&self, run_id: &str) -> Result<ResumePlan> {
        let mut record = self.run_record(run_id)?;
        let paths = self.store.paths(run_id);
        let flow = load_frozen_flow(&paths)?;
        if !record.status.is_terminal() {
            reconcile(&self.store, &flow, &mut record, &self.config.breaker, self.clock.now())?;
        }
        Ok(ResumePlan {
            run_id: run_id.to_string(),
            status: record.status,
            entries: plan_entries(&flow, &record),
        })
    }

    fn runner(&self) -> FlowRunner<'_> {
        FlowRunner::new(
            &self.store,
            &self.config,
            self.executor.clone(),
            self.clock.clone(),
        )
    }

    fn ensure_exists(&self, run_id: &str) -> Result<()> {
        validate_id("run id", run_id)?;
        if !self.store.paths(run_id).record_path.is_file() {
            return Err(RunNotFoundError {
                run_id: run_id.to_string(),
            }
            .into());
        }
        Ok(())
    }

    /// Reserve a fresh run directory. `create_dir` fails on collision, so two
    /// kernels never share a run id.
    fn allocate_run_id(&self, now: DateTime<Utc>) -> Result<String> {
        let runs_dir = self.store.runs_dir();
        fs::create_dir_all(runs_dir)
            .with_context(|| format!("create runs dir {}", runs_dir.display()))?;
        for _ in 0..RUN_ID_ATTEMPTS {
            let run_id = generate_run_id(now);
            let dir = self.store.paths(&run_id).dir;
            match fs::create_dir(&dir) {
                Ok(()) => return Ok(run_id),
                Err(err) if err.kind() == IoErrorKind::AlreadyExists => continue,
                Err(err) => {
                    return Err(err).with_context(|| format!("create run dir {}", dir.display()));
                }
            }
        }
        bail!("could not allocate a unique run id in {}", runs_dir.display())
    }
}

/// `run-YYYYMMDD-HHMMSS-xxxxxx`
pub fn generate_run_id(now: DateTime<Utc>) -> String {
    let suffix: String = rand::thread_rng()
        .sample_iter(&Alphanumeric)
        .take(6)
        .map(|byte| char::from(byte).to_ascii_lowercase())
        .collect();
    format!("run-{}-{suffix}", now.format("%Y%m%d-%H%M%S"))
}

fn plan_entries(flow: &Flow, record: &RunRecord) -> Vec<PlanEntry> {
    flow.steps
        .iter()
        .enumerate()
        .map(|(idx, step)| {
            let progress = record.progress(&step.id);
            let (action, reason) = if record.status.is_terminal() {
                (PlanAction::Skip, format!("run is {}", record.status))
            } else if idx == record.position {
                let reason = match progress.last_status {
                    Some(status) => format!(
                        "next attempt {} (last attempt {})",
                        progress.attempts + 1,
                        status.as_str()
                    ),
                    None if progress.attempts > 0 => format!(
                        "attempt {} has no handoff; retrying as attempt {}",
                        progress.attempts,
                        progress.attempts + 1
                    ),
                    None => "not started".to_string(),
                };
                (PlanAction::Run, reason)
            } else if step.detour_only {
                (PlanAction::Skip, "detour only".to_string())
            } else if idx < record.position {
                match progress.last_status {
                    Some(StepStatus::Succeeded) => (
                        PlanAction::Skip,
                        format!("succeeded in attempt {}", progress.attempts),
                    ),
                    _ => (PlanAction::Skip, "behind run position".to_string()),
                }
            } else {
                (PlanAction::Run, "pending".to_string())
            };
            PlanEntry {
                step_id: step.id.clone(),
                action,
                reason,
            }
        })
        .collect()
}
