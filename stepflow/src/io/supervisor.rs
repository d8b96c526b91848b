//! Runtime enforcement of step and flow deadlines.
//!
//! The executor runs on a worker thread and reports through a channel. The
//! supervising thread polls the channel, the clock and the run's cancel
//! marker. On a breach it fires the attempt's [`CancelToken`], waits a grace
//! period for partial output, and synthesizes a `timeout` or `interrupted`
//! outcome carrying whatever evidence was flushed so far.

use std::fs;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::mpsc::{self, RecvTimeoutError};
use std::sync::{Arc, Mutex, MutexGuard};
use std::thread;
use std::time::Duration;

use anyhow::{Context, Result};
use tracing::{debug, info, instrument, warn};

use crate::core::deadline::{Deadline, elapsed_ms};
use crate::core::types::{RawOutcome, StepStatus};
use crate::flow::StepDef;
use crate::io::clock::Clock;
use crate::io::executor::{StepContext, StepExecutor};

const POLL_INTERVAL: Duration = Duration::from_millis(20);

/// Cooperative cancellation flag shared with an executor.
#[derive(Debug, Clone, Default)]
pub struct CancelToken(Arc<AtomicBool>);

impl CancelToken {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn cancel(&self) {
        self.0.store(true, Ordering::SeqCst);
    }

    pub fn is_cancelled(&self) -> bool {
        self.0.load(Ordering::SeqCst)
    }
}

/// Collects evidence files an executor writes during an attempt, so they
/// survive even when the attempt is cut short.
#[derive(Debug, Clone)]
pub struct EvidenceSink {
    dir: PathBuf,
    written: Arc<Mutex<Vec<String>>>,
}

impl EvidenceSink {
    pub fn new(dir: impl Into<PathBuf>) -> Self {
        Self {
            dir: dir.into(),
            written: Arc::new(Mutex::new(Vec::new())),
        }
    }

    pub fn dir(&self) -> &Path {
        &self.dir
    }

    /// Write one evidence file and record it.
    pub fn write(&self, name: &str, contents: &[u8]) -> Result<PathBuf> {
        fs::create_dir_all(&self.dir)
            .with_context(|| format!("create evidence dir {}", self.dir.display()))?;
        let path = self.dir.join(name);
        fs::write(&path, contents).with_context(|| format!("write evidence {}", path.display()))?;
        self.record(&path);
        Ok(path)
    }

    /// Record a file the executor wrote by other means.
    pub fn record(&self, path: &Path) {
        let entry = path.display().to_string();
        let mut written = self.lock();
        if !written.contains(&entry) {
            written.push(entry);
        }
    }

    pub fn paths(&self) -> Vec<String> {
        self.lock().clone()
    }

    fn lock(&self) -> MutexGuard<'_, Vec<String>> {
        self.written
            .lock()
            .unwrap_or_else(std::sync::PoisonError::into_inner)
    }
}

/// Why an attempt was cut short.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Interruption {
    StepDeadline,
    FlowDeadline,
    Cancelled,
}

/// Final outcome of a supervised attempt.
#[derive(Debug, Clone)]
pub struct AttemptReport {
    pub outcome: RawOutcome,
    pub interruption: Option<Interruption>,
}

pub struct Supervisor {
    clock: Arc<dyn Clock>,
    grace: Duration,
}

impl Supervisor {
    pub fn new(clock: Arc<dyn Clock>, grace: Duration) -> Self {
        Self { clock, grace }
    }

    /// Run one attempt under the step deadline in `ctx`, the flow deadline
    /// and the cancel marker.
    #[instrument(skip_all, fields(step_id = %step.id, attempt = ctx.attempt))]
    pub fn run_attempt(
        &self,
        executor: Arc<dyn StepExecutor>,
        step: &StepDef,
        ctx: &StepContext,
        flow_deadline: Deadline,
        cancel_marker: &Path,
    ) -> Result<AttemptReport> {
        let started = self.clock.now();
        let (tx, rx) = mpsc::channel();
        {
            let step = step.clone();
            let ctx = ctx.clone();
            thread::Builder::new()
                .name(format!("step-{}", step.id))
                .spawn(move || {
                    let result = executor.execute(&step, &ctx);
                    // The supervisor may have given up on this attempt already.
                    let _ = tx.send(result);
                })
                .context("spawn executor thread")?;
        }

        loop {
            let received = rx.recv_timeout(POLL_INTERVAL);
            let now = self.clock.now();
            let breach = if cancel_marker.exists() {
                Some(Interruption::Cancelled)
            } else if flow_deadline.is_expired(now) {
                Some(Interruption::FlowDeadline)
            } else if ctx.deadline.is_expired(now) {
                Some(Interruption::StepDeadline)
            } else {
                None
            };

            match received {
                Ok(result) => {
                    let mut outcome = settle(result);
                    if let Some(breach) = breach.filter(|b| *b != Interruption::Cancelled) {
                        // Finished, but only after the deadline had passed.
                        warn!(?breach, "attempt finished past its deadline");
                        return Ok(self.interrupted(breach, started, ctx, Some(outcome)));
                    }
                    outcome.duration_ms = elapsed_ms(started, now);
                    outcome.evidence = merge_evidence(ctx.evidence.paths(), outcome.evidence);
                    debug!(status = outcome.status.as_str(), "attempt completed");
                    return Ok(AttemptReport {
                        outcome,
                        interruption: None,
                    });
                }
                Err(RecvTimeoutError::Disconnected) => {
                    let mut outcome = RawOutcome::failed("executor thread exited without an outcome");
                    outcome.duration_ms = elapsed_ms(started, now);
                    outcome.evidence = ctx.evidence.paths();
                    return Ok(AttemptReport {
                        outcome,
                        interruption: None,
                    });
                }
                Err(RecvTimeoutError::Timeout) => {}
            }

            if let Some(breach) = breach {
                warn!(?breach, "cancelling in-flight attempt");
                ctx.cancel.cancel();
                let partial = match rx.recv_timeout(self.grace) {
                    Ok(result) => Some(settle(result)),
                    Err(_) => {
                        info!(grace_ms = self.grace.as_millis() as u64, "executor did not stop within grace period");
                        None
                    }
                };
                return Ok(self.interrupted(breach, started, ctx, partial));
            }
        }
    }

    fn interrupted(
        &self,
        breach: Interruption,
        started: chrono::DateTime<chrono::Utc>,
        ctx: &StepContext,
        partial: Option<RawOutcome>,
    ) -> AttemptReport {
        let (status, message) = match breach {
            Interruption::StepDeadline => (StepStatus::Timeout, "step deadline exceeded"),
            Interruption::FlowDeadline => (StepStatus::Timeout, "flow deadline exceeded"),
            Interruption::Cancelled => (StepStatus::Interrupted, "cancel requested"),
        };
        let mut outcome = RawOutcome::new(status);
        outcome.message = Some(message.to_string());
        outcome.duration_ms = elapsed_ms(started, self.clock.now());
        let partial_evidence = partial.map(|p| p.evidence).unwrap_or_default();
        outcome.evidence = merge_evidence(ctx.evidence.paths(), partial_evidence);
        AttemptReport {
            outcome,
            interruption: Some(breach),
        }
    }
}

/// An executor `Err` becomes a failed outcome carrying the error chain.
fn settle(result: Result<RawOutcome>) -> RawOutcome {
    match result {
        Ok(outcome) => outcome,
        Err(err) => RawOutcome::failed(format!("{err:#}")),
    }
}

fn merge_evidence(mut sink: Vec<String>, reported: Vec<String>) -> Vec<String> {
    for entry in reported {
        if !sink.contains(&entry) {
            sink.push(entry);
        }
    }
    sink
}
