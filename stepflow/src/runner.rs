//! Drives one run from its recorded position to a terminal or interrupted
//! state.
//!
//! Per attempt: check the cancel marker, the flow deadline and the breaker /
//! backoff gates; allocate an attempt number; execute under the supervisor;
//! persist the receipt; classify; update the breaker; route; persist the
//! handoff; apply the transition and persist the run record. Nothing moves the
//! run position before the handoff that justifies it is on disk.

use std::fs;
use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use chrono::{DateTime, Utc};
use serde::Serialize;
use serde_json::{Value, json};
use tracing::{debug, info, instrument, warn};

use crate::core::breaker::{BreakerPhase, BreakerPolicy, BreakerTransition};
use crate::core::classifier::classify;
use crate::core::deadline::{Deadline, elapsed_ms};
use crate::core::microloop::{MicroloopState, evaluate};
use crate::core::progress::{FLOW_DEADLINE_EXCEEDED, RunRecord, TerminalSummary, apply_handoff};
use crate::core::router::{RouteInput, decide};
use crate::core::signature::FailureSignature;
use crate::core::types::{
    Concern, ErrorClassification, Handoff, Receipt, Review, Routing, RoutingDecision, RunStatus,
    StepStatus,
};
use crate::flow::{Flow, StepDef};
use crate::io::checkpoint::{CheckpointStore, RunPaths};
use crate::io::clock::Clock;
use crate::io::config::KernelConfig;
use crate::io::events::EventLog;
use crate::io::executor::{StepContext, StepExecutor};
use crate::io::run_state::{load_frozen_flow, load_run_record, write_run_record};
use crate::io::summary::write_summary;
use crate::io::supervisor::{CancelToken, EvidenceSink, Interruption, Supervisor};

/// Longest single sleep while waiting on a gate, so cancel requests are
/// noticed.
const MAX_WAIT_SLICE: Duration = Duration::from_secs(1);

/// Result of driving a run.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct RunOutcome {
    pub run_id: String,
    pub status: RunStatus,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub summary: Option<TerminalSummary>,
}

impl RunOutcome {
    fn from_record(record: &RunRecord) -> Self {
        Self {
            run_id: record.run_id.clone(),
            status: record.status,
            summary: record.summary.clone(),
        }
    }
}

pub struct FlowRunner<'a> {
    store: &'a CheckpointStore,
    config: &'a KernelConfig,
    executor: Arc<dyn StepExecutor>,
    clock: Arc<dyn Clock>,
}

/// How a gate wait ended.
enum WaitEnd {
    Reached,
    Cancelled,
    FlowDeadline,
}

/// Per-session bookkeeping while driving a run.
struct Session {
    paths: RunPaths,
    flow: Flow,
    events: EventLog,
    started: DateTime<Utc>,
    base_active_ms: u64,
    flow_deadline: Deadline,
    last_handoff: Option<Handoff>,
}

impl<'a> FlowRunner<'a> {
    pub fn new(
        store: &'a CheckpointStore,
        config: &'a KernelConfig,
        executor: Arc<dyn StepExecutor>,
        clock: Arc<dyn Clock>,
    ) -> Self {
        Self {
            store,
            config,
            executor,
            clock,
        }
    }

    /// Drive a run until it reaches a terminal state or is interrupted.
    ///
    /// A pending cancel marker is cleared first: driving a run is how it is
    /// resumed. Terminal runs are returned untouched.
    #[instrument(skip(self))]
    pub fn drive(&self, run_id: &str) -> Result<RunOutcome> {
        let paths = self.store.paths(run_id);
        let flow = load_frozen_flow(&paths)?;
        let mut record = load_run_record(&paths.record_path)?;
        if record.status.is_terminal() {
            debug!(status = %record.status, "run already terminal");
            return Ok(RunOutcome::from_record(&record));
        }

        let events = EventLog::new(&paths.events_path, run_id);
        if paths.cancel_path.exists() {
            fs::remove_file(&paths.cancel_path)
                .with_context(|| format!("clear cancel marker {}", paths.cancel_path.display()))?;
            events.append(self.clock.now(), "cancel_cleared", Value::Null)?;
        }

        let now = self.clock.now();
        let reconciled = reconcile(self.store, &flow, &mut record, &self.config.breaker, now)?;
        for transition in &reconciled.transitions {
            log_breaker(&events, transition)?;
        }
        for handoff in &reconciled.handoffs {
            events.append(
                now,
                "handoff_replayed",
                json!({"step_id": handoff.step_id, "attempt": handoff.attempt, "seq": handoff.seq}),
            )?;
        }
        if record.status.is_terminal() {
            // The last handoff finished the run but the record never saw it.
            write_run_record(&paths.record_path, &record)?;
            write_summary(&paths, &flow, &record)?;
            events.append(
                now,
                "run_finished",
                json!({"status": record.status, "summary": record.summary}),
            )?;
            return Ok(RunOutcome::from_record(&record));
        }
        let last_handoff = self
            .store
            .latest_checkpoint(run_id)?
            .map(|checkpoint| checkpoint.handoff);

        let resumed = record.started_at.is_some();
        record.status = RunStatus::Running;
        record.started_at.get_or_insert(now);
        record.completed_at = None;
        record.summary = None;
        record.updated_at = now;
        write_run_record(&paths.record_path, &record)?;
        events.append(
            now,
            if resumed { "run_resumed" } else { "run_started" },
            json!({"position": record.position, "active_ms": record.active_ms}),
        )?;
        info!(run_id, position = record.position, resumed, "driving run");

        let mut session = Session {
            flow_deadline: Deadline::after(now, record.remaining_budget_ms()),
            paths,
            flow,
            events,
            started: now,
            base_active_ms: record.active_ms,
            last_handoff,
        };

        while record.status == RunStatus::Running {
            self.step_once(&mut session, &mut record)?;
        }

        write_summary(&session.paths, &session.flow, &record)?;
        info!(run_id, status = %record.status, "run stopped");
        Ok(RunOutcome::from_record(&record))
    }

    /// One pass of the drive loop: either wait on a gate or run one attempt.
    fn step_once(&self, session: &mut Session, record: &mut RunRecord) -> Result<()> {
        let now = self.clock.now();
        if session.paths.cancel_path.exists() {
            return self.stop(session, record, RunStatus::Interrupted, "cancel requested", None);
        }
        if session.flow_deadline.is_expired(now) {
            warn!(run_id = %record.run_id, "flow deadline exceeded between steps");
            return self.stop(session, record, RunStatus::Timeout, FLOW_DEADLINE_EXCEEDED, None);
        }
        let Some(step) = session.flow.steps.get(record.position).cloned() else {
            return self.stop(session, record, RunStatus::Succeeded, "all steps succeeded", None);
        };

        if let Some(transition) = record.breaker.poll(now) {
            log_breaker(&session.events, &transition)?;
        }
        if record.breaker.phase == BreakerPhase::Open {
            let until = record.breaker.cooldown_until.unwrap_or(now);
            return self.wait_gate(session, record, until);
        }
        if let Some(not_before) = record.not_before.filter(|at| *at > now) {
            return self.wait_gate(session, record, not_before);
        }

        self.run_attempt(session, record, &step)
    }

    fn run_attempt(&self, session: &mut Session, record: &mut RunRecord, step: &StepDef) -> Result<()> {
        let run_id = record.run_id.clone();
        let on_disk = self.store.max_attempt(&run_id, &step.id)?;
        let attempt = record.progress(&step.id).attempts.max(on_disk) + 1;
        record.progress_mut(&step.id).attempts = attempt;
        record.seq += 1;
        let seq = record.seq;
        record.not_before = None;
        self.sync_active(session, record);
        write_run_record(&session.paths.record_path, record)?;

        let evidence_dir = session.paths.evidence_dir(&step.id, attempt);
        fs::create_dir_all(&evidence_dir)
            .with_context(|| format!("create evidence dir {}", evidence_dir.display()))?;

        let started_at = self.clock.now();
        let deadline = session
            .flow_deadline
            .child(started_at, step.deadline_ms, self.config.timeouts.step);
        session.events.append(
            started_at,
            "step_started",
            json!({"step_id": step.id, "attempt": attempt, "seq": seq, "deadline": deadline.at}),
        )?;
        info!(run_id = %run_id, step_id = %step.id, attempt, "step started");

        let ctx = StepContext {
            run_id: run_id.clone(),
            step_id: step.id.clone(),
            attempt,
            evidence: EvidenceSink::new(&evidence_dir),
            evidence_dir,
            deadline,
            unit_limits: self.config.timeouts.unit,
            cancel: CancelToken::new(),
            last_handoff: session.last_handoff.clone(),
            clock: self.clock.clone(),
        };
        let supervisor = Supervisor::new(
            self.clock.clone(),
            Duration::from_millis(self.config.timeouts.cancel_grace_ms),
        );
        let report = supervisor.run_attempt(
            self.executor.clone(),
            step,
            &ctx,
            session.flow_deadline,
            &session.paths.cancel_path,
        )?;
        let outcome = report.outcome;

        let finished_at = self.clock.now();
        let receipt = Receipt {
            run_id: run_id.clone(),
            step_id: step.id.clone(),
            executor: step.executor.clone(),
            attempt,
            seq,
            status: outcome.status,
            exit_code: outcome.exit_code,
            error: outcome.error.clone(),
            message: outcome.message.clone(),
            started_at,
            finished_at,
            duration_ms: outcome.duration_ms,
            evidence: outcome.evidence.clone(),
        };
        let receipt_path = self.store.put_receipt(&run_id, &step.id, attempt, &receipt)?;
        session.events.append(
            finished_at,
            "receipt_written",
            json!({
                "step_id": step.id,
                "attempt": attempt,
                "status": receipt.status,
                "path": receipt_path.display().to_string(),
            }),
        )?;
        self.sync_active(session, record);

        if report.interruption == Some(Interruption::Cancelled) {
            // No handoff and no breaker update: resume retries this step under
            // a fresh attempt.
            record.breaker_seq = record.breaker_seq.max(seq);
            return self.stop(
                session,
                record,
                RunStatus::Interrupted,
                "cancel requested",
                Some((step.id.as_str(), attempt)),
            );
        }

        let previous = self
            .store
            .receipts(&run_id, &step.id)?
            .into_iter()
            .rev()
            .find(|earlier| earlier.attempt < attempt);
        let classification = classify(&receipt, previous.as_ref());
        if let Some(c) = &classification {
            debug!(kind = c.kind.as_str(), confidence = c.confidence, signal = %c.signal, "classified failure");
        }

        if let Some(transition) = record.account_receipt(&receipt, &self.config.breaker) {
            log_breaker(&session.events, &transition)?;
        }
        // Routing may wait out a cool-down; the breaker must be on disk first.
        write_run_record(&session.paths.record_path, record)?;

        let review = outcome.review;
        let decision = if report.interruption == Some(Interruption::FlowDeadline) {
            warn!(run_id = %run_id, step_id = %step.id, "flow deadline exceeded during step");
            RoutingDecision::Halt {
                reason: FLOW_DEADLINE_EXCEEDED.to_string(),
                timeout: true,
            }
        } else {
            let routed = self.route(
                session,
                record,
                step,
                &receipt,
                classification.as_ref(),
                review.as_ref(),
                &outcome.concerns,
            )?;
            match routed {
                Some(decision) => decision,
                None => {
                    // Cancelled while waiting out an open breaker.
                    return self.stop(
                        session,
                        record,
                        RunStatus::Interrupted,
                        "cancel requested",
                        Some((step.id.as_str(), attempt)),
                    );
                }
            }
        };

        let written_at = self.clock.now();
        let handoff = Handoff {
            run_id: run_id.clone(),
            step_id: step.id.clone(),
            attempt,
            seq,
            status: receipt.status,
            error_kind: classification.as_ref().map(|c| c.kind),
            concerns: outcome.concerns,
            routing: Routing {
                reason: routing_reason(&decision, classification.as_ref()),
                can_further_iteration_help: review.map_or_else(
                    || !matches!(decision, RoutingDecision::Escalate { .. } | RoutingDecision::Halt { .. }),
                    |r| r.can_further_iteration_help,
                ),
                recommendation: decision,
            },
            assumptions: outcome.assumptions,
            verified: review.map(|r| r.verified),
            written_at,
        };
        let handoff_path = self.store.put_handoff(&run_id, &step.id, &handoff)?;
        session.events.append(
            written_at,
            "handoff_written",
            json!({
                "step_id": step.id,
                "attempt": attempt,
                "action": handoff.routing.recommendation.label(),
                "reason": handoff.routing.reason,
                "path": handoff_path.display().to_string(),
            }),
        )?;
        info!(
            run_id = %run_id,
            step_id = %step.id,
            attempt,
            status = receipt.status.as_str(),
            action = handoff.routing.recommendation.label(),
            "step routed"
        );

        apply_handoff(record, &session.flow, &handoff, written_at)?;
        self.sync_active(session, record);
        write_run_record(&session.paths.record_path, record)?;
        session.last_handoff = Some(handoff);

        if record.status != RunStatus::Running {
            match record.status {
                RunStatus::Escalated | RunStatus::Failed | RunStatus::Timeout => {
                    warn!(run_id = %run_id, status = %record.status, "run stopped without success");
                }
                _ => {}
            }
            session.events.append(
                written_at,
                "run_finished",
                json!({"status": record.status, "summary": record.summary}),
            )?;
        }
        Ok(())
    }

    /// Ask the router, waiting out an open breaker. `None` means the run was
    /// cancelled while waiting.
    #[allow(clippy::too_many_arguments)]
    fn route(
        &self,
        session: &Session,
        record: &mut RunRecord,
        step: &StepDef,
        receipt: &Receipt,
        classification: Option<&ErrorClassification>,
        review: Option<&Review>,
        concerns: &[Concern],
    ) -> Result<Option<RoutingDecision>> {
        let policy = self.config.retry.for_step(step);
        let reviewed = step.loop_with.is_some() && receipt.succeeded() && review.is_some();
        let signature = if !receipt.succeeded() {
            FailureSignature::from_receipt(receipt)
        } else if reviewed {
            Some(FailureSignature::from_concerns(concerns))
        } else {
            None
        };
        let microloop = match (&step.loop_with, review, &signature) {
            (Some(producer), Some(review), Some(signature)) if reviewed && !review.verified => {
                let state = MicroloopState::next_pass(
                    record.microloop.as_ref(),
                    producer,
                    &step.id,
                    signature,
                );
                let limit = self
                    .config
                    .microloop
                    .limit_for(step, session.flow.step(producer));
                debug!(iterations = state.iterations, limit, repeated = state.repeated, "microloop pass");
                Some(evaluate(&state, review, limit))
            }
            _ => None,
        };

        loop {
            let progress = record.progress(&step.id);
            let input = RouteInput {
                flow: &session.flow,
                step,
                receipt,
                classification,
                signature: signature.as_ref(),
                breaker: &record.breaker,
                progress: &progress,
                policy: &policy,
                review,
                microloop,
            };
            if let Some(decision) = decide(&input) {
                return Ok(Some(decision));
            }

            let now = self.clock.now();
            let until = record.breaker.cooldown_until.unwrap_or(now);
            session.events.append(
                now,
                "decision_deferred",
                json!({"step_id": step.id, "until": until}),
            )?;
            match self.wait_until(session, until) {
                WaitEnd::Reached => {}
                WaitEnd::Cancelled => return Ok(None),
                WaitEnd::FlowDeadline => {
                    return Ok(Some(RoutingDecision::Halt {
                        reason: FLOW_DEADLINE_EXCEEDED.to_string(),
                        timeout: true,
                    }));
                }
            }
            if let Some(transition) = record.breaker.poll(self.clock.now()) {
                log_breaker(&session.events, &transition)?;
            }
        }
    }

    /// Wait for a gate; the caller re-evaluates on the next pass.
    fn wait_gate(&self, session: &Session, record: &mut RunRecord, until: DateTime<Utc>) -> Result<()> {
        debug!(until = %until, "waiting on gate");
        match self.wait_until(session, until) {
            WaitEnd::Reached => {
                self.sync_active(session, record);
                Ok(())
            }
            WaitEnd::Cancelled => {
                self.stop(session, record, RunStatus::Interrupted, "cancel requested", None)
            }
            WaitEnd::FlowDeadline => {
                self.stop(session, record, RunStatus::Timeout, FLOW_DEADLINE_EXCEEDED, None)
            }
        }
    }

    fn wait_until(&self, session: &Session, until: DateTime<Utc>) -> WaitEnd {
        loop {
            let now = self.clock.now();
            if session.paths.cancel_path.exists() {
                return WaitEnd::Cancelled;
            }
            if session.flow_deadline.is_expired(now) {
                return WaitEnd::FlowDeadline;
            }
            if now >= until {
                return WaitEnd::Reached;
            }
            let target = until.min(session.flow_deadline.at);
            let remaining = Duration::from_millis(elapsed_ms(now, target).max(1));
            self.clock.sleep(remaining.min(MAX_WAIT_SLICE));
        }
    }

    /// Stop driving with a status that was not reached through a handoff.
    fn stop(
        &self,
        session: &Session,
        record: &mut RunRecord,
        status: RunStatus,
        reason: &str,
        step: Option<(&str, u32)>,
    ) -> Result<()> {
        let now = self.clock.now();
        self.sync_active(session, record);
        record.finish(status, reason, step, now);
        write_run_record(&session.paths.record_path, record)?;
        let kind = if status == RunStatus::Interrupted {
            "run_interrupted"
        } else {
            "run_finished"
        };
        session.events.append(now, kind, json!({"status": status, "summary": record.summary}))?;
        if status == RunStatus::Timeout {
            warn!(run_id = %record.run_id, "flow deadline exceeded");
        } else {
            info!(run_id = %record.run_id, status = %status, reason, "run stopped");
        }
        Ok(())
    }

    fn sync_active(&self, session: &Session, record: &mut RunRecord) {
        record.active_ms = session.base_active_ms + elapsed_ms(session.started, self.clock.now());
    }
}

fn log_breaker(events: &EventLog, transition: &BreakerTransition) -> Result<()> {
    match transition.to {
        BreakerPhase::Open | BreakerPhase::Escalate => warn!(
            from = transition.from.as_str(),
            to = transition.to.as_str(),
            reason = transition.reason,
            "circuit breaker transition"
        ),
        BreakerPhase::Closed | BreakerPhase::HalfOpen => info!(
            from = transition.from.as_str(),
            to = transition.to.as_str(),
            reason = transition.reason,
            "circuit breaker transition"
        ),
    }
    events.append(transition.at, "breaker_transition", serde_json::to_value(transition)?)
}

/// What [`reconcile`] changed in a record.
#[derive(Debug, Default)]
pub struct Reconciled {
    /// Handoffs applied, in sequence order.
    pub handoffs: Vec<Handoff>,
    pub transitions: Vec<BreakerTransition>,
}

/// Bring a loaded record up to date with the checkpoint store.
///
/// Receipts the breaker has not seen are fed to it and handoffs persisted
/// after the record are applied, both in sequence order. A failed attempt
/// without a handoff still counts against the breaker; only a cancelled one
/// (interrupted, no handoff) does not. Attempts with a receipt but no handoff
/// keep their attempt numbers reserved so the step is retried under a fresh
/// one.
pub fn reconcile(
    store: &CheckpointStore,
    flow: &Flow,
    record: &mut RunRecord,
    breaker: &BreakerPolicy,
    now: DateTime<Utc>,
) -> Result<Reconciled> {
    let mut reconciled = Reconciled::default();
    for attempt in store.attempts(&record.run_id)? {
        let receipt = &attempt.receipt;
        record.seq = record.seq.max(receipt.seq);
        {
            let progress = record.progress_mut(&attempt.step_id);
            progress.attempts = progress.attempts.max(attempt.attempt);
        }
        let cancelled = attempt.handoff.is_none() && receipt.status == StepStatus::Interrupted;
        if cancelled {
            record.breaker_seq = record.breaker_seq.max(receipt.seq);
        } else if let Some(transition) = record.account_receipt(receipt, breaker) {
            reconciled.transitions.push(transition);
        }

        let Some(handoff) = attempt.handoff else {
            continue;
        };
        if handoff.seq <= record.applied_seq {
            continue;
        }
        apply_handoff(record, flow, &handoff, now).with_context(|| {
            format!("replay handoff {} attempt {}", handoff.step_id, handoff.attempt)
        })?;
        reconciled.handoffs.push(handoff);
    }
    Ok(reconciled)
}

/// Human-readable reason recorded in the handoff.
fn routing_reason(decision: &RoutingDecision, classification: Option<&ErrorClassification>) -> String {
    match decision {
        RoutingDecision::Escalate { reason } | RoutingDecision::Halt { reason, .. } => reason.clone(),
        RoutingDecision::Advance => "step succeeded".to_string(),
        RoutingDecision::Loop => "critic requested another iteration".to_string(),
        RoutingDecision::Retry { backoff_ms } => {
            let kind = classification.map_or("unclassified", |c| c.kind.as_str());
            match backoff_ms {
                Some(ms) => format!("{kind} failure, retrying after {ms} ms"),
                None => format!("{kind} failure, retrying"),
            }
        }
        RoutingDecision::Detour { target, signature } => {
            format!("known failure '{signature}', detouring to '{target}'")
        }
        RoutingDecision::Bounce { to_step } => {
            let kind = classification.map_or("unclassified", |c| c.kind.as_str());
            format!("{kind} failure, bouncing back to '{to_step}'")
        }
    }
}

#[cfg(test)]
mod tests {
    use std::path::PathBuf;
    use std::sync::Mutex;

    use super::*;
    use crate::core::deadline::span;
    use crate::core::types::ErrorKind;
    use crate::io::events::read_events;
    use crate::io::run_state::freeze_flow;
    use crate::test_support::{
        ManualClock, ScriptedExecutor, flow, handoff_for, receipt, step, t0, test_config,
        transient_failure,
    };

    /// Manual clock that records the breaker phase found in `run.json` each
    /// time the runner sleeps.
    struct RecordWatchingClock {
        inner: ManualClock,
        record_path: PathBuf,
        phases_on_disk: Mutex<Vec<BreakerPhase>>,
    }

    impl Clock for RecordWatchingClock {
        fn now(&self) -> DateTime<Utc> {
            self.inner.now()
        }

        fn sleep(&self, duration: Duration) {
            let record = load_run_record(&self.record_path).expect("record on disk");
            self.phases_on_disk
                .lock()
                .expect("phases lock")
                .push(record.breaker.phase);
            self.inner.sleep(duration);
        }
    }

    /// Verifies a handoff persisted after the run record (crash before the
    /// record write) is replayed exactly once.
    #[test]
    fn reconcile_replays_handoffs_newer_than_record() {
        let temp = tempfile::tempdir().expect("tempdir");
        let store = CheckpointStore::new(temp.path());
        let f = flow(vec![step("build"), step("test")]);
        let mut record = RunRecord::new("run-test", &f, 60_000, t0());

        let built = receipt("build", 1, StepStatus::Succeeded);
        store.put_receipt("run-test", "build", 1, &built).expect("receipt");
        store
            .put_handoff("run-test", "build", &handoff_for(&built, RoutingDecision::Advance))
            .expect("handoff");

        let mut pending = receipt("test", 1, StepStatus::Failed);
        pending.seq = 2;
        store.put_receipt("run-test", "test", 1, &pending).expect("receipt");

        let policy = BreakerPolicy::default();
        let replayed = reconcile(&store, &f, &mut record, &policy, t0()).expect("reconcile");
        assert_eq!(replayed.handoffs.len(), 1);
        assert_eq!(record.position, 1);
        assert_eq!(record.applied_seq, 1);
        assert_eq!(record.seq, 2);
        // Receipt without a handoff reserves its attempt number.
        assert_eq!(record.progress("test").attempts, 1);
        assert_eq!(record.progress("test").last_status, None);
        // Its failure still reaches the breaker.
        assert_eq!(record.breaker.cumulative_failures, 1);
        assert_eq!(record.breaker_seq, 2);

        let again = reconcile(&store, &f, &mut record, &policy, t0()).expect("reconcile");
        assert!(again.handoffs.is_empty());
        assert!(again.transitions.is_empty());
        assert_eq!(record.position, 1);
        assert_eq!(record.breaker.cumulative_failures, 1);
    }

    /// Verifies a step deadline breach yields a timeout receipt that the
    /// router retries as transient.
    #[test]
    fn step_deadline_breach_is_retried() {
        let temp = tempfile::tempdir().expect("tempdir");
        let config = test_config(temp.path());
        let store = CheckpointStore::new(&config.runs_dir);
        let manual = Arc::new(ManualClock::new(t0()));
        let executor = Arc::new(ScriptedExecutor::new());
        {
            let manual = manual.clone();
            executor.on_call("build", move |ctx| {
                manual.advance(Duration::from_secs(5));
                while !ctx.is_cancelled() {
                    std::thread::sleep(Duration::from_millis(5));
                }
                Ok(crate::core::types::RawOutcome::failed("stopped"))
            });
        }

        let mut build = step("build");
        build.deadline_ms = Some(1_000);
        let f = flow(vec![build]);
        let paths = store.paths("run-1");
        freeze_flow(&paths, &f).expect("freeze");
        write_run_record(&paths.record_path, &RunRecord::new("run-1", &f, 600_000, t0()))
            .expect("record");

        let runner = FlowRunner::new(&store, &config, executor.clone(), manual);
        let outcome = runner.drive("run-1").expect("drive");
        assert_eq!(outcome.status, RunStatus::Succeeded);
        assert_eq!(executor.call_count("build"), 2);

        let first = store.receipt("run-1", "build", 1).expect("read").expect("receipt");
        assert_eq!(first.status, StepStatus::Timeout);
        let handoff = store.handoff("run-1", "build", 1).expect("read").expect("handoff");
        assert!(matches!(handoff.routing.recommendation, RoutingDecision::Retry { .. }));
        assert_eq!(handoff.error_kind, Some(crate::core::types::ErrorKind::Transient));
    }

    /// Verifies the breaker that opens on a third failure is on disk while
    /// the runner waits out the cool-down.
    #[test]
    fn open_breaker_is_persisted_before_cooldown_wait() {
        let temp = tempfile::tempdir().expect("tempdir");
        let config = test_config(temp.path());
        let store = CheckpointStore::new(&config.runs_dir);
        let paths = store.paths("run-1");
        let clock = Arc::new(RecordWatchingClock {
            inner: ManualClock::new(t0()),
            record_path: paths.record_path.clone(),
            phases_on_disk: Mutex::new(Vec::new()),
        });
        let executor = Arc::new(ScriptedExecutor::new());
        executor.push_outcomes(
            "flaky",
            (0..3).map(|_| transient_failure("connection reset by peer")),
        );

        let mut flaky = step("flaky");
        flaky.policy.max_transient_retries = Some(10);
        let f = flow(vec![flaky]);
        freeze_flow(&paths, &f).expect("freeze");
        write_run_record(&paths.record_path, &RunRecord::new("run-1", &f, 600_000, t0()))
            .expect("record");

        let runner = FlowRunner::new(&store, &config, executor.clone(), clock.clone());
        let outcome = runner.drive("run-1").expect("drive");
        assert_eq!(outcome.status, RunStatus::Succeeded);
        assert_eq!(executor.call_count("flaky"), 4);

        let phases = clock.phases_on_disk.lock().expect("phases lock").clone();
        assert!(phases.contains(&BreakerPhase::Open), "{phases:?}");
        let record = load_run_record(&paths.record_path).expect("record");
        assert_eq!(record.breaker_seq, 4);
        assert_eq!(record.breaker.cumulative_failures, 3);
    }

    /// Verifies a crash during the cool-down (third failure on disk without a
    /// handoff, record from before it) resumes into the same cool-down rather
    /// than running the step at once.
    #[test]
    fn resume_after_crash_in_cooldown_keeps_breaker_open() {
        let temp = tempfile::tempdir().expect("tempdir");
        let mut config = test_config(temp.path());
        config.breaker.cooldown_ms = 600_000;
        let store = CheckpointStore::new(&config.runs_dir);
        let f = flow(vec![step("build")]);
        let paths = store.paths("run-1");
        freeze_flow(&paths, &f).expect("freeze");
        write_run_record(&paths.record_path, &RunRecord::new("run-1", &f, 3_600_000, t0()))
            .expect("stale record");

        for attempt in 1..=3 {
            let mut failed = receipt("build", attempt, StepStatus::Failed);
            failed.run_id = "run-1".to_string();
            store.put_receipt("run-1", "build", attempt, &failed).expect("receipt");
            if attempt < 3 {
                let mut handoff =
                    handoff_for(&failed, RoutingDecision::Retry { backoff_ms: None });
                handoff.error_kind = Some(ErrorKind::Transient);
                store.put_handoff("run-1", "build", &handoff).expect("handoff");
            }
        }

        let clock = Arc::new(ManualClock::new(t0()));
        let executor = Arc::new(ScriptedExecutor::new());
        let runner = FlowRunner::new(&store, &config, executor.clone(), clock.clone());
        let outcome = runner.drive("run-1").expect("resume");
        assert_eq!(outcome.status, RunStatus::Succeeded);
        assert_eq!(executor.call_count("build"), 1);

        let retried = store.receipt("run-1", "build", 4).expect("read").expect("receipt");
        assert!(retried.started_at >= t0() + span(600_000));
        let record = load_run_record(&paths.record_path).expect("record");
        assert_eq!(record.breaker.phase, BreakerPhase::Closed);
        assert_eq!(record.breaker.cumulative_failures, 3);

        let events = read_events(&paths.events_path).expect("events");
        let phases: Vec<&str> = events
            .iter()
            .filter(|event| event.kind == "breaker_transition")
            .filter_map(|event| event.data["to"].as_str())
            .collect();
        assert_eq!(phases, vec!["open", "half_open", "closed"]);
    }

    #[test]
    fn routing_reason_names_the_failure_kind() {
        let classification = ErrorClassification {
            kind: crate::core::types::ErrorKind::Permanent,
            confidence: 0.95,
            signal: "payload: validation failure".to_string(),
        };
        let reason = routing_reason(
            &RoutingDecision::Bounce {
                to_step: "build".to_string(),
            },
            Some(&classification),
        );
        assert_eq!(reason, "permanent failure, bouncing back to 'build'");
    }
}
