//! Run record and the pure transition applied after every handoff.
//!
//! `apply_handoff` is the only place the run position moves. The runner calls
//! it after persisting a handoff, and resume calls it to replay a handoff that
//! was persisted before the record was.

use std::collections::BTreeMap;

use anyhow::{Context, Result};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::core::breaker::{BreakerPolicy, BreakerState, BreakerTransition};
use crate::core::deadline::span;
use crate::core::microloop::MicroloopState;
use crate::core::signature::FailureSignature;
use crate::core::types::{ErrorKind, Handoff, Receipt, RoutingDecision, RunStatus, StepStatus};
use crate::flow::Flow;

/// Reason recorded when the flow deadline ends a run.
pub const FLOW_DEADLINE_EXCEEDED: &str = "flow deadline exceeded";

/// Per-step counters. Attempt numbers are never reused; retry counters reset
/// on bounce.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct StepProgress {
    /// Highest attempt number allocated for the step.
    pub attempts: u32,
    pub transient_retries: u32,
    pub retriable_retries: u32,
    /// Bounces taken from this step.
    pub bounces: u32,
    /// Detours taken with this step as origin.
    pub detours: u32,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub last_status: Option<StepStatus>,
}

impl StepProgress {
    pub fn reset_retries(&mut self) {
        self.transient_retries = 0;
        self.retriable_retries = 0;
    }
}

/// Where a detour returns to once its target step advances.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DetourReturn {
    pub origin: String,
    pub target: String,
    pub signature: String,
}

/// Why a run reached its current terminal (or interrupted) state.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TerminalSummary {
    pub status: RunStatus,
    pub reason: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub step_id: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub attempt: Option<u32>,
}

/// Persisted state of one run (`run.json`).
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RunRecord {
    pub run_id: String,
    pub flow_id: String,
    pub status: RunStatus,
    /// Index into the frozen flow of the step to run next.
    pub position: usize,
    pub created_at: DateTime<Utc>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub started_at: Option<DateTime<Utc>>,
    pub updated_at: DateTime<Utc>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub completed_at: Option<DateTime<Utc>>,
    /// Resolved flow budget in active milliseconds.
    pub flow_budget_ms: u64,
    /// Active milliseconds consumed across all sessions.
    #[serde(default)]
    pub active_ms: u64,
    #[serde(default)]
    pub breaker: BreakerState,
    #[serde(default)]
    pub steps: BTreeMap<String, StepProgress>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub microloop: Option<MicroloopState>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub detour_return: Option<DetourReturn>,
    /// Retry backoff gate for the current step.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub not_before: Option<DateTime<Utc>>,
    /// Highest sequence number allocated to a receipt.
    #[serde(default)]
    pub seq: u64,
    /// Sequence number of the last handoff applied to this record.
    #[serde(default)]
    pub applied_seq: u64,
    /// Highest receipt sequence number the breaker has accounted for.
    #[serde(default)]
    pub breaker_seq: u64,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub summary: Option<TerminalSummary>,
}

impl RunRecord {
    pub fn new(run_id: &str, flow: &Flow, flow_budget_ms: u64, now: DateTime<Utc>) -> Self {
        Self {
            run_id: run_id.to_string(),
            flow_id: flow.id.clone(),
            status: RunStatus::Pending,
            position: flow.first_linear().unwrap_or(0),
            created_at: now,
            started_at: None,
            updated_at: now,
            completed_at: None,
            flow_budget_ms,
            active_ms: 0,
            breaker: BreakerState::default(),
            steps: BTreeMap::new(),
            microloop: None,
            detour_return: None,
            not_before: None,
            seq: 0,
            applied_seq: 0,
            breaker_seq: 0,
            summary: None,
        }
    }

    /// Counters for a step (zeroed when the step has not run yet).
    pub fn progress(&self, step_id: &str) -> StepProgress {
        self.steps.get(step_id).cloned().unwrap_or_default()
    }

    pub fn progress_mut(&mut self, step_id: &str) -> &mut StepProgress {
        self.steps.entry(step_id.to_string()).or_default()
    }

    /// Feed a receipt into the breaker unless it was already counted.
    pub fn account_receipt(
        &mut self,
        receipt: &Receipt,
        policy: &BreakerPolicy,
    ) -> Option<BreakerTransition> {
        if receipt.seq <= self.breaker_seq {
            return None;
        }
        self.breaker_seq = receipt.seq;
        if receipt.succeeded() {
            self.breaker.record_success(receipt.finished_at)
        } else {
            self.breaker.record_failure(policy, receipt.finished_at)
        }
    }

    pub fn remaining_budget_ms(&self) -> u64 {
        self.flow_budget_ms.saturating_sub(self.active_ms)
    }

    /// Record a terminal (or interrupted) status with its reason.
    pub fn finish(
        &mut self,
        status: RunStatus,
        reason: impl Into<String>,
        step: Option<(&str, u32)>,
        now: DateTime<Utc>,
    ) {
        self.status = status;
        self.updated_at = now;
        self.not_before = None;
        if status.is_terminal() {
            self.completed_at = Some(now);
        }
        self.summary = Some(TerminalSummary {
            status,
            reason: reason.into(),
            step_id: step.map(|(id, _)| id.to_string()),
            attempt: step.map(|(_, attempt)| attempt),
        });
    }
}

/// Apply the routing decision of a persisted handoff to the run record.
pub fn apply_handoff(
    record: &mut RunRecord,
    flow: &Flow,
    handoff: &Handoff,
    now: DateTime<Utc>,
) -> Result<()> {
    let idx = flow
        .index_of(&handoff.step_id)
        .with_context(|| format!("handoff references unknown step '{}'", handoff.step_id))?;
    let step = &flow.steps[idx];
    let decision = &handoff.routing.recommendation;

    record.seq = record.seq.max(handoff.seq);
    record.applied_seq = record.applied_seq.max(handoff.seq);
    record.updated_at = now;
    record.not_before = None;
    {
        let progress = record.progress_mut(&step.id);
        progress.attempts = progress.attempts.max(handoff.attempt);
        progress.last_status = Some(handoff.status);
    }

    if let (Some(producer), Some(_)) = (&step.loop_with, handoff.verified) {
        record.microloop = match decision {
            RoutingDecision::Loop => Some(MicroloopState::next_pass(
                record.microloop.as_ref(),
                producer,
                &step.id,
                &FailureSignature::from_concerns(&handoff.concerns),
            )),
            _ => None,
        };
    }

    match decision {
        RoutingDecision::Advance => {
            let returning = record
                .detour_return
                .take_if(|detour| detour.target == step.id);
            if let Some(detour) = returning {
                record.position = index(flow, &detour.origin)?;
            } else if let Some(next) = flow.next_linear(idx) {
                record.position = next;
            } else {
                record.position = flow.steps.len();
                record.finish(
                    RunStatus::Succeeded,
                    "all steps succeeded",
                    Some((&step.id, handoff.attempt)),
                    now,
                );
            }
        }
        RoutingDecision::Retry { backoff_ms } => {
            record.position = idx;
            let progress = record.progress_mut(&step.id);
            match handoff.error_kind {
                Some(ErrorKind::Transient) => progress.transient_retries += 1,
                Some(ErrorKind::Retriable) => progress.retriable_retries += 1,
                Some(ErrorKind::Permanent | ErrorKind::Fatal) | None => {}
            }
            record.not_before = backoff_ms.map(|ms| handoff.written_at + span(ms));
        }
        RoutingDecision::Loop => {
            let producer = step
                .loop_with
                .as_deref()
                .with_context(|| format!("step '{}' looped without loop_with", step.id))?;
            record.position = index(flow, producer)?;
        }
        RoutingDecision::Detour { target, signature } => {
            let target_idx = index(flow, target)?;
            record.progress_mut(&step.id).detours += 1;
            match record.detour_return.as_mut() {
                Some(detour) => detour.target.clone_from(target),
                None => {
                    record.detour_return = Some(DetourReturn {
                        origin: step.id.clone(),
                        target: target.clone(),
                        signature: signature.clone(),
                    });
                }
            }
            record.microloop = None;
            record.position = target_idx;
        }
        RoutingDecision::Bounce { to_step } => {
            let to_idx = index(flow, to_step)?;
            {
                let progress = record.progress_mut(&step.id);
                progress.bounces += 1;
                progress.reset_retries();
            }
            record.progress_mut(to_step).reset_retries();
            record.breaker.reset_consecutive();
            record.microloop = None;
            record.detour_return = None;
            record.position = to_idx;
        }
        RoutingDecision::Escalate { reason } => {
            record.finish(
                RunStatus::Escalated,
                reason.clone(),
                Some((&step.id, handoff.attempt)),
                now,
            );
        }
        RoutingDecision::Halt { reason, timeout } => {
            let status = if *timeout {
                RunStatus::Timeout
            } else {
                RunStatus::Failed
            };
            record.finish(status, reason.clone(), Some((&step.id, handoff.attempt)), now);
        }
    }
    Ok(())
}

fn index(flow: &Flow, step_id: &str) -> Result<usize> {
    flow.index_of(step_id)
        .with_context(|| format!("unknown step '{step_id}'"))
}
