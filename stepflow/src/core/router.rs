//! Routing decision table.
//!
//! Given a persisted receipt, its classification and the run's breaker and
//! step counters, pick exactly one of Advance, Retry, Loop, Detour, Bounce,
//! Escalate or Halt. `None` means the decision is deferred because the
//! breaker is open; the caller waits for the cool-down and asks again.

use serde::{Deserialize, Serialize};

use crate::core::breaker::{BreakerPhase, BreakerState};
use crate::core::microloop::{MicroloopExit, MicroloopVerdict};
use crate::core::progress::StepProgress;
use crate::core::signature::FailureSignature;
use crate::core::types::{ErrorClassification, ErrorKind, Receipt, Review, RoutingDecision};
use crate::flow::{Flow, StepDef};

/// Retry, bounce and detour budgets.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct RetryPolicy {
    pub max_transient_retries: u32,
    pub max_retriable_retries: u32,
    pub backoff_base_ms: u64,
    pub backoff_max_ms: u64,
    /// Bounces allowed from one step.
    pub max_bounces: u32,
    /// Detours allowed with one step as origin.
    pub max_detours: u32,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_transient_retries: 3,
            max_retriable_retries: 2,
            backoff_base_ms: 1_000,
            backoff_max_ms: 60_000,
            max_bounces: 3,
            max_detours: 2,
        }
    }
}

impl RetryPolicy {
    /// Apply a step's overrides on top of these defaults.
    pub fn for_step(&self, step: &StepDef) -> Self {
        let overrides = &step.policy;
        Self {
            max_transient_retries: overrides
                .max_transient_retries
                .unwrap_or(self.max_transient_retries),
            max_retriable_retries: overrides
                .max_retriable_retries
                .unwrap_or(self.max_retriable_retries),
            max_bounces: overrides.max_bounces.unwrap_or(self.max_bounces),
            ..*self
        }
    }
}

/// Exponential backoff for the `n`-th retry (1-based): `base * 2^(n-1)`,
/// capped at `max`.
pub fn backoff_ms(base: u64, max: u64, n: u32) -> u64 {
    let factor = 1u64.checked_shl(n.saturating_sub(1)).unwrap_or(u64::MAX);
    base.saturating_mul(factor).min(max)
}

/// Everything the router looks at for one decision.
#[derive(Debug, Clone, Copy)]
pub struct RouteInput<'a> {
    pub flow: &'a Flow,
    pub step: &'a StepDef,
    pub receipt: &'a Receipt,
    pub classification: Option<&'a ErrorClassification>,
    /// Failure signature of the receipt, or the critic signature for a
    /// reviewed pass.
    pub signature: Option<&'a FailureSignature>,
    pub breaker: &'a BreakerState,
    /// Counters for the step before this decision is applied.
    pub progress: &'a StepProgress,
    pub policy: &'a RetryPolicy,
    pub review: Option<&'a Review>,
    /// Coordinator verdict for a reviewed critic pass in a microloop.
    pub microloop: Option<MicroloopVerdict>,
}

pub fn decide(input: &RouteInput<'_>) -> Option<RoutingDecision> {
    let kind = input.classification.map(|c| c.kind);

    if kind == Some(ErrorKind::Fatal) {
        let signal = input.classification.map_or("", |c| c.signal.as_str());
        return Some(RoutingDecision::Halt {
            reason: format!("fatal failure ({signal})"),
            timeout: false,
        });
    }
    match input.breaker.phase {
        BreakerPhase::Escalate => {
            return Some(RoutingDecision::Escalate {
                reason: format!(
                    "circuit breaker escalated after {} cumulative failures",
                    input.breaker.cumulative_failures
                ),
            });
        }
        BreakerPhase::Open => return None,
        BreakerPhase::Closed | BreakerPhase::HalfOpen => {}
    }

    match kind {
        Some(ErrorKind::Permanent) => Some(permanent(input)),
        Some(ErrorKind::Transient) => Some(transient(input)),
        Some(ErrorKind::Retriable) => Some(retriable(input)),
        Some(ErrorKind::Fatal) | None => Some(succeeded(input)),
    }
}

fn permanent(input: &RouteInput<'_>) -> RoutingDecision {
    match &input.step.bounce_to {
        Some(target) if input.progress.bounces < input.policy.max_bounces => {
            RoutingDecision::Bounce {
                to_step: target.clone(),
            }
        }
        Some(target) => RoutingDecision::Escalate {
            reason: format!(
                "bounce budget to '{target}' exhausted after {} bounces",
                input.progress.bounces
            ),
        },
        None => RoutingDecision::Halt {
            reason: format!("permanent failure at '{}'", input.step.id),
            timeout: false,
        },
    }
}

fn transient(input: &RouteInput<'_>) -> RoutingDecision {
    if let Some(detour) = detour(input) {
        return detour;
    }
    let used = input.progress.transient_retries;
    if used < input.policy.max_transient_retries {
        let policy = input.policy;
        return RoutingDecision::Retry {
            backoff_ms: Some(backoff_ms(
                policy.backoff_base_ms,
                policy.backoff_max_ms,
                used + 1,
            )),
        };
    }
    permanent(input)
}

fn retriable(input: &RouteInput<'_>) -> RoutingDecision {
    if let Some(detour) = detour(input) {
        return detour;
    }
    if input.progress.retriable_retries < input.policy.max_retriable_retries {
        return RoutingDecision::Retry { backoff_ms: None };
    }
    RoutingDecision::Escalate {
        reason: format!(
            "retriable failure at '{}' persisted after {} retries",
            input.step.id, input.progress.retriable_retries
        ),
    }
}

fn succeeded(input: &RouteInput<'_>) -> RoutingDecision {
    let reviewed_critic = input.step.loop_with.is_some()
        && input.receipt.succeeded()
        && input.review.is_some_and(|review| !review.verified);
    if !reviewed_critic {
        return RoutingDecision::Advance;
    }
    match input.microloop {
        Some(MicroloopVerdict::Continue) => RoutingDecision::Loop,
        Some(MicroloopVerdict::Exit(MicroloopExit::Verified)) => RoutingDecision::Advance,
        Some(MicroloopVerdict::Exit(exit)) => {
            detour(input).unwrap_or_else(|| RoutingDecision::Escalate {
                reason: exit.reason().to_string(),
            })
        }
        // Unverified review with no coordinator verdict: iterate once more.
        None => RoutingDecision::Loop,
    }
}

/// Detour to a catalogued remediation step, if one matches and the origin
/// still has detour budget.
fn detour(input: &RouteInput<'_>) -> Option<RoutingDecision> {
    if input.progress.detours >= input.policy.max_detours {
        return None;
    }
    let signature = input.signature?;
    input
        .flow
        .match_detour(&input.step.id, signature)
        .map(|rule| RoutingDecision::Detour {
            target: rule.target.clone(),
            signature: rule.signature.clone(),
        })
}
