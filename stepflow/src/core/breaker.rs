//! Per-run circuit breaker.
//!
//! The breaker is a plain value stored in the run record. Every operation
//! takes the current time explicitly and returns the transition it caused, if
//! any, so the caller can append it to the event log.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::core::deadline::span;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum BreakerPhase {
    Closed,
    Open,
    HalfOpen,
    /// Absorbing: no further transitions.
    Escalate,
}

impl BreakerPhase {
    pub fn as_str(self) -> &'static str {
        match self {
            BreakerPhase::Closed => "closed",
            BreakerPhase::Open => "open",
            BreakerPhase::HalfOpen => "half_open",
            BreakerPhase::Escalate => "escalate",
        }
    }
}

/// Thresholds for one breaker.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct BreakerPolicy {
    /// Consecutive failures that open the breaker.
    pub failure_threshold: u32,
    /// Cumulative failures that force escalation.
    pub escalate_after: u32,
    pub cooldown_ms: u64,
}

impl Default for BreakerPolicy {
    fn default() -> Self {
        Self {
            failure_threshold: 3,
            escalate_after: 5,
            cooldown_ms: 30_000,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct BreakerState {
    pub phase: BreakerPhase,
    pub consecutive_failures: u32,
    pub cumulative_failures: u32,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub cooldown_until: Option<DateTime<Utc>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub last_transition: Option<DateTime<Utc>>,
}

impl Default for BreakerState {
    fn default() -> Self {
        Self {
            phase: BreakerPhase::Closed,
            consecutive_failures: 0,
            cumulative_failures: 0,
            cooldown_until: None,
            last_transition: None,
        }
    }
}

/// A phase change, reported so it can be logged.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct BreakerTransition {
    pub from: BreakerPhase,
    pub to: BreakerPhase,
    pub at: DateTime<Utc>,
    pub reason: &'static str,
}

impl BreakerState {
    pub fn record_failure(
        &mut self,
        policy: &BreakerPolicy,
        now: DateTime<Utc>,
    ) -> Option<BreakerTransition> {
        self.consecutive_failures = self.consecutive_failures.saturating_add(1);
        self.cumulative_failures = self.cumulative_failures.saturating_add(1);

        if self.phase == BreakerPhase::Escalate {
            return None;
        }
        if self.cumulative_failures >= policy.escalate_after {
            self.cooldown_until = None;
            return Some(self.transition(BreakerPhase::Escalate, now, "cumulative failure limit"));
        }
        match self.phase {
            BreakerPhase::HalfOpen => {
                self.cooldown_until = Some(now + span(policy.cooldown_ms));
                Some(self.transition(BreakerPhase::Open, now, "half-open trial failed"))
            }
            BreakerPhase::Closed if self.consecutive_failures >= policy.failure_threshold => {
                self.cooldown_until = Some(now + span(policy.cooldown_ms));
                Some(self.transition(BreakerPhase::Open, now, "consecutive failure threshold"))
            }
            BreakerPhase::Closed | BreakerPhase::Open | BreakerPhase::Escalate => None,
        }
    }

    pub fn record_success(&mut self, now: DateTime<Utc>) -> Option<BreakerTransition> {
        if self.phase == BreakerPhase::Escalate {
            return None;
        }
        self.consecutive_failures = 0;
        match self.phase {
            BreakerPhase::HalfOpen | BreakerPhase::Open => {
                self.cooldown_until = None;
                Some(self.transition(BreakerPhase::Closed, now, "trial succeeded"))
            }
            BreakerPhase::Closed | BreakerPhase::Escalate => None,
        }
    }

    /// Evaluate the cool-down deadline; OPEN becomes HALF_OPEN once it passes.
    pub fn poll(&mut self, now: DateTime<Utc>) -> Option<BreakerTransition> {
        if self.phase != BreakerPhase::Open {
            return None;
        }
        match self.cooldown_until {
            Some(until) if now < until => None,
            _ => {
                self.cooldown_until = None;
                Some(self.transition(BreakerPhase::HalfOpen, now, "cool-down elapsed"))
            }
        }
    }

    /// Forget the current failure streak (used on bounce). Cumulative failures
    /// are kept.
    pub fn reset_consecutive(&mut self) {
        self.consecutive_failures = 0;
    }

    fn transition(
        &mut self,
        to: BreakerPhase,
        now: DateTime<Utc>,
        reason: &'static str,
    ) -> BreakerTransition {
        let from = self.phase;
        self.phase = to;
        self.last_transition = Some(now);
        BreakerTransition {
            from,
            to,
            at: now,
            reason,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn t0() -> DateTime<Utc> {
        DateTime::<Utc>::from_timestamp(1_700_000_000, 0).expect("timestamp")
    }

    fn policy() -> BreakerPolicy {
        BreakerPolicy {
            failure_threshold: 3,
            escalate_after: 5,
            cooldown_ms: 1_000,
        }
    }

    #[test]
    fn three_consecutive_failures_open_the_breaker() {
        let mut state = BreakerState::default();
        assert_eq!(state.record_failure(&policy(), t0()), None);
        assert_eq!(state.record_failure(&policy(), t0()), None);
        let transition = state.record_failure(&policy(), t0()).expect("opened");
        assert_eq!(transition.to, BreakerPhase::Open);
        assert_eq!(state.cooldown_until, Some(t0() + span(1_000)));
    }

    #[test]
    fn success_resets_the_streak_while_closed() {
        let mut state = BreakerState::default();
        state.record_failure(&policy(), t0());
        state.record_failure(&policy(), t0());
        assert_eq!(state.record_success(t0()), None);
        assert_eq!(state.consecutive_failures, 0);
        assert_eq!(state.record_failure(&policy(), t0()), None);
        assert_eq!(state.phase, BreakerPhase::Closed);
    }

    #[test]
    fn half_open_success_closes_with_zero_counter() {
        let mut state = BreakerState::default();
        for _ in 0..3 {
            state.record_failure(&policy(), t0());
        }
        assert_eq!(state.poll(t0() + span(999)), None);
        let opened = state.poll(t0() + span(1_000)).expect("half-open");
        assert_eq!(opened.to, BreakerPhase::HalfOpen);

        let closed = state.record_success(t0() + span(1_100)).expect("closed");
        assert_eq!(closed.from, BreakerPhase::HalfOpen);
        assert_eq!(state.phase, BreakerPhase::Closed);
        assert_eq!(state.consecutive_failures, 0);
        assert_eq!(state.cumulative_failures, 3);
    }

    #[test]
    fn half_open_failure_restarts_cooldown() {
        let mut state = BreakerState::default();
        for _ in 0..3 {
            state.record_failure(&policy(), t0());
        }
        let later = t0() + span(1_000);
        state.poll(later);
        let reopened = state.record_failure(&policy(), later).expect("reopened");
        assert_eq!(reopened.to, BreakerPhase::Open);
        assert_eq!(state.cooldown_until, Some(later + span(1_000)));
    }

    #[test]
    fn cumulative_limit_escalates_from_any_phase_and_is_absorbing() {
        let mut state = BreakerState::default();
        // Interleave successes so the breaker never opens.
        for _ in 0..4 {
            state.record_failure(&policy(), t0());
            state.record_success(t0());
        }
        assert_eq!(state.phase, BreakerPhase::Closed);
        let escalated = state.record_failure(&policy(), t0()).expect("escalated");
        assert_eq!(escalated.to, BreakerPhase::Escalate);

        assert_eq!(state.record_success(t0()), None);
        assert_eq!(state.poll(t0() + span(60_000)), None);
        assert_eq!(state.record_failure(&policy(), t0()), None);
        assert_eq!(state.phase, BreakerPhase::Escalate);
    }

    #[test]
    fn reset_consecutive_keeps_cumulative() {
        let mut state = BreakerState::default();
        state.record_failure(&policy(), t0());
        state.record_failure(&policy(), t0());
        state.reset_consecutive();
        assert_eq!(state.consecutive_failures, 0);
        assert_eq!(state.cumulative_failures, 2);
    }
}
