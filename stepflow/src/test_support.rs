//! Builders and fakes shared by unit and integration tests.
//!
//! Enabled for the crate's own tests and, through the `test-support` feature,
//! for the integration tests under `tests/`.

use std::collections::{BTreeMap, HashMap, VecDeque};
use std::path::Path;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::Duration;

use anyhow::{Result, anyhow};
use chrono::{DateTime, TimeZone, Utc};

use crate::core::breaker::BreakerPolicy;
use crate::core::deadline::span;
use crate::core::router::RetryPolicy;
use crate::core::types::{
    Concern, ErrorCategory, ErrorPayload, Handoff, RawOutcome, Receipt, Review, Routing,
    RoutingDecision, StepStatus,
};
use crate::flow::{Flow, StepDef, StepPolicy, StepRole};
use crate::io::clock::Clock;
use crate::io::config::{KernelConfig, TimeoutConfig};
use crate::io::executor::{StepContext, StepExecutor};

/// Fixed reference time: 2025-01-01T12:00:00Z.
pub fn t0() -> DateTime<Utc> {
    Utc.with_ymd_and_hms(2025, 1, 1, 12, 0, 0)
        .single()
        .unwrap_or_default()
}

/// A worker step bound to the `scripted` executor.
pub fn step(id: &str) -> StepDef {
    StepDef {
        id: id.to_string(),
        executor: "scripted".to_string(),
        role: StepRole::Worker,
        deadline_ms: None,
        category: None,
        bounce_to: None,
        loop_with: None,
        detour_only: false,
        policy: StepPolicy::default(),
    }
}

/// A critic step iterating with `producer`.
pub fn critic(id: &str, producer: &str) -> StepDef {
    StepDef {
        role: StepRole::Critic,
        loop_with: Some(producer.to_string()),
        ..step(id)
    }
}

pub fn flow(steps: Vec<StepDef>) -> Flow {
    Flow {
        id: "test-flow".to_string(),
        deadline_ms: None,
        steps,
        detours: Vec::new(),
    }
}

pub fn receipt(step_id: &str, attempt: u32, status: StepStatus) -> Receipt {
    Receipt {
        run_id: "run-test".to_string(),
        step_id: step_id.to_string(),
        executor: "scripted".to_string(),
        attempt,
        seq: u64::from(attempt),
        status,
        exit_code: None,
        error: None,
        message: None,
        started_at: t0(),
        finished_at: t0(),
        duration_ms: 0,
        evidence: Vec::new(),
    }
}

pub fn handoff_for(receipt: &Receipt, decision: RoutingDecision) -> Handoff {
    Handoff {
        run_id: receipt.run_id.clone(),
        step_id: receipt.step_id.clone(),
        attempt: receipt.attempt,
        seq: receipt.seq,
        status: receipt.status,
        error_kind: None,
        concerns: Vec::new(),
        routing: Routing {
            reason: decision.label().to_string(),
            can_further_iteration_help: true,
            recommendation: decision,
        },
        assumptions: Vec::new(),
        verified: None,
        written_at: receipt.finished_at,
    }
}

/// Failure with a network payload (classified transient).
pub fn transient_failure(message: &str) -> RawOutcome {
    RawOutcome {
        error: Some(ErrorPayload::new(ErrorCategory::Network, message)),
        ..RawOutcome::failed(message)
    }
}

/// Failure with a validation payload (classified permanent).
pub fn validation_failure(message: &str) -> RawOutcome {
    RawOutcome {
        error: Some(ErrorPayload::new(ErrorCategory::Validation, message)),
        ..RawOutcome::failed(message)
    }
}

/// Failure with a secret-leak payload (classified fatal).
pub fn fatal_failure(message: &str) -> RawOutcome {
    RawOutcome {
        error: Some(ErrorPayload::new(ErrorCategory::SecretLeak, message)),
        ..RawOutcome::failed(message)
    }
}

/// Succeeded critic pass with a review and the given concerns.
pub fn review(verified: bool, can_further_iteration_help: bool, concerns: Vec<Concern>) -> RawOutcome {
    RawOutcome {
        review: Some(Review {
            verified,
            can_further_iteration_help,
        }),
        concerns,
        ..RawOutcome::succeeded()
    }
}

/// Configuration rooted at `dir` with a short cool-down, backoff and cancel
/// grace.
pub fn test_config(dir: &Path) -> KernelConfig {
    KernelConfig {
        runs_dir: dir.join("runs"),
        timeouts: TimeoutConfig {
            cancel_grace_ms: 200,
            ..TimeoutConfig::default()
        },
        breaker: BreakerPolicy {
            failure_threshold: 3,
            escalate_after: 5,
            cooldown_ms: 1_000,
        },
        retry: RetryPolicy {
            backoff_base_ms: 10,
            backoff_max_ms: 100,
            ..RetryPolicy::default()
        },
        agents: BTreeMap::new(),
        ..KernelConfig::default()
    }
}

/// Clock that only moves when told to. `sleep` advances it instantly.
#[derive(Debug)]
pub struct ManualClock {
    now: Mutex<DateTime<Utc>>,
}

impl ManualClock {
    pub fn new(start: DateTime<Utc>) -> Self {
        Self {
            now: Mutex::new(start),
        }
    }

    pub fn advance(&self, by: Duration) {
        let mut now = self.lock();
        *now += span(u64::try_from(by.as_millis()).unwrap_or(u64::MAX));
    }

    fn lock(&self) -> MutexGuard<'_, DateTime<Utc>> {
        self.now.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

impl Clock for ManualClock {
    fn now(&self) -> DateTime<Utc> {
        *self.lock()
    }

    fn sleep(&self, duration: Duration) {
        self.advance(duration);
    }
}

pub type StepFn = Arc<dyn Fn(&StepContext) -> Result<RawOutcome> + Send + Sync>;

enum Scripted {
    Outcome(RawOutcome),
    Error(String),
    Call(StepFn),
}

/// Executor that replays queued outcomes per step id. A step with nothing
/// queued succeeds.
#[derive(Default)]
pub struct ScriptedExecutor {
    scripts: Mutex<HashMap<String, VecDeque<Scripted>>>,
    calls: Mutex<Vec<String>>,
}

impl ScriptedExecutor {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn push_outcome(&self, step_id: &str, outcome: RawOutcome) -> &Self {
        self.push(step_id, Scripted::Outcome(outcome))
    }

    /// Queue several outcomes for one step, in order.
    pub fn push_outcomes(&self, step_id: &str, outcomes: impl IntoIterator<Item = RawOutcome>) -> &Self {
        for outcome in outcomes {
            self.push_outcome(step_id, outcome);
        }
        self
    }

    /// Queue an executor error (recorded as a failed outcome).
    pub fn push_error(&self, step_id: &str, message: &str) -> &Self {
        self.push(step_id, Scripted::Error(message.to_string()))
    }

    /// Queue a closure that runs on the executor thread.
    pub fn on_call<F>(&self, step_id: &str, f: F) -> &Self
    where
        F: Fn(&StepContext) -> Result<RawOutcome> + Send + Sync + 'static,
    {
        self.push(step_id, Scripted::Call(Arc::new(f)))
    }

    /// Step ids in execution order.
    pub fn calls(&self) -> Vec<String> {
        self.calls
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
    }

    pub fn call_count(&self, step_id: &str) -> usize {
        self.calls().iter().filter(|id| *id == step_id).count()
    }

    fn push(&self, step_id: &str, item: Scripted) -> &Self {
        self.scripts
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .entry(step_id.to_string())
            .or_default()
            .push_back(item);
        self
    }
}

impl StepExecutor for ScriptedExecutor {
    fn execute(&self, step: &StepDef, ctx: &StepContext) -> Result<RawOutcome> {
        self.calls
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .push(step.id.clone());
        let next = self
            .scripts
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .get_mut(&step.id)
            .and_then(VecDeque::pop_front);
        match next {
            None => Ok(RawOutcome::succeeded()),
            Some(Scripted::Outcome(outcome)) => Ok(outcome),
            Some(Scripted::Error(message)) => Err(anyhow!(message)),
            Some(Scripted::Call(f)) => f(ctx),
        }
    }
}
