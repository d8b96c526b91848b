//! Shared deterministic types for kernel core logic.
//!
//! These types define stable contracts between core components and the
//! persisted run layout. They must not depend on external state or I/O.

use std::fmt;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// Lifecycle status of a run.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum RunStatus {
    Pending,
    Running,
    Succeeded,
    Failed,
    Timeout,
    Interrupted,
    Escalated,
}

impl RunStatus {
    /// Terminal runs are never driven again. `Interrupted` is resumable.
    pub fn is_terminal(self) -> bool {
        matches!(
            self,
            RunStatus::Succeeded | RunStatus::Failed | RunStatus::Timeout | RunStatus::Escalated
        )
    }

    pub fn as_str(self) -> &'static str {
        match self {
            RunStatus::Pending => "pending",
            RunStatus::Running => "running",
            RunStatus::Succeeded => "succeeded",
            RunStatus::Failed => "failed",
            RunStatus::Timeout => "timeout",
            RunStatus::Interrupted => "interrupted",
            RunStatus::Escalated => "escalated",
        }
    }
}

impl fmt::Display for RunStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Status of a single step attempt.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum StepStatus {
    Succeeded,
    Failed,
    Interrupted,
    Timeout,
}

impl StepStatus {
    pub fn as_str(self) -> &'static str {
        match self {
            StepStatus::Succeeded => "succeeded",
            StepStatus::Failed => "failed",
            StepStatus::Interrupted => "interrupted",
            StepStatus::Timeout => "timeout",
        }
    }
}

/// Coarse category of a structured error payload reported by an executor.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ErrorCategory {
    Validation,
    Http,
    Network,
    Assertion,
    Integrity,
    SecretLeak,
    #[serde(other)]
    Other,
}

impl ErrorCategory {
    pub fn as_str(self) -> &'static str {
        match self {
            ErrorCategory::Validation => "validation",
            ErrorCategory::Http => "http",
            ErrorCategory::Network => "network",
            ErrorCategory::Assertion => "assertion",
            ErrorCategory::Integrity => "integrity",
            ErrorCategory::SecretLeak => "secret_leak",
            ErrorCategory::Other => "other",
        }
    }
}

/// Structured error payload attached to a failed outcome.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ErrorPayload {
    pub category: ErrorCategory,
    /// HTTP-like status code, when the failure came from an application API.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub status_code: Option<u16>,
    #[serde(default)]
    pub message: String,
    /// Explicit fatal marker set by the executor.
    #[serde(default)]
    pub fatal: bool,
}

impl ErrorPayload {
    pub fn new(category: ErrorCategory, message: impl Into<String>) -> Self {
        Self {
            category,
            status_code: None,
            message: message.into(),
            fatal: false,
        }
    }

    pub fn with_status_code(mut self, code: u16) -> Self {
        self.status_code = Some(code);
        self
    }
}

/// Severity of a concern raised by a step.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Severity {
    Low,
    Medium,
    High,
    Critical,
}

impl Severity {
    pub fn as_str(self) -> &'static str {
        match self {
            Severity::Low => "low",
            Severity::Medium => "medium",
            Severity::High => "high",
            Severity::Critical => "critical",
        }
    }
}

/// A concern raised by a step, usually by a critic.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Concern {
    pub severity: Severity,
    pub description: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub location: Option<String>,
}

impl Concern {
    pub fn new(severity: Severity, description: impl Into<String>) -> Self {
        Self {
            severity,
            description: description.into(),
            location: None,
        }
    }
}

/// Typed critic verdict. Producing it from free-form output is the
/// executor's job.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct Review {
    pub verified: bool,
    pub can_further_iteration_help: bool,
}

/// Outcome reported by an external step executor for one attempt.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RawOutcome {
    pub status: StepStatus,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub exit_code: Option<i32>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<ErrorPayload>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub message: Option<String>,
    #[serde(default)]
    pub evidence: Vec<String>,
    #[serde(default)]
    pub duration_ms: u64,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub review: Option<Review>,
    #[serde(default)]
    pub concerns: Vec<Concern>,
    #[serde(default)]
    pub assumptions: Vec<String>,
}

impl RawOutcome {
    pub fn new(status: StepStatus) -> Self {
        Self {
            status,
            exit_code: None,
            error: None,
            message: None,
            evidence: Vec::new(),
            duration_ms: 0,
            review: None,
            concerns: Vec::new(),
            assumptions: Vec::new(),
        }
    }

    pub fn succeeded() -> Self {
        Self::new(StepStatus::Succeeded)
    }

    pub fn failed(message: impl Into<String>) -> Self {
        Self {
            message: Some(message.into()),
            ..Self::new(StepStatus::Failed)
        }
    }
}

/// Immutable record of one step attempt.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Receipt {
    pub run_id: String,
    pub step_id: String,
    pub executor: String,
    pub attempt: u32,
    /// Run-wide sequence number, strictly increasing across attempts.
    pub seq: u64,
    pub status: StepStatus,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub exit_code: Option<i32>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<ErrorPayload>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub message: Option<String>,
    pub started_at: DateTime<Utc>,
    pub finished_at: DateTime<Utc>,
    pub duration_ms: u64,
    #[serde(default)]
    pub evidence: Vec<String>,
}

impl Receipt {
    pub fn succeeded(&self) -> bool {
        self.status == StepStatus::Succeeded
    }
}

/// Routing decision for the attempt that produced a receipt.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "action", rename_all = "snake_case")]
pub enum RoutingDecision {
    Advance,
    Retry {
        #[serde(default, skip_serializing_if = "Option::is_none")]
        backoff_ms: Option<u64>,
    },
    Loop,
    Detour {
        target: String,
        signature: String,
    },
    Bounce {
        to_step: String,
    },
    Escalate {
        reason: String,
    },
    Halt {
        reason: String,
        /// The flow deadline forced the halt; the run ends `timeout`.
        #[serde(default, skip_serializing_if = "std::ops::Not::not")]
        timeout: bool,
    },
}

impl RoutingDecision {
    pub fn label(&self) -> &'static str {
        match self {
            RoutingDecision::Advance => "advance",
            RoutingDecision::Retry { .. } => "retry",
            RoutingDecision::Loop => "loop",
            RoutingDecision::Detour { .. } => "detour",
            RoutingDecision::Bounce { .. } => "bounce",
            RoutingDecision::Escalate { .. } => "escalate",
            RoutingDecision::Halt { .. } => "halt",
        }
    }
}

/// Routing section of a handoff envelope.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Routing {
    pub recommendation: RoutingDecision,
    pub can_further_iteration_help: bool,
    /// Human-readable reason for the recommendation.
    pub reason: String,
}

/// Decision envelope persisted after a receipt.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Handoff {
    pub run_id: String,
    /// Weak reference to the receipt by (step id, attempt).
    pub step_id: String,
    pub attempt: u32,
    pub seq: u64,
    pub status: StepStatus,
    /// Classified failure kind of the referenced receipt.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error_kind: Option<ErrorKind>,
    #[serde(default)]
    pub concerns: Vec<Concern>,
    pub routing: Routing,
    #[serde(default)]
    pub assumptions: Vec<String>,
    /// Critic verdict, when the step reported one.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub verified: Option<bool>,
    pub written_at: DateTime<Utc>,
}

/// Error taxonomy driving retry and escalation.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ErrorKind {
    Transient,
    Permanent,
    Retriable,
    Fatal,
}

impl ErrorKind {
    /// Aggregation rank: Fatal > Permanent > Retriable > Transient.
    pub fn severity(self) -> u8 {
        match self {
            ErrorKind::Transient => 0,
            ErrorKind::Retriable => 1,
            ErrorKind::Permanent => 2,
            ErrorKind::Fatal => 3,
        }
    }

    pub fn as_str(self) -> &'static str {
        match self {
            ErrorKind::Transient => "transient",
            ErrorKind::Permanent => "permanent",
            ErrorKind::Retriable => "retriable",
            ErrorKind::Fatal => "fatal",
        }
    }
}

/// Derived classification of a failed receipt. Never persisted on its own.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ErrorClassification {
    pub kind: ErrorKind,
    /// Confidence in `[0, 1]`.
    pub confidence: f32,
    /// The detection signal that produced `kind`.
    pub signal: String,
}
