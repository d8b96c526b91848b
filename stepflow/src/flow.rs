//! Flow definitions: ordered steps, declared regression edges, detour catalog.
//!
//! Flows are authored in TOML and frozen into the run directory as JSON when a
//! run is created. Once frozen a flow never changes for that run.

use std::collections::HashSet;
use std::fs;
use std::path::Path;

use anyhow::{Context, Result, bail};
use regex::Regex;
use serde::{Deserialize, Serialize};

use crate::core::signature::FailureSignature;

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Flow {
    pub id: String,
    /// Requested flow deadline; unset uses the configured flow soft default.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub deadline_ms: Option<u64>,
    pub steps: Vec<StepDef>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub detours: Vec<DetourRule>,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum StepRole {
    Producer,
    Critic,
    Decider,
    Gate,
    #[default]
    Worker,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct StepDef {
    pub id: String,
    /// Executor reference resolved by the step executor (e.g. an `[agents]` key).
    pub executor: String,
    #[serde(default)]
    pub role: StepRole,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub deadline_ms: Option<u64>,
    /// Work category; selects the high-cost microloop limit when listed.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub category: Option<String>,
    /// Declared regression edge to an earlier step.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub bounce_to: Option<String>,
    /// Producer this critic iterates with.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub loop_with: Option<String>,
    /// Off the linear path; only reachable through a detour.
    #[serde(default, skip_serializing_if = "std::ops::Not::not")]
    pub detour_only: bool,
    #[serde(default)]
    pub policy: StepPolicy,
}

/// Per-step overrides. Unset fields inherit kernel configuration.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct StepPolicy {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub max_transient_retries: Option<u32>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub max_retriable_retries: Option<u32>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub max_bounces: Option<u32>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub microloop_limit: Option<u32>,
}

/// Known failure signature with a known remediation step.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DetourRule {
    /// Catalog name recorded in the decision.
    pub signature: String,
    /// Step to detour to.
    pub target: String,
    /// Matches when the failure category starts with this prefix.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub category: Option<String>,
    /// Regex matched against the failure text.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub pattern: Option<DetourPattern>,
    /// Origin steps this rule applies to; empty applies to all.
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub from: Vec<String>,
}

impl DetourRule {
    pub fn matches(&self, origin: &str, signature: &FailureSignature) -> bool {
        if !self.from.is_empty() && !self.from.iter().any(|step| step == origin) {
            return false;
        }
        if let Some(prefix) = &self.category
            && !signature.category.starts_with(prefix.as_str())
        {
            return false;
        }
        match &self.pattern {
            Some(pattern) => pattern.is_match(&signature.text),
            None => self.category.is_some(),
        }
    }
}

/// Detour regex, compiled when the flow is parsed. An invalid pattern fails
/// the parse.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub struct DetourPattern(Regex);

impl DetourPattern {
    pub fn new(pattern: &str) -> Result<Self> {
        Regex::new(pattern)
            .map(Self)
            .with_context(|| format!("invalid detour pattern {pattern:?}"))
    }

    pub fn as_str(&self) -> &str {
        self.0.as_str()
    }

    pub fn is_match(&self, text: &str) -> bool {
        self.0.is_match(text)
    }
}

impl TryFrom<String> for DetourPattern {
    type Error = regex::Error;

    fn try_from(pattern: String) -> Result<Self, Self::Error> {
        Regex::new(&pattern).map(Self)
    }
}

impl From<DetourPattern> for String {
    fn from(pattern: DetourPattern) -> Self {
        pattern.as_str().to_string()
    }
}

impl PartialEq for DetourPattern {
    fn eq(&self, other: &Self) -> bool {
        self.as_str() == other.as_str()
    }
}

impl Eq for DetourPattern {}

impl Flow {
    pub fn index_of(&self, step_id: &str) -> Option<usize> {
        self.steps.iter().position(|step| step.id == step_id)
    }

    pub fn step(&self, step_id: &str) -> Option<&StepDef> {
        self.steps.iter().find(|step| step.id == step_id)
    }

    /// First step on the linear path.
    pub fn first_linear(&self) -> Option<usize> {
        self.steps.iter().position(|step| !step.detour_only)
    }

    /// Next linear step after `index`, skipping detour-only steps.
    pub fn next_linear(&self, index: usize) -> Option<usize> {
        self.steps
            .iter()
            .enumerate()
            .skip(index + 1)
            .find(|(_, step)| !step.detour_only)
            .map(|(idx, _)| idx)
    }

    /// First catalogued detour matching a failure at `origin`.
    pub fn match_detour(&self, origin: &str, signature: &FailureSignature) -> Option<&DetourRule> {
        self.detours
            .iter()
            .filter(|rule| rule.target != origin)
            .find(|rule| rule.matches(origin, signature))
    }
}

/// Check structural rules of a flow. Returns one message per violation.
pub fn validate_flow(flow: &Flow) -> Vec<String> {
    let mut errors = Vec::new();
    if let Err(err) = validate_id("flow id", &flow.id) {
        errors.push(err.to_string());
    }
    if flow.steps.is_empty() {
        errors.push("flow must declare at least one step".to_string());
    } else if flow.first_linear().is_none() {
        errors.push("flow must have at least one step that is not detour_only".to_string());
    }
    if flow.deadline_ms == Some(0) {
        errors.push("deadline_ms must be > 0".to_string());
    }

    let mut seen = HashSet::new();
    for (idx, step) in flow.steps.iter().enumerate() {
        if let Err(err) = validate_id("step id", &step.id) {
            errors.push(err.to_string());
        }
        if !seen.insert(step.id.as_str()) {
            errors.push(format!("duplicate step id '{}'", step.id));
        }
        if step.executor.trim().is_empty() {
            errors.push(format!("{}: executor must be non-empty", step.id));
        }
        if step.deadline_ms == Some(0) {
            errors.push(format!("{}: deadline_ms must be > 0", step.id));
        }
        if step.policy.microloop_limit == Some(0) {
            errors.push(format!("{}: policy.microloop_limit must be > 0", step.id));
        }
        if let Some(target) = &step.bounce_to {
            check_back_edge(flow, idx, step, "bounce_to", target, &mut errors);
        }
        if let Some(target) = &step.loop_with {
            check_back_edge(flow, idx, step, "loop_with", target, &mut errors);
            if step.role != StepRole::Critic {
                errors.push(format!("{}: loop_with requires role = \"critic\"", step.id));
            }
        }
    }

    for rule in &flow.detours {
        let name = &rule.signature;
        if name.trim().is_empty() {
            errors.push("detour signature name must be non-empty".to_string());
        }
        if flow.index_of(&rule.target).is_none() {
            errors.push(format!("detour '{name}': unknown target '{}'", rule.target));
        }
        if rule.category.is_none() && rule.pattern.is_none() {
            errors.push(format!("detour '{name}': needs a category or a pattern"));
        }
        for origin in &rule.from {
            if flow.index_of(origin).is_none() {
                errors.push(format!("detour '{name}': unknown origin '{origin}'"));
            }
        }
    }
    errors
}

fn check_back_edge(
    flow: &Flow,
    idx: usize,
    step: &StepDef,
    field: &str,
    target: &str,
    errors: &mut Vec<String>,
) {
    match flow.index_of(target) {
        None => errors.push(format!("{}: {field} target '{target}' does not exist", step.id)),
        Some(target_idx) if target_idx >= idx => errors.push(format!(
            "{}: {field} target '{target}' must be an earlier step",
            step.id
        )),
        Some(target_idx) if flow.steps[target_idx].detour_only => errors.push(format!(
            "{}: {field} target '{target}' must be on the linear path",
            step.id
        )),
        Some(_) => {}
    }
}

/// Ids become directory names; restrict them to `[A-Za-z0-9._-]`.
pub fn validate_id(kind: &str, id: &str) -> Result<()> {
    if id.is_empty() {
        bail!("{kind} must be non-empty");
    }
    if id == "." || id == ".." {
        bail!("{kind} '{id}' is reserved");
    }
    if let Some(bad) = id
        .chars()
        .find(|ch| !(ch.is_ascii_alphanumeric() || matches!(ch, '.' | '_' | '-')))
    {
        bail!("{kind} '{id}' contains invalid character {bad:?}");
    }
    Ok(())
}

/// Parse a flow from TOML text and validate it.
pub fn parse_flow(contents: &str) -> Result<Flow> {
    let flow: Flow = toml::from_str(contents).context("parse flow toml")?;
    let errors = validate_flow(&flow);
    if !errors.is_empty() {
        bail!("invalid flow '{}':\n  {}", flow.id, errors.join("\n  "));
    }
    Ok(flow)
}

/// Load and validate a flow definition from a TOML file.
pub fn load_flow(path: &Path) -> Result<Flow> {
    let contents = fs::read_to_string(path).with_context(|| format!("read {}", path.display()))?;
    parse_flow(&contents).with_context(|| format!("load flow {}", path.display()))
}
