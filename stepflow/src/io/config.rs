//! Kernel configuration stored at `.stepflow/config.toml`.

use std::collections::BTreeMap;
use std::fs;
use std::path::{Path, PathBuf};

use anyhow::{Context, Result, anyhow};
use serde::{Deserialize, Serialize};

use crate::core::breaker::BreakerPolicy;
use crate::core::deadline::ScopeLimits;
use crate::core::microloop::MicroloopPolicy;
use crate::core::router::RetryPolicy;

pub const DEFAULT_CONFIG_PATH: &str = ".stepflow/config.toml";
pub const DEFAULT_RUNS_DIR: &str = ".stepflow/runs";

/// Kernel configuration (TOML).
///
/// Intended to be edited by humans. Missing fields default to the values
/// below; step-level policies in a flow override the retry and microloop
/// sections per step.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(default)]
pub struct KernelConfig {
    /// Root directory holding one subdirectory per run.
    pub runs_dir: PathBuf,

    /// Truncate executor stdout/stderr logs beyond this many bytes.
    pub output_limit_bytes: usize,

    pub timeouts: TimeoutConfig,
    pub breaker: BreakerPolicy,
    pub retry: RetryPolicy,
    pub microloop: MicroloopPolicy,

    /// Executor reference -> argv for the command executor.
    pub agents: BTreeMap<String, Vec<String>>,
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(default)]
pub struct TimeoutConfig {
    pub flow: ScopeLimits,
    pub step: ScopeLimits,
    pub unit: ScopeLimits,
    /// How long a cancelled attempt may keep running to flush partial output.
    pub cancel_grace_ms: u64,
}

impl Default for TimeoutConfig {
    fn default() -> Self {
        const MINUTE: u64 = 60 * 1000;
        Self {
            flow: ScopeLimits::new(30 * MINUTE, 4 * 60 * MINUTE),
            step: ScopeLimits::new(10 * MINUTE, 60 * MINUTE),
            unit: ScopeLimits::new(5 * MINUTE, 30 * MINUTE),
            cancel_grace_ms: 5_000,
        }
    }
}

impl Default for KernelConfig {
    fn default() -> Self {
        Self {
            runs_dir: PathBuf::from(DEFAULT_RUNS_DIR),
            output_limit_bytes: 100_000,
            timeouts: TimeoutConfig::default(),
            breaker: BreakerPolicy::default(),
            retry: RetryPolicy::default(),
            microloop: MicroloopPolicy::default(),
            agents: BTreeMap::new(),
        }
    }
}

impl KernelConfig {
    pub fn validate(&self) -> Result<()> {
        if self.runs_dir.as_os_str().is_empty() {
            return Err(anyhow!("runs_dir must be non-empty"));
        }
        if self.output_limit_bytes == 0 {
            return Err(anyhow!("output_limit_bytes must be > 0"));
        }
        for (name, limits) in [
            ("flow", self.timeouts.flow),
            ("step", self.timeouts.step),
            ("unit", self.timeouts.unit),
        ] {
            if limits.soft_ms == 0 {
                return Err(anyhow!("timeouts.{name}.soft_ms must be > 0"));
            }
            if limits.soft_ms > limits.hard_ms {
                return Err(anyhow!(
                    "timeouts.{name}.soft_ms ({}) exceeds hard_ms ({})",
                    limits.soft_ms,
                    limits.hard_ms
                ));
            }
        }
        if self.breaker.failure_threshold == 0 {
            return Err(anyhow!("breaker.failure_threshold must be > 0"));
        }
        if self.breaker.escalate_after == 0 {
            return Err(anyhow!("breaker.escalate_after must be > 0"));
        }
        if self.retry.backoff_base_ms > self.retry.backoff_max_ms {
            return Err(anyhow!("retry.backoff_base_ms exceeds retry.backoff_max_ms"));
        }
        if self.microloop.default_limit == 0 || self.microloop.high_cost_limit == 0 {
            return Err(anyhow!("microloop limits must be > 0"));
        }
        for (name, argv) in &self.agents {
            if argv.first().is_none_or(|program| program.trim().is_empty()) {
                return Err(anyhow!("agents.{name} must be a non-empty array"));
            }
        }
        Ok(())
    }
}

/// Load config from a TOML file.
///
/// If the file is missing, returns `KernelConfig::default()`.
pub fn load_config(path: &Path) -> Result<KernelConfig> {
    if !path.exists() {
        let cfg = KernelConfig::default();
        cfg.validate()?;
        return Ok(cfg);
    }
    let contents = fs::read_to_string(path).with_context(|| format!("read {}", path.display()))?;
    let cfg: KernelConfig =
        toml::from_str(&contents).with_context(|| format!("parse {}", path.display()))?;
    cfg.validate()
        .with_context(|| format!("validate {}", path.display()))?;
    Ok(cfg)
}

/// Atomically write config to disk (temp file + rename).
pub fn write_config(path: &Path, cfg: &KernelConfig) -> Result<()> {
    cfg.validate()?;
    let mut buf = toml::to_string_pretty(cfg).context("serialize config toml")?;
    buf.push('\n');
    let parent = path
        .parent()
        .with_context(|| format!("config path missing parent {}", path.display()))?;
    fs::create_dir_all(parent).with_context(|| format!("create directory {}", parent.display()))?;
    let tmp_path = path.with_extension("toml.tmp");
    fs::write(&tmp_path, buf)
        .with_context(|| format!("write temp config {}", tmp_path.display()))?;
    fs::rename(&tmp_path, path).with_context(|| format!("replace config {}", path.display()))?;
    Ok(())
}
