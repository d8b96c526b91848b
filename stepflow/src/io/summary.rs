//! Human-readable terminal summary (`summary.md`).

use std::fs;

use anyhow::{Context, Result};
use minijinja::{Environment, context};
use serde::Serialize;
use tracing::debug;

use crate::core::progress::RunRecord;
use crate::flow::Flow;
use crate::io::checkpoint::RunPaths;

const SUMMARY_TEMPLATE: &str = include_str!("templates/summary.md");

#[derive(Debug, Serialize)]
struct StepRow {
    id: String,
    attempts: u32,
    last_status: &'static str,
    bounces: u32,
    detours: u32,
}

/// Render the summary of a run's current state.
///
/// Names the receipt and handoff that triggered the transition when they
/// exist on disk.
pub fn render_summary(paths: &RunPaths, flow: &Flow, record: &RunRecord) -> Result<String> {
    let mut env = Environment::new();
    env.add_template("summary", SUMMARY_TEMPLATE)
        .context("load summary template")?;
    let template = env.get_template("summary")?;

    let (reason, step_id, attempt) = match &record.summary {
        Some(summary) => (
            summary.reason.as_str(),
            summary.step_id.as_deref(),
            summary.attempt,
        ),
        None => ("run has not finished", None, None),
    };
    let (receipt_path, handoff_path) = match (step_id, attempt) {
        (Some(step), Some(attempt)) => (
            existing(paths.receipt_path(step, attempt)),
            existing(paths.handoff_path(step, attempt)),
        ),
        _ => (None, None),
    };

    let steps: Vec<StepRow> = flow
        .steps
        .iter()
        .map(|step| {
            let progress = record.progress(&step.id);
            StepRow {
                id: step.id.clone(),
                attempts: progress.attempts,
                last_status: progress.last_status.map_or("-", |status| status.as_str()),
                bounces: progress.bounces,
                detours: progress.detours,
            }
        })
        .collect();

    let rendered = template.render(context! {
        run_id => &record.run_id,
        flow_id => &record.flow_id,
        status => record.status.as_str(),
        reason => reason,
        step_id => step_id,
        attempt => attempt,
        receipt_path => receipt_path,
        handoff_path => handoff_path,
        active_ms => record.active_ms,
        budget_ms => record.flow_budget_ms,
        breaker_phase => record.breaker.phase.as_str(),
        cumulative_failures => record.breaker.cumulative_failures,
        steps => steps,
    })?;
    Ok(rendered)
}

/// Render and write `summary.md`.
pub fn write_summary(paths: &RunPaths, flow: &Flow, record: &RunRecord) -> Result<()> {
    let rendered = render_summary(paths, flow, record)?;
    fs::write(&paths.summary_path, rendered)
        .with_context(|| format!("write summary {}", paths.summary_path.display()))?;
    debug!(path = %paths.summary_path.display(), "summary written");
    Ok(())
}

fn existing(path: std::path::PathBuf) -> Option<String> {
    path.is_file().then(|| path.display().to_string())
}
