//! Run record (`run.json`) and frozen flow (`flow.json`) storage.

use std::fs;
use std::path::Path;

use anyhow::{Context, Result};
use tracing::debug;

use crate::core::progress::RunRecord;
use crate::flow::Flow;
use crate::io::checkpoint::{RunPaths, to_json_bytes};

/// Load the run record from disk.
pub fn load_run_record(path: &Path) -> Result<RunRecord> {
    debug!(path = %path.display(), "loading run record");
    let contents =
        fs::read_to_string(path).with_context(|| format!("read run record {}", path.display()))?;
    let record: RunRecord = serde_json::from_str(&contents)
        .with_context(|| format!("parse run record {}", path.display()))?;
    debug!(run_id = %record.run_id, status = %record.status, position = record.position, "run record loaded");
    Ok(record)
}

/// Atomically write the run record to disk (temp file + rename).
pub fn write_run_record(path: &Path, record: &RunRecord) -> Result<()> {
    debug!(
        path = %path.display(),
        status = %record.status,
        position = record.position,
        applied_seq = record.applied_seq,
        "writing run record"
    );
    let buf = to_json_bytes(record)?;
    write_atomic(path, &buf)
}

/// Freeze the flow definition into the run directory. Never overwritten.
pub fn freeze_flow(paths: &RunPaths, flow: &Flow) -> Result<()> {
    if paths.flow_path.exists() {
        let frozen = load_frozen_flow(paths)?;
        if &frozen != flow {
            anyhow::bail!(
                "flow already frozen for this run differs: {}",
                paths.flow_path.display()
            );
        }
        return Ok(());
    }
    let buf = to_json_bytes(flow)?;
    write_atomic(&paths.flow_path, &buf)
}

pub fn load_frozen_flow(paths: &RunPaths) -> Result<Flow> {
    let path = &paths.flow_path;
    let contents =
        fs::read_to_string(path).with_context(|| format!("read frozen flow {}", path.display()))?;
    serde_json::from_str(&contents).with_context(|| format!("parse frozen flow {}", path.display()))
}

fn write_atomic(path: &Path, contents: &[u8]) -> Result<()> {
    let parent = path
        .parent()
        .with_context(|| format!("run record path missing parent {}", path.display()))?;
    fs::create_dir_all(parent).with_context(|| format!("create directory {}", parent.display()))?;
    let tmp_path = path.with_extension("json.tmp");
    fs::write(&tmp_path, contents)
        .with_context(|| format!("write temp {}", tmp_path.display()))?;
    fs::rename(&tmp_path, path).with_context(|| format!("replace {}", path.display()))?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::types::RunStatus;
    use crate::test_support::{flow, step, t0};

    /// Verifies write → read preserves all fields, including nested state.
    #[test]
    fn run_record_round_trips() {
        let temp = tempfile::tempdir().expect("tempdir");
        let path = temp.path().join("run.json");
        let f = flow(vec![step("build"), step("test")]);

        let mut record = RunRecord::new("run-1", &f, 60_000, t0());
        record.status = RunStatus::Running;
        record.position = 1;
        record.progress_mut("build").attempts = 2;
        record.breaker.cumulative_failures = 1;

        write_run_record(&path, &record).expect("write");
        let loaded = load_run_record(&path).expect("load");
        assert_eq!(loaded, record);
        assert!(!path.with_extension("json.tmp").exists());
    }

    #[test]
    fn frozen_flow_is_immutable() {
        let temp = tempfile::tempdir().expect("tempdir");
        let paths = RunPaths::new(temp.path(), "run-1");
        let f = flow(vec![step("build")]);
        freeze_flow(&paths, &f).expect("freeze");
        freeze_flow(&paths, &f).expect("refreeze identical");
        assert_eq!(load_frozen_flow(&paths).expect("load"), f);

        let other = flow(vec![step("build"), step("deploy")]);
        assert!(freeze_flow(&paths, &other).is_err());
    }
}
