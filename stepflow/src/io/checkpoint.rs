//! Append-only checkpoint store for receipts and handoffs.
//!
//! Layout under the runs directory:
//!
//! ```text
//! <run_id>/flow.json
//! <run_id>/run.json
//! <run_id>/events.jsonl
//! <run_id>/summary.md
//! <run_id>/CANCEL
//! <run_id>/steps/<step_id>/<attempt>/receipt.json
//! <run_id>/steps/<step_id>/<attempt>/handoff.json
//! <run_id>/steps/<step_id>/<attempt>/evidence/
//! ```
//!
//! Receipts and handoffs are written once. A write goes to a temp file, is
//! fsynced, and is then hard-linked into place, which fails if the target
//! already exists. Re-putting identical bytes is accepted; anything else is a
//! [`CheckpointConflictError`].

use std::fmt;
use std::fs::{self, File};
use std::io::{ErrorKind, Write};
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicU64, Ordering};

use anyhow::{Context, Result, bail};
use serde::Serialize;
use serde::de::DeserializeOwned;
use tracing::{debug, warn};

use crate::core::types::{Handoff, Receipt};

/// Per-process counter that keeps concurrent temp file names apart.
static TEMP_SEQ: AtomicU64 = AtomicU64::new(0);

pub const RECEIPT_FILE: &str = "receipt.json";
pub const HANDOFF_FILE: &str = "handoff.json";

/// A record already exists at `path` with different content.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CheckpointConflictError {
    pub path: PathBuf,
}

impl fmt::Display for CheckpointConflictError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "checkpoint conflict: {} already exists with different content",
            self.path.display()
        )
    }
}

impl std::error::Error for CheckpointConflictError {}

/// Well-known paths of one run directory.
#[derive(Debug, Clone)]
pub struct RunPaths {
    pub dir: PathBuf,
    pub flow_path: PathBuf,
    pub record_path: PathBuf,
    pub events_path: PathBuf,
    pub summary_path: PathBuf,
    pub cancel_path: PathBuf,
    pub steps_dir: PathBuf,
}

impl RunPaths {
    pub fn new(runs_dir: &Path, run_id: &str) -> Self {
        let dir = runs_dir.join(run_id);
        Self {
            flow_path: dir.join("flow.json"),
            record_path: dir.join("run.json"),
            events_path: dir.join("events.jsonl"),
            summary_path: dir.join("summary.md"),
            cancel_path: dir.join("CANCEL"),
            steps_dir: dir.join("steps"),
            dir,
        }
    }

    pub fn attempt_dir(&self, step_id: &str, attempt: u32) -> PathBuf {
        self.steps_dir.join(step_id).join(attempt.to_string())
    }

    pub fn receipt_path(&self, step_id: &str, attempt: u32) -> PathBuf {
        self.attempt_dir(step_id, attempt).join(RECEIPT_FILE)
    }

    pub fn handoff_path(&self, step_id: &str, attempt: u32) -> PathBuf {
        self.attempt_dir(step_id, attempt).join(HANDOFF_FILE)
    }

    pub fn evidence_dir(&self, step_id: &str, attempt: u32) -> PathBuf {
        self.attempt_dir(step_id, attempt).join("evidence")
    }
}

/// One persisted attempt. `handoff` is `None` while the attempt is in
/// progress (or was cut short before its decision was written).
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AttemptRecord {
    pub step_id: String,
    pub attempt: u32,
    pub receipt: Receipt,
    pub handoff: Option<Handoff>,
}

/// The latest finalized attempt of a run.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Checkpoint {
    pub step_id: String,
    pub receipt: Receipt,
    pub handoff: Handoff,
}

#[derive(Debug, Clone)]
pub struct CheckpointStore {
    runs_dir: PathBuf,
}

impl CheckpointStore {
    pub fn new(runs_dir: impl Into<PathBuf>) -> Self {
        Self {
            runs_dir: runs_dir.into(),
        }
    }

    pub fn runs_dir(&self) -> &Path {
        &self.runs_dir
    }

    pub fn paths(&self, run_id: &str) -> RunPaths {
        RunPaths::new(&self.runs_dir, run_id)
    }

    pub fn put_receipt(
        &self,
        run_id: &str,
        step_id: &str,
        attempt: u32,
        receipt: &Receipt,
    ) -> Result<PathBuf> {
        if receipt.run_id != run_id || receipt.step_id != step_id || receipt.attempt != attempt {
            bail!(
                "receipt identity {}/{}/{} does not match key {run_id}/{step_id}/{attempt}",
                receipt.run_id,
                receipt.step_id,
                receipt.attempt
            );
        }
        let path = self.paths(run_id).receipt_path(step_id, attempt);
        put_once(&path, receipt)?;
        debug!(path = %path.display(), seq = receipt.seq, "receipt persisted");
        Ok(path)
    }

    pub fn put_handoff(&self, run_id: &str, step_id: &str, handoff: &Handoff) -> Result<PathBuf> {
        if handoff.run_id != run_id || handoff.step_id != step_id {
            bail!(
                "handoff identity {}/{} does not match key {run_id}/{step_id}",
                handoff.run_id,
                handoff.step_id
            );
        }
        let paths = self.paths(run_id);
        if !paths.receipt_path(step_id, handoff.attempt).is_file() {
            bail!(
                "handoff for {step_id} attempt {} has no receipt",
                handoff.attempt
            );
        }
        let path = paths.handoff_path(step_id, handoff.attempt);
        put_once(&path, handoff)?;
        debug!(path = %path.display(), action = handoff.routing.recommendation.label(), "handoff persisted");
        Ok(path)
    }

    pub fn receipt(&self, run_id: &str, step_id: &str, attempt: u32) -> Result<Option<Receipt>> {
        read_optional(&self.paths(run_id).receipt_path(step_id, attempt))
    }

    pub fn handoff(&self, run_id: &str, step_id: &str, attempt: u32) -> Result<Option<Handoff>> {
        read_optional(&self.paths(run_id).handoff_path(step_id, attempt))
    }

    /// Receipts of one step ordered by attempt.
    pub fn receipts(&self, run_id: &str, step_id: &str) -> Result<Vec<Receipt>> {
        let mut receipts = Vec::new();
        for attempt in self.attempt_numbers(run_id, step_id)? {
            if let Some(receipt) = self.receipt(run_id, step_id, attempt)? {
                receipts.push(receipt);
            }
        }
        Ok(receipts)
    }

    /// Highest attempt number with a directory on disk (0 if none).
    pub fn max_attempt(&self, run_id: &str, step_id: &str) -> Result<u32> {
        Ok(self
            .attempt_numbers(run_id, step_id)?
            .last()
            .copied()
            .unwrap_or(0))
    }

    /// Every attempt with a receipt, ordered by sequence number.
    pub fn attempts(&self, run_id: &str) -> Result<Vec<AttemptRecord>> {
        let steps_dir = self.paths(run_id).steps_dir;
        let mut records = Vec::new();
        for step_id in list_dir_names(&steps_dir)? {
            for attempt in self.attempt_numbers(run_id, &step_id)? {
                let Some(receipt) = self.receipt(run_id, &step_id, attempt)? else {
                    continue;
                };
                let handoff = self.handoff(run_id, &step_id, attempt)?;
                records.push(AttemptRecord {
                    step_id: step_id.clone(),
                    attempt,
                    receipt,
                    handoff,
                });
            }
        }
        records.sort_by_key(|record| record.receipt.seq);
        Ok(records)
    }

    /// Most recent attempt (highest sequence) whose receipt and handoff both
    /// exist.
    pub fn latest_checkpoint(&self, run_id: &str) -> Result<Option<Checkpoint>> {
        let latest = self
            .attempts(run_id)?
            .into_iter()
            .rev()
            .find_map(|record| {
                record.handoff.map(|handoff| Checkpoint {
                    step_id: record.step_id,
                    receipt: record.receipt,
                    handoff,
                })
            });
        Ok(latest)
    }

    /// Run ids with a run record, in directory order.
    pub fn run_ids(&self) -> Result<Vec<String>> {
        let mut ids = Vec::new();
        for name in list_dir_names(&self.runs_dir)? {
            if RunPaths::new(&self.runs_dir, &name).record_path.is_file() {
                ids.push(name);
            }
        }
        Ok(ids)
    }

    fn attempt_numbers(&self, run_id: &str, step_id: &str) -> Result<Vec<u32>> {
        let step_dir = self.paths(run_id).steps_dir.join(step_id);
        let mut numbers: Vec<u32> = list_dir_names(&step_dir)?
            .iter()
            .filter_map(|name| name.parse().ok())
            .collect();
        numbers.sort_unstable();
        Ok(numbers)
    }
}

/// Sorted names of the subdirectories of `dir` (empty if `dir` is missing).
fn list_dir_names(dir: &Path) -> Result<Vec<String>> {
    let entries = match fs::read_dir(dir) {
        Ok(entries) => entries,
        Err(err) if err.kind() == ErrorKind::NotFound => return Ok(Vec::new()),
        Err(err) => return Err(err).with_context(|| format!("read dir {}", dir.display())),
    };
    let mut names = Vec::new();
    for entry in entries {
        let entry = entry.with_context(|| format!("read dir entry in {}", dir.display()))?;
        if !entry.file_type().is_ok_and(|kind| kind.is_dir()) {
            continue;
        }
        if let Some(name) = entry.file_name().to_str() {
            names.push(name.to_string());
        }
    }
    names.sort();
    Ok(names)
}

fn read_optional<T: DeserializeOwned>(path: &Path) -> Result<Option<T>> {
    let contents = match fs::read_to_string(path) {
        Ok(contents) => contents,
        Err(err) if err.kind() == ErrorKind::NotFound => return Ok(None),
        Err(err) => return Err(err).with_context(|| format!("read {}", path.display())),
    };
    let value =
        serde_json::from_str(&contents).with_context(|| format!("parse {}", path.display()))?;
    Ok(Some(value))
}

/// Pretty JSON with a trailing newline, the on-disk format for all records.
pub fn to_json_bytes<T: Serialize>(value: &T) -> Result<Vec<u8>> {
    let mut buf = serde_json::to_vec_pretty(value).context("serialize json")?;
    buf.push(b'\n');
    Ok(buf)
}

fn put_once<T: Serialize>(path: &Path, value: &T) -> Result<()> {
    let bytes = to_json_bytes(value)?;
    if path.exists() {
        return check_identical(path, &bytes);
    }

    let parent = path
        .parent()
        .with_context(|| format!("checkpoint path missing parent {}", path.display()))?;
    fs::create_dir_all(parent).with_context(|| format!("create directory {}", parent.display()))?;
    let file_name = path
        .file_name()
        .and_then(|name| name.to_str())
        .unwrap_or("record");
    let nonce = TEMP_SEQ.fetch_add(1, Ordering::Relaxed);
    let tmp_path = parent.join(format!(".{file_name}.{}.{nonce}.tmp", std::process::id()));

    {
        let mut tmp = File::create(&tmp_path)
            .with_context(|| format!("create temp {}", tmp_path.display()))?;
        tmp.write_all(&bytes)
            .with_context(|| format!("write temp {}", tmp_path.display()))?;
        tmp.sync_all()
            .with_context(|| format!("fsync temp {}", tmp_path.display()))?;
    }

    let linked = fs::hard_link(&tmp_path, path);
    if let Err(err) = fs::remove_file(&tmp_path) {
        warn!(path = %tmp_path.display(), err = %err, "failed to remove temp checkpoint");
    }
    match linked {
        Ok(()) => {}
        Err(err) if err.kind() == ErrorKind::AlreadyExists => {
            return check_identical(path, &bytes);
        }
        Err(err) => {
            return Err(err).with_context(|| format!("link {} into place", path.display()));
        }
    }

    // Persist the directory entry as well.
    if let Err(err) = File::open(parent).and_then(|dir| dir.sync_all()) {
        debug!(path = %parent.display(), err = %err, "directory fsync not supported");
    }
    Ok(())
}

fn check_identical(path: &Path, bytes: &[u8]) -> Result<()> {
    let existing = fs::read(path).with_context(|| format!("read {}", path.display()))?;
    if existing == bytes {
        debug!(path = %path.display(), "identical checkpoint already present");
        return Ok(());
    }
    Err(CheckpointConflictError {
        path: path.to_path_buf(),
    }
    .into())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::types::{RoutingDecision, StepStatus};
    use crate::test_support::{handoff_for, receipt};

    fn stored_receipt(step: &str, attempt: u32, seq: u64) -> Receipt {
        let mut r = receipt(step, attempt, StepStatus::Succeeded);
        r.seq = seq;
        r
    }

    #[test]
    fn run_paths_are_stable() {
        let temp = tempfile::tempdir().expect("tempdir");
        let paths = RunPaths::new(temp.path(), "run-1");
        assert!(paths.record_path.ends_with("run-1/run.json"));
        assert!(
            paths
                .receipt_path("build", 2)
                .ends_with("run-1/steps/build/2/receipt.json")
        );
        assert!(paths.evidence_dir("build", 2).ends_with("steps/build/2/evidence"));
    }

    /// Receipts are append-only: identical re-puts succeed, rewrites fail.
    #[test]
    fn receipts_are_write_once() {
        let temp = tempfile::tempdir().expect("tempdir");
        let store = CheckpointStore::new(temp.path());
        let r = stored_receipt("build", 1, 1);

        let path = store.put_receipt(&r.run_id, "build", 1, &r).expect("put");
        let first = fs::read(&path).expect("read");
        store.put_receipt(&r.run_id, "build", 1, &r).expect("idempotent put");
        assert_eq!(fs::read(&path).expect("read"), first);

        let mut changed = r.clone();
        changed.status = StepStatus::Failed;
        let err = store
            .put_receipt(&r.run_id, "build", 1, &changed)
            .expect_err("conflict");
        assert!(err.downcast_ref::<CheckpointConflictError>().is_some());
        assert_eq!(
            store.receipt(&r.run_id, "build", 1).expect("read"),
            Some(r)
        );
    }

    /// Racing writers of one key: exactly one version lands, the rest either
    /// match it or get a conflict, and no temp files are left behind.
    #[test]
    fn concurrent_writers_of_one_key_never_mix() {
        let temp = tempfile::tempdir().expect("tempdir");
        let store = CheckpointStore::new(temp.path());
        let versions: Vec<Receipt> = (0..8)
            .map(|n| {
                let mut r = stored_receipt("build", 1, 1);
                r.message = Some(format!("writer {} {}", n % 2, "x".repeat(4096)));
                r
            })
            .collect();

        let shared = &store;
        let results: Vec<Result<PathBuf>> = std::thread::scope(|scope| {
            let handles: Vec<_> = versions
                .iter()
                .map(|r| scope.spawn(move || shared.put_receipt(&r.run_id, "build", 1, r)))
                .collect();
            handles
                .into_iter()
                .map(|handle| handle.join().expect("join"))
                .collect()
        });

        let stored = store
            .receipt("run-test", "build", 1)
            .expect("read")
            .expect("receipt");
        assert!(versions.contains(&stored));
        for (r, result) in versions.iter().zip(&results) {
            match result {
                Ok(_) => assert_eq!(r, &stored),
                Err(err) => assert!(err.downcast_ref::<CheckpointConflictError>().is_some(), "{err:#}"),
            }
        }
        let attempt_dir = store.paths("run-test").attempt_dir("build", 1);
        let leftovers: Vec<_> = fs::read_dir(&attempt_dir)
            .expect("read dir")
            .filter_map(|entry| entry.ok())
            .filter(|entry| entry.file_name().to_string_lossy().ends_with(".tmp"))
            .collect();
        assert!(leftovers.is_empty());
    }

    #[test]
    fn receipt_key_must_match_content() {
        let temp = tempfile::tempdir().expect("tempdir");
        let store = CheckpointStore::new(temp.path());
        let r = stored_receipt("build", 1, 1);
        assert!(store.put_receipt(&r.run_id, "build", 2, &r).is_err());
    }

    #[test]
    fn handoff_requires_receipt() {
        let temp = tempfile::tempdir().expect("tempdir");
        let store = CheckpointStore::new(temp.path());
        let r = stored_receipt("build", 1, 1);
        let h = handoff_for(&r, RoutingDecision::Advance);
        assert!(store.put_handoff(&r.run_id, "build", &h).is_err());
    }

    #[test]
    fn latest_checkpoint_skips_attempt_without_handoff() {
        let temp = tempfile::tempdir().expect("tempdir");
        let store = CheckpointStore::new(temp.path());
        let first = stored_receipt("build", 1, 1);
        let second = stored_receipt("test", 1, 2);
        let third = stored_receipt("test", 2, 3);
        for r in [&first, &second, &third] {
            store
                .put_receipt(&r.run_id, &r.step_id, r.attempt, r)
                .expect("put receipt");
        }
        for r in [&first, &second] {
            let h = handoff_for(r, RoutingDecision::Advance);
            store.put_handoff(&r.run_id, &r.step_id, &h).expect("put handoff");
        }

        let latest = store
            .latest_checkpoint(&first.run_id)
            .expect("latest")
            .expect("some checkpoint");
        assert_eq!(latest.step_id, "test");
        assert_eq!(latest.receipt.attempt, 1);

        let attempts = store.attempts(&first.run_id).expect("attempts");
        assert_eq!(attempts.len(), 3);
        assert!(attempts[2].handoff.is_none());
        assert_eq!(store.max_attempt(&first.run_id, "test").expect("max"), 2);
        assert_eq!(store.receipts(&first.run_id, "test").expect("receipts").len(), 2);
    }

    #[test]
    fn empty_run_has_no_checkpoint() {
        let temp = tempfile::tempdir().expect("tempdir");
        let store = CheckpointStore::new(temp.path());
        assert_eq!(store.latest_checkpoint("run-x").expect("latest"), None);
        assert_eq!(store.max_attempt("run-x", "build").expect("max"), 0);
        assert!(store.run_ids().expect("ids").is_empty());
    }
}
