//! Per-run state persistence: atomic JSON writes, the run index, and the
//! legacy state pointer.
//!
//! Layout under the runs directory:
//!
//! ```text
//! runs/
//!   index.json                  # RunSummary[], newest last
//!   <run_id>/
//!     findings.csv
//!     bootstrap.json
//!     pid
//!     state.json                # serialized BatchRun
//!     idempotency.json
//! state.json                    # legacy pointer, equals the latest run's state
//! ```
//!
//! Every JSON write goes through a sibling temp file plus rename. Writes that
//! out-of-process writers may race (per-run `state.json`, `index.json`) are
//! additionally serialized through the lock protocol in [`lock`].

pub mod lock;

use std::path::{Path, PathBuf};

use anyhow::{Context, Result};
use serde::Serialize;

use crate::model::{BatchRun, BootstrapMarker, RunSummary};
use lock::FileLock;

/// Serialize `data` and atomically replace `path` with it.
pub fn atomic_write_json<T: Serialize>(path: &Path, data: &T) -> Result<()> {
    if let Some(parent) = path.parent() {
        std::fs::create_dir_all(parent)
            .with_context(|| format!("Failed to create {}", parent.display()))?;
    }
    let mut tmp_name = path.as_os_str().to_os_string();
    tmp_name.push(".tmp");
    let tmp_path = PathBuf::from(tmp_name);

    let bytes = serde_json::to_vec_pretty(data).context("Failed to serialize JSON")?;
    std::fs::write(&tmp_path, bytes)
        .with_context(|| format!("Failed to write {}", tmp_path.display()))?;
    std::fs::rename(&tmp_path, path)
        .with_context(|| format!("Failed to finalize {}", path.display()))?;
    Ok(())
}

/// Filesystem store for run state, the run index, and the legacy pointer.
#[derive(Debug, Clone)]
pub struct StateStore {
    runs_dir: PathBuf,
    legacy_path: PathBuf,
}

impl StateStore {
    pub fn new(runs_dir: impl Into<PathBuf>, legacy_path: impl Into<PathBuf>) -> Self {
        Self {
            runs_dir: runs_dir.into(),
            legacy_path: legacy_path.into(),
        }
    }

    pub fn runs_dir(&self) -> &Path {
        &self.runs_dir
    }

    pub fn run_dir(&self, run_id: &str) -> PathBuf {
        self.runs_dir.join(run_id)
    }

    pub fn run_state_path(&self, run_id: &str) -> PathBuf {
        self.run_dir(run_id).join("state.json")
    }

    pub fn index_path(&self) -> PathBuf {
        self.runs_dir.join("index.json")
    }

    /// Write `runs/<run_id>/state.json`. The review path mutates this file
    /// from another process, so the write is taken under the file lock.
    pub fn save_run_state(&self, run: &BatchRun) -> Result<()> {
        let path = self.run_state_path(&run.run_id);
        let _lock = FileLock::acquire(&path, "engine", lock::DEFAULT_TIMEOUT)
            .with_context(|| format!("Locking {}", path.display()))?;
        atomic_write_json(&path, run)
    }

    /// Upsert this run's summary row into `runs/index.json` under the lock.
    /// New runs append, so the index stays in append order, newest last.
    pub fn upsert_index(&self, summary: &RunSummary) -> Result<()> {
        let path = self.index_path();
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)?;
        }
        let _lock = FileLock::acquire(&path, "engine", lock::DEFAULT_TIMEOUT)
            .with_context(|| format!("Locking {}", path.display()))?;

        let mut entries = read_index_unlocked(&path);
        match entries.iter_mut().find(|e| e.run_id == summary.run_id) {
            Some(existing) => *existing = summary.clone(),
            None => entries.push(summary.clone()),
        }
        atomic_write_json(&path, &entries)
    }

    /// Write the legacy `./state.json` pointer. Only the owning engine
    /// process touches it, so no lock — just the atomic rename.
    pub fn write_legacy(&self, run: &BatchRun) -> Result<()> {
        atomic_write_json(&self.legacy_path, run)
    }

    /// Read the run index. Absent or unparseable index reads as empty.
    pub fn load_index(&self) -> Vec<RunSummary> {
        read_index_unlocked(&self.index_path())
    }

    pub fn load_run_state(&self, run_id: &str) -> Result<Option<BatchRun>> {
        let path = self.run_state_path(run_id);
        match std::fs::read_to_string(&path) {
            Ok(text) => {
                let run = serde_json::from_str(&text)
                    .with_context(|| format!("Corrupt run state {}", path.display()))?;
                Ok(Some(run))
            }
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(None),
            Err(e) => Err(e).with_context(|| format!("Reading {}", path.display())),
        }
    }

    /// The most recently started run per the index, if any.
    pub fn latest_run(&self) -> Result<Option<BatchRun>> {
        let Some(entry) = self.load_index().into_iter().next_back() else {
            return Ok(None);
        };
        self.load_run_state(&entry.run_id)
    }

    pub fn write_bootstrap(&self, marker: &BootstrapMarker) -> Result<()> {
        let path = self.run_dir(&marker.run_id).join("bootstrap.json");
        atomic_write_json(&path, marker)
    }

    pub fn read_bootstrap(&self, run_id: &str) -> Option<BootstrapMarker> {
        let path = self.run_dir(run_id).join("bootstrap.json");
        let text = std::fs::read_to_string(path).ok()?;
        serde_json::from_str(&text).ok()
    }

    /// Record the spawned engine pid as plain text.
    pub fn write_pid(&self, run_id: &str, pid: u32) -> Result<()> {
        let dir = self.run_dir(run_id);
        std::fs::create_dir_all(&dir)?;
        std::fs::write(dir.join("pid"), pid.to_string())
            .with_context(|| format!("Writing pid for run {run_id}"))
    }
}

fn read_index_unlocked(path: &Path) -> Vec<RunSummary> {
    match std::fs::read_to_string(path) {
        Ok(text) => match serde_json::from_str::<Vec<RunSummary>>(&text) {
            Ok(entries) => entries,
            Err(e) => {
                tracing::warn!("Corrupt run index {}: {} — treating as empty", path.display(), e);
                Vec::new()
            }
        },
        Err(_) => Vec::new(),
    }
}
