//! Run-scoped idempotency ledger for session creation.
//!
//! Keys: `{run_id}-{finding_id}-attempt-{attempt}`. The attempt is part of
//! the key so a retry always maps to a fresh backend session instead of
//! being deduplicated against the failed one.

use std::collections::BTreeMap;
use std::path::{Path, PathBuf};

use anyhow::Result;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::store::atomic_write_json;

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LedgerEntry {
    pub session_id: String,
    pub created_at: DateTime<Utc>,
}

/// Persisted mapping from creation key to recorded session id.
///
/// The file lives at `runs/<run_id>/idempotency.json` and is written only by
/// the owning engine process; a corrupt or missing file loads as empty and
/// never aborts the run.
#[derive(Debug)]
pub struct IdempotencyLedger {
    path: PathBuf,
    entries: BTreeMap<String, LedgerEntry>,
}

impl IdempotencyLedger {
    pub fn load(path: impl Into<PathBuf>) -> Self {
        let path = path.into();
        let entries = match std::fs::read_to_string(&path) {
            Ok(text) => match serde_json::from_str(&text) {
                Ok(entries) => entries,
                Err(e) => {
                    tracing::warn!(
                        "Could not parse idempotency ledger {}: {} — starting fresh",
                        path.display(),
                        e
                    );
                    BTreeMap::new()
                }
            },
            Err(_) => BTreeMap::new(),
        };
        Self { path, entries }
    }

    pub fn make_key(run_id: &str, finding_id: &str, attempt: u32) -> String {
        format!("{run_id}-{finding_id}-attempt-{attempt}")
    }

    pub fn lookup(&self, key: &str) -> Option<&LedgerEntry> {
        self.entries.get(key)
    }

    /// Upsert an entry and persist before returning, so a crash after
    /// create_session cannot lose the recorded session id.
    pub fn record(&mut self, key: String, session_id: String, created_at: DateTime<Utc>) -> Result<()> {
        tracing::debug!("Idempotency recorded: {} -> {}", key, session_id);
        self.entries.insert(
            key,
            LedgerEntry {
                session_id,
                created_at,
            },
        );
        atomic_write_json(&self.path, &self.entries)
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn path(&self) -> &Path {
        &self.path
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn key_includes_attempt() {
        assert_eq!(
            IdempotencyLedger::make_key("r1", "FIND-0007", 1),
            "r1-FIND-0007-attempt-1"
        );
        assert_ne!(
            IdempotencyLedger::make_key("r1", "FIND-0007", 1),
            IdempotencyLedger::make_key("r1", "FIND-0007", 2)
        );
    }

    #[test]
    fn record_persists_and_reloads() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("idempotency.json");

        let mut ledger = IdempotencyLedger::load(&path);
        assert!(ledger.is_empty());

        let key = IdempotencyLedger::make_key("r1", "FIND-0001", 1);
        ledger.record(key.clone(), "sess-abc".into(), Utc::now()).unwrap();

        let reloaded = IdempotencyLedger::load(&path);
        assert_eq!(reloaded.lookup(&key).unwrap().session_id, "sess-abc");
    }

    #[test]
    fn corrupt_file_loads_as_empty() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("idempotency.json");
        std::fs::write(&path, "][ not json").unwrap();

        let ledger = IdempotencyLedger::load(&path);
        assert!(ledger.is_empty());
    }

    #[test]
    fn upsert_overwrites_same_key() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("idempotency.json");

        let mut ledger = IdempotencyLedger::load(&path);
        let key = IdempotencyLedger::make_key("r1", "FIND-0001", 1);
        ledger.record(key.clone(), "first".into(), Utc::now()).unwrap();
        ledger.record(key.clone(), "second".into(), Utc::now()).unwrap();

        assert_eq!(ledger.len(), 1);
        assert_eq!(ledger.lookup(&key).unwrap().session_id, "second");
    }
}
