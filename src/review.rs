//! Human-in-the-loop review path: an out-of-process writer that mutates one
//! session's review fields inside a persisted BatchRun.
//!
//! The whole operation runs under the per-run state file lock so concurrent
//! reviewers (and the engine itself) serialize: acquire → read → locate →
//! mutate → bump version → append event → atomic rename → release.

use std::path::Path;
use std::sync::OnceLock;
use std::time::Duration;

use chrono::Utc;
use regex::Regex;
use thiserror::Error;

use crate::model::{BatchRun, EventKind, RemediationSession, ReviewStatus, TimelineEvent};
use crate::store::atomic_write_json;
use crate::store::lock::FileLock;

/// Review decisions a reviewer may submit.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ReviewAction {
    Approved,
    Rejected,
}

impl ReviewAction {
    pub fn parse(raw: &str) -> Option<Self> {
        match raw {
            "approved" => Some(ReviewAction::Approved),
            "rejected" => Some(ReviewAction::Rejected),
            _ => None,
        }
    }

    fn status(self) -> ReviewStatus {
        match self {
            ReviewAction::Approved => ReviewStatus::Approved,
            ReviewAction::Rejected => ReviewStatus::Rejected,
        }
    }

    fn event_kind(self) -> EventKind {
        match self {
            ReviewAction::Approved => EventKind::ReviewApproved,
            ReviewAction::Rejected => EventKind::ReviewRejected,
        }
    }

    pub fn as_str(self) -> &'static str {
        match self {
            ReviewAction::Approved => "approved",
            ReviewAction::Rejected => "rejected",
        }
    }
}

#[derive(Debug, Error)]
pub enum ReviewError {
    /// Run id failed the charset check; nothing touched the filesystem.
    #[error("invalid run id")]
    InvalidRunId,

    #[error("run {0} not found")]
    RunNotFound(String),

    #[error("session {0} not found")]
    SessionNotFound(String),

    #[error("storage error: {0}")]
    Storage(#[from] anyhow::Error),
}

/// A review request. `reviewer` comes from the request auth context, never
/// from the body.
#[derive(Debug, Clone)]
pub struct ReviewRequest {
    pub run_id: String,
    pub session_id: String,
    pub action: ReviewAction,
    pub reason: Option<String>,
    pub reviewer: String,
}

fn run_id_pattern() -> &'static Regex {
    static PATTERN: OnceLock<Regex> = OnceLock::new();
    PATTERN.get_or_init(|| Regex::new(r"^[A-Za-z0-9-]+$").expect("static regex"))
}

/// Apply a review to the persisted run state. Returns the updated session.
///
/// Blocking (file lock + synchronous I/O); HTTP handlers call it via
/// `spawn_blocking`.
pub fn apply_review(runs_dir: &Path, request: &ReviewRequest) -> Result<RemediationSession, ReviewError> {
    // Path traversal guard before any filesystem access.
    if !run_id_pattern().is_match(&request.run_id) {
        return Err(ReviewError::InvalidRunId);
    }

    let state_path = runs_dir.join(&request.run_id).join("state.json");
    if !state_path.exists() {
        return Err(ReviewError::RunNotFound(request.run_id.clone()));
    }

    let _lock = FileLock::acquire(&state_path, "review", Duration::from_secs(5))
        .map_err(|e| ReviewError::Storage(e.into()))?;

    let text = std::fs::read_to_string(&state_path)
        .map_err(|e| ReviewError::Storage(anyhow::anyhow!("reading run state: {e}")))?;
    let mut run: BatchRun = serde_json::from_str(&text)
        .map_err(|e| ReviewError::Storage(anyhow::anyhow!("corrupt run state: {e}")))?;

    let session = run
        .waves
        .iter_mut()
        .flat_map(|w| w.sessions.iter_mut())
        .find(|s| {
            s.session_id.as_deref() == Some(request.session_id.as_str())
                || s.finding.finding_id == request.session_id
        })
        .ok_or_else(|| ReviewError::SessionNotFound(request.session_id.clone()))?;

    session.review_status = Some(request.action.status());
    session.reviewed_by = Some(request.reviewer.clone());
    session.reviewed_at = Some(Utc::now());
    session.review_reason = request.reason.clone();
    session.version += 1;
    let updated = session.clone();

    let finding_id = updated.finding.finding_id.clone();
    run.events.push(TimelineEvent::new(
        request.action.event_kind(),
        format!("Session {finding_id} {} by {}", request.action.as_str(), request.reviewer),
        serde_json::json!({
            "finding_id": finding_id,
            "session_id": updated.session_id,
            "reviewer": request.reviewer,
            "reason": request.reason,
        }),
    ));

    atomic_write_json(&state_path, &run)?;
    tracing::info!(
        "Review {} applied to session {} by {}",
        request.action.as_str(),
        request.session_id,
        request.reviewer
    );
    Ok(updated)
}
