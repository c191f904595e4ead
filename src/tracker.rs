//! Progress tracker: the authoritative in-memory BatchRun, aggregate
//! counters, the timeline, and state persistence.
//!
//! Counters are always recounted from the sessions themselves rather than
//! incremented, so a missed update can never skew them.

use serde::Serialize;

use crate::model::{
    BatchRun, EventKind, RunStatus, RunSummary, SessionState, TimelineEvent,
};
use crate::store::StateStore;

pub struct ProgressTracker {
    run: BatchRun,
    store: StateStore,
    csv_filename: Option<String>,
}

/// Aggregate snapshot for the CLI status view and the legacy endpoint.
#[derive(Debug, Clone, Serialize)]
pub struct RunSnapshot {
    pub run_id: String,
    pub status: RunStatus,
    pub total_findings: usize,
    pub completed: usize,
    pub successful: usize,
    pub failed: usize,
    pub prs_created: usize,
    pub success_rate: f64,
    pub active_sessions: usize,
    pub pending_reviews: usize,
    pub current_wave: u32,
}

impl ProgressTracker {
    pub fn new(run: BatchRun, store: StateStore, csv_filename: Option<String>) -> Self {
        Self {
            run,
            store,
            csv_filename,
        }
    }

    pub fn run(&self) -> &BatchRun {
        &self.run
    }

    pub fn run_mut(&mut self) -> &mut BatchRun {
        &mut self.run
    }

    pub fn into_run(self) -> BatchRun {
        self.run
    }

    /// Recount every aggregate from ground truth: terminal sessions,
    /// success/failure partitions, per-wave counts, PRs.
    pub fn recount(&mut self) {
        let mut completed = 0;
        let mut successful = 0;
        let mut failed = 0;
        let mut prs_created = 0;

        for wave in &mut self.run.waves {
            let mut wave_success = 0;
            let mut wave_failure = 0;

            for session in &wave.sessions {
                if session.status.is_terminal() {
                    completed += 1;
                }
                match session.status {
                    SessionState::Success => {
                        successful += 1;
                        wave_success += 1;
                    }
                    SessionState::Failed | SessionState::Timeout => {
                        failed += 1;
                        wave_failure += 1;
                    }
                    _ => {}
                }
                if session.pr_url.is_some() {
                    prs_created += 1;
                }
            }

            wave.success_count = wave_success;
            wave.failure_count = wave_failure;
        }

        self.run.completed = completed;
        self.run.successful = successful;
        self.run.failed = failed;
        self.run.prs_created = prs_created;
    }

    /// Append a timeline event. Insertion order is the only ordering.
    pub fn add_event(&mut self, kind: EventKind, message: impl Into<String>, details: serde_json::Value) {
        self.run.events.push(TimelineEvent::new(kind, message, details));
    }

    /// Persist to the three targets in order: per-run state, run index
    /// (under lock), legacy pointer. Persistence failures are logged and
    /// swallowed — a full disk must not kill the run mid-wave.
    pub fn save_state(&self) {
        if let Err(e) = self.store.save_run_state(&self.run) {
            tracing::error!("Could not persist run state: {e:#}");
        }
        let summary = RunSummary {
            run_id: self.run.run_id.clone(),
            started_at: self.run.started_at,
            status: self.run.status,
            total_findings: self.run.total_findings,
            csv_filename: self.csv_filename.clone(),
            data_source: self.run.data_source,
        };
        if let Err(e) = self.store.upsert_index(&summary) {
            tracing::error!("Could not update run index: {e:#}");
        }
        if let Err(e) = self.store.write_legacy(&self.run) {
            tracing::error!("Could not write legacy state pointer: {e:#}");
        }
    }

    /// Aggregate stats over the current run.
    pub fn snapshot(&self) -> RunSnapshot {
        let mut active_sessions = 0;
        let mut pending_reviews = 0;
        let mut current_wave = 0;

        for wave in &self.run.waves {
            let mut has_non_pending = false;
            for session in &wave.sessions {
                if matches!(session.status, SessionState::Dispatched | SessionState::Working) {
                    active_sessions += 1;
                }
                if session.pr_url.is_some() && session.review_status.is_none() {
                    pending_reviews += 1;
                }
                if session.status != SessionState::Pending {
                    has_non_pending = true;
                }
            }
            if has_non_pending && wave.wave_number > current_wave {
                current_wave = wave.wave_number;
            }
        }

        let success_rate = if self.run.completed > 0 {
            self.run.successful as f64 / self.run.completed as f64
        } else {
            0.0
        };

        RunSnapshot {
            run_id: self.run.run_id.clone(),
            status: self.run.status,
            total_findings: self.run.total_findings,
            completed: self.run.completed,
            successful: self.run.successful,
            failed: self.run.failed,
            prs_created: self.run.prs_created,
            success_rate,
            active_sessions,
            pending_reviews,
            current_wave,
        }
    }
}
