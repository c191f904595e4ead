//! Wave scheduler: groups findings into priority waves, dispatches them
//! under a concurrency cap, polls to terminal, applies gating, and retries
//! failures.
//!
//! Ordering guarantees, in one place:
//! - within one session, updates apply in observation order and a terminal
//!   state never rolls back;
//! - across sessions in a wave there is no ordering at all;
//! - wave N+1 cannot start until every wave-N session is terminal and the
//!   gate has been evaluated;
//! - timeline events append in observation order.

use std::collections::HashMap;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use anyhow::Result;
use chrono::Utc;
use tokio::sync::Semaphore;

use crate::backend::AgentBackend;
use crate::config::Config;
use crate::ledger::IdempotencyLedger;
use crate::memory::MemoryStore;
use crate::model::{
    DataSource, EventKind, Finding, RemediationSession, RunStatus, SessionState, StructuredOutput,
    Wave, WaveStatus,
};
use crate::session::{
    create_remediation_session, determine_data_source, interpret_session_status, DispatchOutcome,
    ServiceOverride,
};
use crate::tracker::ProgressTracker;

/// Chunk priority-sorted findings into waves of `wave_size`, numbered 1..N.
/// Every session starts PENDING at attempt 1.
pub fn build_waves(findings: Vec<Finding>, wave_size: usize) -> Vec<Wave> {
    if findings.is_empty() || wave_size == 0 {
        return Vec::new();
    }

    findings
        .chunks(wave_size)
        .enumerate()
        .map(|(i, chunk)| {
            let wave_number = i as u32 + 1;
            Wave {
                wave_number,
                sessions: chunk
                    .iter()
                    .map(|f| RemediationSession::new(f.clone(), String::new(), wave_number))
                    .collect(),
                status: WaveStatus::Pending,
                success_count: 0,
                failure_count: 0,
            }
        })
        .collect()
}

/// Snapshot of one active session taken under the tracker lock, carried
/// across the poll I/O so the lock is never held over an await.
struct PollTarget {
    idx: usize,
    session_id: Option<String>,
    created_at: Option<chrono::DateTime<chrono::Utc>>,
    data_source: DataSource,
    status: SessionState,
}

pub struct WaveScheduler {
    /// Backend for the run's primary data source (remote in live/hybrid,
    /// simulated in mock).
    primary: Arc<dyn AgentBackend>,
    /// Simulated companion consulted per-session in hybrid mode.
    mock: Option<Arc<dyn AgentBackend>>,
    config: Arc<Config>,
    tracker: Arc<Mutex<ProgressTracker>>,
    ledger: Arc<tokio::sync::Mutex<IdempotencyLedger>>,
    run_id: String,
    memory_store: Option<MemoryStore>,
    overrides: Arc<HashMap<String, ServiceOverride>>,
    semaphore: Arc<Semaphore>,
}

impl WaveScheduler {
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        primary: Arc<dyn AgentBackend>,
        mock: Option<Arc<dyn AgentBackend>>,
        config: Arc<Config>,
        tracker: Arc<Mutex<ProgressTracker>>,
        ledger: Arc<tokio::sync::Mutex<IdempotencyLedger>>,
        run_id: String,
        memory_store: Option<MemoryStore>,
        overrides: HashMap<String, ServiceOverride>,
    ) -> Self {
        let permits = config.max_parallel_sessions.max(1);
        Self {
            primary,
            mock,
            config,
            tracker,
            ledger,
            run_id,
            memory_store,
            overrides: Arc::new(overrides),
            semaphore: Arc::new(Semaphore::new(permits)),
        }
    }

    fn backend_for(&self, data_source: DataSource) -> Arc<dyn AgentBackend> {
        match (&self.mock, data_source) {
            (Some(mock), DataSource::Mock) if self.config.hybrid_mode => Arc::clone(mock),
            _ => Arc::clone(&self.primary),
        }
    }

    fn data_source_for(&self, finding: &Finding) -> DataSource {
        determine_data_source(finding, &self.config)
    }

    fn is_interrupted(&self) -> bool {
        self.tracker.lock().unwrap().run().status == RunStatus::Interrupted
    }

    fn save(&self) {
        self.tracker.lock().unwrap().save_state();
    }

    /// Execute every wave in order. Stops early on interrupt or gating.
    pub async fn execute_run(&self) -> Result<()> {
        self.drain_stale_sessions().await;

        let wave_count = self.tracker.lock().unwrap().run().waves.len();
        for wave_idx in 0..wave_count {
            if self.is_interrupted() {
                tracing::info!("Run interrupted, stopping dispatch");
                break;
            }

            let wave_number = wave_idx as u32 + 1;
            {
                let mut tracker = self.tracker.lock().unwrap();
                tracing::info!("Wave {} started", wave_number);
                tracker.add_event(
                    EventKind::WaveStarted,
                    format!("Wave {wave_number} started"),
                    serde_json::json!({ "wave_number": wave_number }),
                );
                tracker.run_mut().waves[wave_idx].status = WaveStatus::Running;
                tracker.run_mut().status = RunStatus::Running;
            }
            self.save();

            let pending: Vec<usize> = {
                let tracker = self.tracker.lock().unwrap();
                tracker.run().waves[wave_idx]
                    .sessions
                    .iter()
                    .enumerate()
                    .filter(|(_, s)| s.status == SessionState::Pending)
                    .map(|(i, _)| i)
                    .collect()
            };
            self.dispatch_sessions(wave_idx, pending).await;

            if !self.poll_wave(wave_idx).await {
                // Interrupted mid-wave; state already persisted.
                break;
            }

            self.tracker.lock().unwrap().run_mut().waves[wave_idx].status = WaveStatus::Completed;
            self.cleanup_sessions(wave_idx).await;

            let (success, total, prs) = {
                let tracker = self.tracker.lock().unwrap();
                let wave = &tracker.run().waves[wave_idx];
                let prs = wave.sessions.iter().filter(|s| s.pr_url.is_some()).count();
                (wave.success_count, wave.total_count(), prs)
            };
            tracing::info!(
                "Wave {} completed: {}/{} succeeded, {} PRs",
                wave_number,
                success,
                total,
                prs
            );
            {
                let mut tracker = self.tracker.lock().unwrap();
                tracker.add_event(
                    EventKind::WaveCompleted,
                    format!("Wave {wave_number} completed: {success}/{total} succeeded, {prs} PRs"),
                    serde_json::json!({
                        "wave_number": wave_number,
                        "success": success,
                        "total": total,
                        "prs": prs,
                    }),
                );
            }
            self.save();

            let (gate_ok, success_rate) = self.check_gate(wave_idx);
            if !gate_ok {
                let mut tracker = self.tracker.lock().unwrap();
                tracker.run_mut().status = RunStatus::Paused;
                tracker.add_event(
                    EventKind::WaveGated,
                    "Wave gated",
                    serde_json::json!({
                        "wave_number": wave_number,
                        "success_rate": success_rate,
                        "threshold": self.config.min_success_rate,
                    }),
                );
                drop(tracker);
                self.save();
                break;
            }

            if !self.retry_failed(wave_idx).await {
                break;
            }
        }

        {
            let mut tracker = self.tracker.lock().unwrap();
            let status = tracker.run().status;
            if status != RunStatus::Paused && status != RunStatus::Interrupted {
                tracker.run_mut().status = RunStatus::Completed;
                tracker.add_event(EventKind::RunCompleted, "Run completed", serde_json::json!({}));
            }
        }
        self.save();
        Ok(())
    }

    /// Dispatch the given sessions concurrently, bounded by the semaphore.
    /// Each task works on a clone and the results are merged back under the
    /// tracker lock in completion order.
    async fn dispatch_sessions(&self, wave_idx: usize, indices: Vec<usize>) {
        if indices.is_empty() {
            return;
        }

        let mut tasks = Vec::with_capacity(indices.len());
        for idx in indices {
            let mut session = {
                let tracker = self.tracker.lock().unwrap();
                tracker.run().waves[wave_idx].sessions[idx].clone()
            };
            let data_source = self.data_source_for(&session.finding);
            let backend = self.backend_for(data_source);
            let config = Arc::clone(&self.config);
            let ledger = Arc::clone(&self.ledger);
            let run_id = self.run_id.clone();
            let memory_store = self.memory_store.clone();
            let overrides = Arc::clone(&self.overrides);
            let semaphore = Arc::clone(&self.semaphore);

            tasks.push(tokio::spawn(async move {
                let _permit = semaphore.acquire_owned().await.expect("semaphore closed");
                let outcome = create_remediation_session(
                    backend.as_ref(),
                    &mut session,
                    &config,
                    data_source,
                    &ledger,
                    &run_id,
                    memory_store.as_ref(),
                    &overrides,
                )
                .await;
                (idx, session, outcome)
            }));
        }

        for task in tasks {
            let (idx, session, outcome) = match task.await {
                Ok(result) => result,
                Err(e) => {
                    tracing::error!("Dispatch task panicked: {e}");
                    continue;
                }
            };

            let mut tracker = self.tracker.lock().unwrap();
            let finding_id = session.finding.finding_id.clone();
            let session_id = session.session_id.clone();
            let data_source = session.data_source;
            tracker.run_mut().waves[wave_idx].sessions[idx] = session;

            if outcome == DispatchOutcome::LedgerHit {
                tracker.add_event(
                    EventKind::IdempotencyHit,
                    format!("Reused existing session for {finding_id}"),
                    serde_json::json!({
                        "finding_id": finding_id,
                        "session_id": session_id,
                    }),
                );
            }
            tracker.add_event(
                EventKind::SessionStarted,
                format!("Session started for {finding_id}"),
                serde_json::json!({
                    "finding_id": finding_id,
                    "session_id": session_id,
                    "data_source": data_source.as_str(),
                }),
            );
            tracker.recount();
        }
        self.save();
    }

    /// Poll the wave's active sessions until all are terminal. Returns false
    /// when the run was interrupted before the wave drained.
    async fn poll_wave(&self, wave_idx: usize) -> bool {
        loop {
            if self.is_interrupted() {
                return false;
            }

            let targets: Vec<PollTarget> = {
                let tracker = self.tracker.lock().unwrap();
                tracker.run().waves[wave_idx]
                    .sessions
                    .iter()
                    .enumerate()
                    .filter(|(_, s)| s.status.is_active())
                    .map(|(idx, s)| PollTarget {
                        idx,
                        session_id: s.session_id.clone(),
                        created_at: s.created_at,
                        data_source: s.data_source,
                        status: s.status,
                    })
                    .collect()
            };
            if targets.is_empty() {
                return true;
            }

            let now = Utc::now();
            let timeout = self.config.session_timeout();
            let mut timed_out = Vec::new();
            let mut to_poll = Vec::new();
            for target in targets {
                let expired = target
                    .created_at
                    .map(|created| {
                        (now - created).to_std().unwrap_or(Duration::ZERO) > timeout
                    })
                    .unwrap_or(false);
                if expired {
                    timed_out.push(target);
                } else {
                    to_poll.push(target);
                }
            }

            for target in &timed_out {
                self.apply_timeout(wave_idx, target);
            }

            // Best-effort remote termination for everything that timed out.
            for target in &timed_out {
                if let Some(session_id) = &target.session_id {
                    let backend = self.backend_for(target.data_source);
                    if let Err(e) = backend.terminate_session_best_effort(session_id).await {
                        tracing::warn!("Could not terminate session {}: {}", session_id, e);
                    }
                }
            }

            let mut tasks = Vec::with_capacity(to_poll.len());
            for target in to_poll {
                let Some(session_id) = target.session_id.clone() else {
                    continue;
                };
                let backend = self.backend_for(target.data_source);
                let semaphore = Arc::clone(&self.semaphore);
                tasks.push(tokio::spawn(async move {
                    let _permit = semaphore.acquire_owned().await.expect("semaphore closed");
                    let result = backend.get_session(&session_id).await;
                    (target.idx, result)
                }));
            }

            for task in tasks {
                match task.await {
                    Ok((idx, Ok(snapshot))) => self.apply_poll_result(wave_idx, idx, snapshot),
                    Ok((idx, Err(e))) => {
                        tracing::error!("Failed to poll session at index {}: {}", idx, e);
                    }
                    Err(e) => tracing::error!("Poll task panicked: {e}"),
                }
            }

            self.tracker.lock().unwrap().recount();
            self.save();

            tokio::time::sleep(self.config.poll_interval()).await;
        }
    }

    /// Force a terminal transition for a session whose wall-clock budget is
    /// spent. A BLOCKED session fails; anything else times out.
    fn apply_timeout(&self, wave_idx: usize, target: &PollTarget) {
        let mut tracker = self.tracker.lock().unwrap();
        let session = &mut tracker.run_mut().waves[wave_idx].sessions[target.idx];
        if session.status.is_terminal() {
            return;
        }

        session.status = if target.status == SessionState::Blocked {
            SessionState::Failed
        } else {
            SessionState::Timeout
        };
        if session.error_message.is_none() {
            session.error_message = Some("Session timed out".to_string());
        }
        session.completed_at = Some(Utc::now());
        session.version += 1;

        let finding_id = session.finding.finding_id.clone();
        let session_id = session.session_id.clone();
        let error = session.error_message.clone();
        let status = session.status;
        tracker.add_event(
            EventKind::SessionFailed,
            format!("Session {finding_id} timed out"),
            serde_json::json!({
                "finding_id": finding_id,
                "session_id": session_id,
                "reason": "timeout",
                "status": status.as_str(),
                "error": error,
            }),
        );
    }

    /// Merge one poll snapshot into the tracked session.
    fn apply_poll_result(
        &self,
        wave_idx: usize,
        idx: usize,
        snapshot: crate::backend::SessionSnapshot,
    ) {
        let interpreted = interpret_session_status(&snapshot);
        let mut tracker = self.tracker.lock().unwrap();
        let session = &mut tracker.run_mut().waves[wave_idx].sessions[idx];

        // Terminal states never roll back; a colliding terminal observation
        // wins only with a later completed_at, and the version moves on both
        // attempts.
        if session.status.is_terminal() {
            if interpreted.state.is_terminal() && interpreted.state != session.status {
                let observed_at = Utc::now();
                if session.completed_at.map_or(true, |c| observed_at >= c) {
                    session.status = interpreted.state;
                    session.completed_at = Some(observed_at);
                    if let Some(pr_url) = interpreted.pr_url {
                        session.pr_url = Some(pr_url);
                    }
                }
                session.version += 1;
            }
            return;
        }

        let old_stage = session
            .structured_output
            .as_ref()
            .and_then(|so| so.status.clone());
        let mut new_stage = None;
        if let Some(raw) = &snapshot.structured_output {
            match serde_json::from_value::<StructuredOutput>(raw.clone()) {
                Ok(so) => {
                    new_stage = so.status.clone();
                    session.structured_output = Some(so);
                }
                Err(e) => tracing::warn!("Unparseable structured output: {e}"),
            }
        }

        // First observation of a PR URL is recorded even mid-flight.
        if session.pr_url.is_none() {
            if let Some(pr_url) = &interpreted.pr_url {
                session.pr_url = Some(pr_url.clone());
            }
        }

        let mut events = Vec::new();

        if interpreted.state.is_terminal() {
            session.status = interpreted.state;
            session.completed_at = Some(Utc::now());
            if let Some(error) = &interpreted.error_message {
                session.error_message = Some(error.clone());
            }
            let finding_id = session.finding.finding_id.clone();
            let session_id = session.session_id.clone();
            if interpreted.state == SessionState::Success {
                events.push((
                    EventKind::SessionCompleted,
                    format!("Session {finding_id} completed successfully"),
                    serde_json::json!({
                        "finding_id": finding_id,
                        "session_id": session_id,
                        "pr_url": session.pr_url,
                    }),
                ));
            } else {
                events.push((
                    EventKind::SessionFailed,
                    format!("Session {finding_id} failed with status {}", interpreted.state.as_str()),
                    serde_json::json!({
                        "finding_id": finding_id,
                        "session_id": session_id,
                        "error": session.error_message,
                    }),
                ));
            }
        } else {
            session.status = interpreted.state;
        }
        session.version += 1;

        // Stage transition in the structured output → progress event.
        if let Some(stage) = new_stage {
            if Some(&stage) != old_stage.as_ref() {
                let so = session.structured_output.as_ref();
                let finding_id = session.finding.finding_id.clone();
                let label = match stage.as_str() {
                    "analyzing" => "Analyzing vulnerability",
                    "fixing" => "Applying fix",
                    "testing" => "Running tests",
                    "creating_pr" => "Creating pull request",
                    "completed" => "Completed",
                    "failed" => "Failed",
                    other => other,
                };
                events.push((
                    EventKind::SessionProgress,
                    format!("{finding_id}: {label}"),
                    serde_json::json!({
                        "finding_id": finding_id,
                        "session_id": session.session_id,
                        "stage": stage,
                        "progress_pct": so.and_then(|s| s.progress_pct),
                        "current_step": so.and_then(|s| s.current_step.clone()),
                    }),
                ));
            }
        }

        for (kind, message, details) in events {
            tracker.add_event(kind, message, details);
        }
    }

    /// Gate on `successful / (successful + failed)` over this wave, retries
    /// included. An all-pending wave passes vacuously.
    fn check_gate(&self, wave_idx: usize) -> (bool, f64) {
        let tracker = self.tracker.lock().unwrap();
        let wave = &tracker.run().waves[wave_idx];
        let completed = wave.success_count + wave.failure_count;
        if completed == 0 {
            return (true, 0.0);
        }
        let success_rate = wave.success_count as f64 / completed as f64;
        (success_rate >= self.config.min_success_rate, success_rate)
    }

    /// Retry FAILED sessions with remaining attempts. Each retry is a new
    /// session record with a fresh idempotency key, dispatched and polled
    /// within this wave's bookkeeping. Returns false on interrupt.
    async fn retry_failed(&self, wave_idx: usize) -> bool {
        loop {
            let retry_indices: Vec<usize> = {
                let mut tracker = self.tracker.lock().unwrap();
                let wave = &tracker.run().waves[wave_idx];

                let retries: Vec<RemediationSession> = wave
                    .sessions
                    .iter()
                    .filter(|s| {
                        s.status == SessionState::Failed
                            && s.attempt < self.config.max_retries
                            && !wave.sessions.iter().any(|other| {
                                other.finding.finding_id == s.finding.finding_id
                                    && other.attempt == s.attempt + 1
                            })
                    })
                    .map(|s| s.retry_of())
                    .collect();

                if retries.is_empty() {
                    return true;
                }

                let mut indices = Vec::with_capacity(retries.len());
                for retry in retries {
                    tracker.add_event(
                        EventKind::SessionRetry,
                        format!(
                            "Retrying {} (attempt {})",
                            retry.finding.finding_id, retry.attempt
                        ),
                        serde_json::json!({
                            "finding_id": retry.finding.finding_id,
                            "attempt": retry.attempt,
                        }),
                    );
                    let wave = &mut tracker.run_mut().waves[wave_idx];
                    wave.sessions.push(retry);
                    indices.push(wave.sessions.len() - 1);
                }
                indices
            };
            self.save();

            self.dispatch_sessions(wave_idx, retry_indices).await;
            if !self.poll_wave(wave_idx).await {
                return false;
            }
        }
    }

    /// Terminate this wave's terminal sessions to free concurrent slots on
    /// the platform.
    async fn cleanup_sessions(&self, wave_idx: usize) {
        let targets: Vec<(String, DataSource)> = {
            let tracker = self.tracker.lock().unwrap();
            tracker.run().waves[wave_idx]
                .sessions
                .iter()
                .filter(|s| s.status.is_terminal())
                .filter_map(|s| s.session_id.clone().map(|id| (id, s.data_source)))
                .collect()
        };

        for (session_id, data_source) in targets {
            let backend = self.backend_for(data_source);
            match backend.terminate_session_best_effort(&session_id).await {
                Ok(()) => tracing::info!("Terminated session {:.16} to free concurrent slot", session_id),
                Err(e) => tracing::warn!("Could not terminate session {:.16}: {}", session_id, e),
            }
        }
    }

    /// Terminate sessions left over from previous runs so they do not eat
    /// concurrent slots, then close the breaker: cleanup failures must not
    /// block the run proper.
    async fn drain_stale_sessions(&self) {
        match self.primary.list_sessions(None, 20, 0).await {
            Ok(sessions) if !sessions.is_empty() => {
                tracing::info!(
                    "Found {} existing session(s) — terminating to free slots",
                    sessions.len()
                );
                for snapshot in sessions {
                    if snapshot.session_id.is_empty() {
                        continue;
                    }
                    if self
                        .primary
                        .terminate_session_best_effort(&snapshot.session_id)
                        .await
                        .is_ok()
                    {
                        tracing::info!("Terminated stale session {:.16}", snapshot.session_id);
                    }
                }
                // Give the platform a moment to release the slots.
                tokio::time::sleep(Duration::from_secs(3)).await;
            }
            Ok(_) => {}
            Err(e) => tracing::warn!("Could not drain stale sessions: {}", e),
        }
        self.primary.reset_circuit_breaker();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::backend::sim::SimulatedBackend;
    use crate::model::{BatchRun, FindingCategory, RunMode, Severity};
    use crate::store::StateStore;

    fn findings(n: usize) -> Vec<Finding> {
        (0..n)
            .map(|i| Finding {
                finding_id: format!("FIND-{i:04}"),
                scanner: "sast".into(),
                category: FindingCategory::SqlInjection,
                severity: Severity::High,
                title: format!("Finding {i}"),
                description: "d".into(),
                service_name: "payment-service".into(),
                repo_url: "https://g/acme/payment-service".into(),
                file_path: format!("src/f{i}.java"),
                line_number: Some(i as u32 + 1),
                cwe_id: Some("CWE-89".into()),
                dependency_name: None,
                current_version: None,
                fixed_version: None,
                language: Some("java".into()),
                priority_score: 80.0,
            })
            .collect()
    }

    struct Harness {
        scheduler: WaveScheduler,
        tracker: Arc<Mutex<ProgressTracker>>,
        store: StateStore,
        sim: Arc<SimulatedBackend>,
        _dir: tempfile::TempDir,
    }

    /// Engine wired to an accelerated simulator: a full wave completes in
    /// well under a second of wall time.
    fn harness(
        n_findings: usize,
        failure_rate: f64,
        configure: impl FnOnce(&mut Config),
    ) -> Harness {
        let dir = tempfile::tempdir().unwrap();
        let mut config = Config::for_tests(dir.path());
        config.wave_size = 10;
        config.poll_interval_seconds = 0.01;
        // 0.3s wall — comfortably above a scaled success (~25ms), well below
        // test patience.
        config.session_timeout_minutes = 0.005;
        config.max_retries = 2;
        configure(&mut config);

        let store = StateStore::new(&config.runs_dir, &config.state_file_path);
        let waves = build_waves(findings(n_findings), config.wave_size);
        let run = BatchRun::new("testrun1".into(), waves, RunMode::Mock);
        let tracker = Arc::new(Mutex::new(ProgressTracker::new(run, store.clone(), None)));
        let ledger = Arc::new(tokio::sync::Mutex::new(IdempotencyLedger::load(
            store.run_dir("testrun1").join("idempotency.json"),
        )));
        let sim = Arc::new(
            SimulatedBackend::seeded(1234)
                .with_time_scale(2000.0)
                .with_failure_rate(failure_rate),
        );

        let scheduler = WaveScheduler::new(
            Arc::clone(&sim) as Arc<dyn AgentBackend>,
            None,
            Arc::new(config),
            Arc::clone(&tracker),
            ledger,
            "testrun1".into(),
            None,
            HashMap::new(),
        );

        Harness {
            scheduler,
            tracker,
            store,
            sim,
            _dir: dir,
        }
    }

    #[test]
    fn waves_are_contiguous_and_sized() {
        let waves = build_waves(findings(23), 10);
        assert_eq!(waves.len(), 3);
        assert_eq!(
            waves.iter().map(|w| w.wave_number).collect::<Vec<_>>(),
            vec![1, 2, 3]
        );
        assert_eq!(waves[0].sessions.len(), 10);
        assert_eq!(waves[2].sessions.len(), 3);
        assert!(waves
            .iter()
            .flat_map(|w| &w.sessions)
            .all(|s| s.status == SessionState::Pending && s.attempt == 1));
        // Wave number stamped on each session.
        assert!(waves[1].sessions.iter().all(|s| s.wave_number == 2));
    }

    #[test]
    fn empty_findings_build_no_waves() {
        assert!(build_waves(vec![], 10).is_empty());
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn happy_path_single_wave_completes() {
        // Scenario: 5 findings, one wave, no designated failures. Generous
        // timeout: nothing here should ever hit it.
        let h = harness(5, 0.0, |c| {
            c.wave_size = 5;
            c.session_timeout_minutes = 0.05;
        });
        h.scheduler.execute_run().await.unwrap();

        let tracker = h.tracker.lock().unwrap();
        let run = tracker.run();
        assert_eq!(run.status, RunStatus::Completed);
        assert_eq!(run.waves.len(), 1);
        assert_eq!(run.waves[0].status, WaveStatus::Completed);
        assert_eq!(run.completed, 5);
        assert_eq!(run.successful, 5);
        assert_eq!(run.failed, 0);
        assert_eq!(run.prs_created, 5);
        assert_eq!(run.completed, run.successful + run.failed);
        assert!(run.sessions().all(|s| s.status == SessionState::Success));
        assert!(run.sessions().all(|s| s.version > 0));
        // Terminal timestamps are ordered.
        assert!(run
            .sessions()
            .all(|s| s.completed_at.unwrap() >= s.created_at.unwrap()));

        let count = |kind: EventKind| run.events.iter().filter(|e| e.event_type == kind).count();
        assert!(count(EventKind::SessionStarted) >= 5);
        assert_eq!(count(EventKind::SessionCompleted), 5);
        assert_eq!(count(EventKind::WaveCompleted), 1);
        assert_eq!(count(EventKind::RunCompleted), 1);

        // Persisted state matches the in-memory run.
        drop(tracker);
        let persisted = h.store.load_run_state("testrun1").unwrap().unwrap();
        assert_eq!(persisted.completed, 5);
        assert_eq!(persisted.status, RunStatus::Completed);
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn gating_pauses_run_before_next_wave() {
        // Scenario: 20 findings in 2 waves, every session fails → wave 1
        // gates and wave 2 is never dispatched.
        let h = harness(20, 1.0, |c| {
            c.wave_size = 10;
            c.min_success_rate = 0.7;
        });
        h.scheduler.execute_run().await.unwrap();

        let tracker = h.tracker.lock().unwrap();
        let run = tracker.run();
        assert_eq!(run.status, RunStatus::Paused);
        assert!(run.events.iter().any(|e| e.event_type == EventKind::WaveGated));

        // Wave 2 untouched: 10 sessions, all PENDING.
        assert_eq!(run.waves[1].sessions.len(), 10);
        assert!(run.waves[1]
            .sessions
            .iter()
            .all(|s| s.status == SessionState::Pending && s.session_id.is_none()));

        // Gating also suppresses retries, so exactly wave 1 hit the backend.
        drop(tracker);
        let sessions = h.sim.list_sessions(None, 100, 0).await.unwrap();
        assert_eq!(sessions.len(), 10);
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn retry_uses_fresh_ledger_key_and_new_session() {
        // Scenario: a failing finding is retried once; the ledger holds two
        // keys mapping to two distinct backend sessions.
        let h = harness(1, 1.0, |c| {
            c.wave_size = 5;
            c.min_success_rate = 0.0; // let the gate pass so the retry runs
            c.max_retries = 2;
        });
        h.scheduler.execute_run().await.unwrap();

        let tracker = h.tracker.lock().unwrap();
        let run = tracker.run();
        let wave = &run.waves[0];
        assert_eq!(wave.sessions.len(), 2, "retry appends a new record");
        assert_eq!(wave.sessions[0].attempt, 1);
        assert_eq!(wave.sessions[1].attempt, 2);
        assert!(wave.sessions.iter().all(|s| s.status.is_terminal()));
        assert_eq!(
            (wave.success_count + wave.failure_count) as usize,
            wave.sessions.len()
        );

        let id_1 = wave.sessions[0].session_id.clone().unwrap();
        let id_2 = wave.sessions[1].session_id.clone().unwrap();
        assert_ne!(id_1, id_2);

        assert!(run.events.iter().any(|e| e.event_type == EventKind::SessionRetry));
        drop(tracker);

        let ledger = IdempotencyLedger::load(h.store.run_dir("testrun1").join("idempotency.json"));
        assert_eq!(ledger.len(), 2);
        let key_1 = IdempotencyLedger::make_key("testrun1", "FIND-0000", 1);
        let key_2 = IdempotencyLedger::make_key("testrun1", "FIND-0000", 2);
        assert_eq!(ledger.lookup(&key_1).unwrap().session_id, id_1);
        assert_eq!(ledger.lookup(&key_2).unwrap().session_id, id_2);

        // create_session hit the backend exactly twice for this finding.
        let sessions = h.sim.list_sessions(None, 100, 0).await.unwrap();
        assert_eq!(sessions.len(), 2);
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn interrupt_stops_future_waves_and_persists() {
        // Scenario: interrupt lands during wave 2 of 3; wave 3 must never
        // dispatch and the interrupted state must be on disk.
        let h = harness(30, 1.0, |c| {
            c.wave_size = 10;
            c.min_success_rate = 0.0;
            c.max_retries = 1; // no retries, keep the timeline simple
            // Long enough that wave 2 is still polling when we interrupt.
            c.session_timeout_minutes = 0.05;
        });

        let tracker = Arc::clone(&h.tracker);
        let waiter = tokio::spawn(async move {
            // Wait until wave 2 has dispatched sessions, then interrupt.
            loop {
                {
                    let mut guard = tracker.lock().unwrap();
                    let wave2_active = guard.run().waves[1]
                        .sessions
                        .iter()
                        .any(|s| s.session_id.is_some());
                    if wave2_active {
                        guard.run_mut().status = RunStatus::Interrupted;
                        guard.add_event(
                            EventKind::RunInterrupted,
                            "Run interrupted by user",
                            serde_json::json!({}),
                        );
                        guard.save_state();
                        return;
                    }
                }
                tokio::time::sleep(Duration::from_millis(5)).await;
            }
        });

        h.scheduler.execute_run().await.unwrap();
        waiter.await.unwrap();

        let tracker = h.tracker.lock().unwrap();
        let run = tracker.run();
        assert_eq!(run.status, RunStatus::Interrupted);
        // Wave 3 never dispatched.
        assert!(run.waves[2]
            .sessions
            .iter()
            .all(|s| s.status == SessionState::Pending && s.session_id.is_none()));
        // Wave 2 sessions are either terminal or recorded as in flight.
        assert!(run.waves[1]
            .sessions
            .iter()
            .all(|s| s.status.is_terminal() || s.status.is_active()));
        drop(tracker);

        // A fresh engine invocation can observe state and ledger from disk.
        let persisted = h.store.load_run_state("testrun1").unwrap().unwrap();
        assert_eq!(persisted.status, RunStatus::Interrupted);
        let ledger = IdempotencyLedger::load(h.store.run_dir("testrun1").join("idempotency.json"));
        assert!(ledger.len() >= 10);
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn blocked_sessions_fail_once_timeout_elapses() {
        let h = harness(3, 1.0, |c| {
            c.wave_size = 3;
            c.min_success_rate = 0.0;
            c.max_retries = 1;
        });
        h.scheduler.execute_run().await.unwrap();

        let tracker = h.tracker.lock().unwrap();
        let run = tracker.run();
        assert_eq!(run.status, RunStatus::Completed);
        // Designated failures stall blocked, then fail at the timeout.
        assert!(run.sessions().all(|s| s.status == SessionState::Failed));
        assert!(run
            .sessions()
            .all(|s| s.error_message.is_some()));
        assert_eq!(run.failed, 3);
    }
}
