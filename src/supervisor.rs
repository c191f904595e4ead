//! Run supervisor: the top-level driver for one remediation run.
//!
//! Builds the BatchRun, wires the backends (live, simulated, or both in
//! hybrid), runs preflight, executes waves, and on clean completion extracts
//! memory from every terminal session. An OS interrupt flips the run to
//! `interrupted`, persists state, and cancels in-flight client backoffs;
//! the scheduler then exits at the next wave boundary.

use std::collections::HashMap;
use std::path::PathBuf;
use std::sync::{Arc, Mutex};

use anyhow::{bail, Context, Result};
use chrono::Utc;
use tokio_util::sync::CancellationToken;

use crate::backend::remote::RemoteBackend;
use crate::backend::sim::SimulatedBackend;
use crate::backend::AgentBackend;
use crate::config::Config;
use crate::ledger::IdempotencyLedger;
use crate::memory::{extract_memories, MemoryStore};
use crate::model::{BatchRun, BootstrapMarker, BootstrapStatus, EventKind, Finding, RunStatus};
use crate::playbook::{assign_playbooks, ensure_playbooks_uploaded};
use crate::preflight::preflight_check;
use crate::scheduler::{build_waves, WaveScheduler};
use crate::session::load_service_overrides;
use crate::store::StateStore;
use crate::tracker::ProgressTracker;

/// Per-run invocation parameters that do not belong in the env config.
#[derive(Debug, Clone)]
pub struct RunOptions {
    pub run_id: String,
    pub csv_filename: Option<String>,
    pub playbooks_dir: PathBuf,
    pub service_overrides_path: PathBuf,
    /// Overrides the configured wave size when set.
    pub wave_size: Option<usize>,
    /// Restrict execution to a single wave number (debugging aid).
    pub only_wave: Option<u32>,
}

impl RunOptions {
    pub fn new(run_id: impl Into<String>) -> Self {
        Self {
            run_id: run_id.into(),
            csv_filename: None,
            playbooks_dir: PathBuf::from("playbooks"),
            service_overrides_path: PathBuf::from("service_overrides.json"),
            wave_size: None,
            only_wave: None,
        }
    }
}

/// The backend pair a run executes against. `cancel` aborts in-flight
/// hardened-client requests (including retry backoffs) on interrupt.
pub struct Backends {
    pub primary: Arc<dyn AgentBackend>,
    pub mock: Option<Arc<dyn AgentBackend>>,
    pub cancel: CancellationToken,
}

impl Backends {
    /// Default wiring per the configured mode: simulated for mock runs,
    /// hardened remote for live, both for hybrid.
    pub fn from_config(config: &Config) -> Self {
        let cancel = CancellationToken::new();
        if config.mock_mode {
            Self {
                primary: Arc::new(SimulatedBackend::new()),
                mock: None,
                cancel,
            }
        } else {
            let remote: Arc<dyn AgentBackend> =
                Arc::new(RemoteBackend::from_config(config, cancel.clone()));
            let mock = config
                .hybrid_mode
                .then(|| Arc::new(SimulatedBackend::new()) as Arc<dyn AgentBackend>);
            Self {
                primary: remote,
                mock,
                cancel,
            }
        }
    }
}

/// Execute a full run with default backends.
pub async fn execute_run(
    config: &Config,
    findings: Vec<Finding>,
    options: RunOptions,
) -> Result<BatchRun> {
    let backends = Backends::from_config(config);
    execute_run_with_backends(config, findings, options, backends).await
}

/// Execute a full run against caller-supplied backends.
pub async fn execute_run_with_backends(
    config: &Config,
    findings: Vec<Finding>,
    options: RunOptions,
    backends: Backends,
) -> Result<BatchRun> {
    let store = StateStore::new(&config.runs_dir, &config.state_file_path);
    let run_id = options.run_id.clone();
    let mode = config.run_mode();

    let wave_size = options.wave_size.unwrap_or(config.wave_size);
    let mut waves = build_waves(findings.clone(), wave_size);
    if let Some(only) = options.only_wave {
        waves.retain(|w| w.wave_number == only);
        if waves.is_empty() {
            bail!("Wave {only} not found");
        }
    }

    let run = BatchRun::new(run_id.clone(), waves, mode);
    tracing::info!(
        "Starting remediation run {} (mode: {}, findings: {}, waves: {})",
        run_id,
        mode.as_str(),
        run.total_findings,
        run.waves.len()
    );

    let tracker = Arc::new(Mutex::new(ProgressTracker::new(
        run,
        store.clone(),
        options.csv_filename.clone(),
    )));
    {
        let mut guard = tracker.lock().unwrap();
        guard.add_event(
            EventKind::RunStarted,
            format!("Remediation run {run_id} started"),
            serde_json::json!({ "mode": mode.as_str() }),
        );
        guard.save_state();
    }

    // Preflight gates everything; a failure leaves only the bootstrap marker
    // behind.
    let errors = preflight_check(
        backends.primary.as_ref(),
        config,
        &findings,
        &options.playbooks_dir,
    )
    .await;
    if !errors.is_empty() {
        for error in &errors {
            tracing::error!("Preflight: {}", error);
        }
        let reason = errors.join("; ");
        let _ = store.write_bootstrap(&BootstrapMarker {
            status: BootstrapStatus::FailedToSpawn,
            started_at: Utc::now(),
            run_id: run_id.clone(),
            pid: Some(std::process::id()),
            error: Some(reason.clone()),
        });
        bail!("Preflight failed: {reason}");
    }

    store
        .write_bootstrap(&BootstrapMarker {
            status: BootstrapStatus::Started,
            started_at: Utc::now(),
            run_id: run_id.clone(),
            pid: Some(std::process::id()),
            error: None,
        })
        .context("Writing bootstrap marker")?;
    store.write_pid(&run_id, std::process::id())?;

    // Upload playbooks and stamp ids onto the sessions.
    let playbook_ids = ensure_playbooks_uploaded(backends.primary.as_ref(), &options.playbooks_dir)
        .await
        .unwrap_or_else(|e| {
            tracing::warn!("Playbook upload failed: {e:#}");
            HashMap::new()
        });
    assign_playbooks(&mut tracker.lock().unwrap().run_mut().waves, &playbook_ids);

    // Cooperative interrupt: flip the status, persist, cancel client I/O.
    // The scheduler observes the flag between sweeps and wave boundaries.
    let stop_listening = CancellationToken::new();
    let listener = {
        let tracker = Arc::clone(&tracker);
        let client_cancel = backends.cancel.clone();
        let stop = stop_listening.clone();
        tokio::spawn(async move {
            tokio::select! {
                _ = stop.cancelled() => {}
                result = tokio::signal::ctrl_c() => {
                    if result.is_ok() {
                        tracing::info!("Interrupted — saving state and exiting gracefully");
                        let mut guard = tracker.lock().unwrap();
                        guard.run_mut().status = RunStatus::Interrupted;
                        guard.add_event(
                            EventKind::RunInterrupted,
                            "Run interrupted by user",
                            serde_json::json!({}),
                        );
                        guard.save_state();
                        drop(guard);
                        client_cancel.cancel();
                    }
                }
            }
        })
    };

    let ledger = Arc::new(tokio::sync::Mutex::new(IdempotencyLedger::load(
        store.run_dir(&run_id).join("idempotency.json"),
    )));
    let memory_store = MemoryStore::new(&config.memory_dir);
    let overrides = load_service_overrides(&options.service_overrides_path);

    let scheduler = WaveScheduler::new(
        Arc::clone(&backends.primary),
        backends.mock.clone(),
        Arc::new(config.clone()),
        Arc::clone(&tracker),
        ledger,
        run_id.clone(),
        Some(memory_store.clone()),
        overrides,
    );
    let result = scheduler.execute_run().await;

    stop_listening.cancel();
    let _ = listener.await;
    result?;

    let run = tracker.lock().unwrap().run().clone();

    // Memory extraction on clean completion only; failures are logged and
    // never fail the run.
    if run.status == RunStatus::Completed {
        match save_run_memories(&run, &memory_store) {
            Ok(count) if count > 0 => tracing::info!("Extracted {count} memory items"),
            Ok(_) => {}
            Err(e) => tracing::warn!("Memory extraction failed: {e:#}"),
        }
    }

    tracing::info!(
        "Run complete: {}/{} succeeded, {} PRs created, status {}",
        run.successful,
        run.total_findings,
        run.prs_created,
        run.status.as_str()
    );
    Ok(run)
}

/// Upsert a memory item for every terminal session of the run.
pub fn save_run_memories(run: &BatchRun, store: &MemoryStore) -> Result<usize> {
    let items = extract_memories(run);
    if items.is_empty() {
        return Ok(0);
    }
    let mut graph = store.load_graph();
    for item in &items {
        store.upsert(item, &mut graph)?;
    }
    store.save_graph(&graph)?;
    Ok(items.len())
}

/// Resolve the most recent run for status display: prefer the index, fall
/// back to the legacy pointer.
pub fn load_latest_run(config: &Config) -> Result<Option<BatchRun>> {
    let store = StateStore::new(&config.runs_dir, &config.state_file_path);
    if let Some(run) = store.latest_run()? {
        return Ok(Some(run));
    }
    match std::fs::read_to_string(&config.state_file_path) {
        Ok(text) => Ok(serde_json::from_str(&text).ok()),
        Err(_) => Ok(None),
    }
}
