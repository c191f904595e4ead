//! Session manager: prompt construction, data-source routing, idempotent
//! session creation, and backend status interpretation.

use std::collections::HashMap;
use std::path::Path;

use chrono::Utc;
use serde::Deserialize;

use crate::backend::{AgentBackend, CreateSessionRequest, SessionSnapshot};
use crate::config::Config;
use crate::ledger::IdempotencyLedger;
use crate::memory::{retrieve_memories, MemoryStore};
use crate::model::{DataSource, Finding, FindingCategory, RemediationSession, SessionState};

/// How many prior memories to inject into a prompt.
const MEMORY_CONTEXT_ITEMS: usize = 3;

/// JSON Schema (draft 7) for the structured output every session reports.
/// The first four properties are required at every report.
pub fn structured_output_schema() -> serde_json::Value {
    serde_json::json!({
        "type": "object",
        "properties": {
            "finding_id": {"type": "string"},
            "status": {
                "type": "string",
                "enum": ["analyzing", "fixing", "testing", "creating_pr", "completed", "failed"],
            },
            "progress_pct": {"type": "integer", "minimum": 0, "maximum": 100},
            "current_step": {"type": "string"},
            "fix_approach": {"type": ["string", "null"]},
            "files_modified": {"type": "array", "items": {"type": "string"}},
            "tests_passed": {"type": ["boolean", "null"]},
            "tests_added": {"type": "integer"},
            "pr_url": {"type": ["string", "null"]},
            "error_message": {"type": ["string", "null"]},
            "confidence": {"type": "string", "enum": ["high", "medium", "low"]},
        },
        "required": ["finding_id", "status", "progress_pct", "current_step"],
    })
}

/// Per-service prompt additions loaded from `service_overrides.json`.
#[derive(Debug, Clone, Default, Deserialize)]
pub struct ServiceOverride {
    #[serde(default)]
    pub test_command: Option<String>,
    #[serde(default)]
    pub branch_prefix: Option<String>,
    #[serde(default)]
    pub deployment_notes: Option<String>,
    #[serde(default)]
    pub custom_instructions: Option<String>,
}

/// Load service overrides. Missing or malformed file reads as empty.
pub fn load_service_overrides(path: &Path) -> HashMap<String, ServiceOverride> {
    match std::fs::read_to_string(path) {
        Ok(text) => match serde_json::from_str(&text) {
            Ok(map) => map,
            Err(e) => {
                tracing::warn!("Could not parse service overrides: {}", e);
                HashMap::new()
            }
        },
        Err(_) => HashMap::new(),
    }
}

/// Format the ranked memories for a finding into a prompt block with source
/// citations. None when nothing relevant exists.
pub fn build_memory_context(finding: &Finding, store: &MemoryStore) -> Option<String> {
    let memories = retrieve_memories(finding, store, MEMORY_CONTEXT_ITEMS);
    if memories.is_empty() {
        return None;
    }
    let parts: Vec<String> = memories
        .iter()
        .map(|m| format!("### {}\n\n{}", m.source_note, m.content))
        .collect();
    Some(parts.join("\n---\n\n"))
}

/// Construct the session prompt from a finding, optionally enriched with
/// memory context and service overrides.
pub fn build_remediation_prompt(
    finding: &Finding,
    memory_context: Option<&str>,
    overrides: &HashMap<String, ServiceOverride>,
    run_id: &str,
) -> String {
    let line = finding
        .line_number
        .map(|n| n.to_string())
        .unwrap_or_else(|| "N/A".to_string());
    let cwe = finding.cwe_id.as_deref().unwrap_or("N/A");

    let mut prompt = format!(
        "## Security Remediation Task\n\n\
         **Run ID**: {run_id}\n\
         **Finding ID**: {id}\n\
         **Service**: {service}\n\
         **Category**: {category}\n\
         **Severity**: {severity}\n\
         **File**: {file}\n\
         **Line**: {line}\n\
         **CWE**: {cwe}\n\n\
         **Title**: {title}\n\n\
         **Description**: {description}\n",
        id = finding.finding_id,
        service = finding.service_name,
        category = finding.category.as_str(),
        severity = finding.severity.as_str(),
        file = finding.file_path,
        title = finding.title,
        description = finding.description,
    );

    if finding.category == FindingCategory::DependencyVulnerability {
        prompt.push_str(&format!(
            "\n**Dependency**: {}\n**Current Version**: {}\n**Fixed Version**: {}\n",
            finding.dependency_name.as_deref().unwrap_or("N/A"),
            finding.current_version.as_deref().unwrap_or("N/A"),
            finding.fixed_version.as_deref().unwrap_or("N/A"),
        ));
    }
    if let Some(language) = &finding.language {
        prompt.push_str(&format!("\n**Language**: {language}\n"));
    }

    prompt.push_str(&format!(
        "\n## Instructions\n\
         1. Clone the repository at {repo}\n\
         2. Fix the vulnerability described above following the playbook instructions\n\
         3. Update structured output after each major step (analyzing, fixing, testing, creating_pr, completed)\n\
         4. Run existing tests and ensure they pass\n\
         5. Create a pull request with the fix on a new branch\n",
        repo = finding.repo_url,
    ));

    if let Some(ov) = overrides.get(&finding.service_name) {
        prompt.push_str(&format!(
            "\n## Service-Specific Instructions ({service})\n\
             - **Test Command**: {test}\n\
             - **Branch Prefix**: {branch}\n\
             - **Deployment Notes**: {deploy}\n\n{custom}\n",
            service = finding.service_name,
            test = ov.test_command.as_deref().unwrap_or("N/A"),
            branch = ov.branch_prefix.as_deref().unwrap_or("security/fix"),
            deploy = ov.deployment_notes.as_deref().unwrap_or("Standard deployment."),
            custom = ov.custom_instructions.as_deref().unwrap_or(""),
        ));
    }

    if let Some(memory) = memory_context {
        prompt.push_str(&format!(
            "\n## Prior Remediation Knowledge\n\
             The following context is from previous remediation sessions for similar findings.\n\
             Use this as reference but verify applicability to the current codebase.\n\n{memory}\n",
        ));
    }

    prompt
}

/// Per-session routing: live, mock, or — in hybrid mode — live iff the
/// finding's service matches a connected repo by substring in either
/// direction.
pub fn determine_data_source(finding: &Finding, config: &Config) -> DataSource {
    if config.mock_mode {
        return DataSource::Mock;
    }
    if !config.hybrid_mode {
        return DataSource::Live;
    }
    for repo in &config.connected_repos {
        if repo.contains(&finding.service_name) || finding.service_name.contains(repo.as_str()) {
            tracing::info!(
                "Hybrid routing: {} -> live (matched repo {})",
                finding.finding_id,
                repo
            );
            return DataSource::Live;
        }
    }
    tracing::info!("Hybrid routing: {} -> mock (no repo match)", finding.finding_id);
    DataSource::Mock
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DispatchOutcome {
    /// A backend session was created.
    Created,
    /// The ledger already had a session for this (finding, attempt).
    LedgerHit,
    /// Creation failed; the session carries the error.
    Failed,
}

/// Create the backend session for one remediation attempt, memoized through
/// the idempotency ledger. Backend errors are folded into the session as a
/// FAILED outcome; they never propagate.
///
/// The ledger sits behind a mutex because wave dispatch is concurrent; the
/// lock is never held across the backend call.
#[allow(clippy::too_many_arguments)]
pub async fn create_remediation_session(
    backend: &dyn AgentBackend,
    session: &mut RemediationSession,
    config: &Config,
    data_source: DataSource,
    ledger: &tokio::sync::Mutex<IdempotencyLedger>,
    run_id: &str,
    memory_store: Option<&MemoryStore>,
    overrides: &HashMap<String, ServiceOverride>,
) -> DispatchOutcome {
    let key = IdempotencyLedger::make_key(run_id, &session.finding.finding_id, session.attempt);

    let hit = ledger.lock().await.lookup(&key).cloned();
    if let Some(entry) = hit {
        tracing::info!("Idempotency hit: {} already has session {}", key, entry.session_id);
        session.session_id = Some(entry.session_id.clone());
        session.status = SessionState::Dispatched;
        session.data_source = data_source;
        session.created_at = Some(entry.created_at);
        session.version += 1;
        return DispatchOutcome::LedgerHit;
    }

    let memory_context = memory_store.and_then(|store| build_memory_context(&session.finding, store));
    let prompt = build_remediation_prompt(
        &session.finding,
        memory_context.as_deref(),
        overrides,
        run_id,
    );
    let tags = vec![
        format!("wave-{}", session.wave_number),
        session.finding.category.as_str().to_string(),
        session.finding.service_name.clone(),
    ];
    let playbook_id = (!session.playbook_id.is_empty()).then(|| session.playbook_id.clone());

    let request = CreateSessionRequest {
        prompt,
        playbook_id,
        tags: Some(tags),
        structured_output_schema: Some(structured_output_schema()),
        max_acu_limit: Some(config.max_acu_per_session),
        idempotent: true,
    };

    match backend.create_session(request).await {
        Ok(created) => {
            let now = Utc::now();
            session.session_id = Some(created.session_id.clone());
            session.backend_url = created.url;
            session.status = SessionState::Dispatched;
            session.data_source = data_source;
            session.created_at = Some(now);
            session.version += 1;

            // Upsert before the session is handed back to the scheduler; a
            // ledger write failure is logged, not fatal.
            if let Err(e) = ledger.lock().await.record(key, created.session_id.clone(), now) {
                tracing::warn!("Could not persist idempotency ledger: {e:#}");
            }
            tracing::info!(
                "Created session {} for finding {}",
                created.session_id,
                session.finding.finding_id
            );
            DispatchOutcome::Created
        }
        Err(e) => {
            tracing::error!(
                "Failed to create session for finding {}: {}",
                session.finding.finding_id,
                e
            );
            let now = Utc::now();
            session.status = SessionState::Failed;
            session.error_message = Some(e.to_string());
            session.created_at = Some(now);
            session.completed_at = Some(now);
            session.data_source = data_source;
            session.version += 1;
            DispatchOutcome::Failed
        }
    }
}

#[derive(Debug, Clone)]
pub struct InterpretedStatus {
    pub state: SessionState,
    pub pr_url: Option<String>,
    pub error_message: Option<String>,
}

/// Map a backend snapshot onto the internal lifecycle.
///
/// Platform semantics baked in here:
/// - `blocked` with a PR means the agent finished and is waiting for human
///   approval → SUCCESS.
/// - `blocked` without a PR means the agent is stuck → BLOCKED (transient).
/// - `suspend_requested`/`resume_requested`/`resumed` and unknown statuses
///   keep polling as WORKING.
pub fn interpret_session_status(snapshot: &SessionSnapshot) -> InterpretedStatus {
    let pr_url = snapshot
        .pull_request
        .as_ref()
        .and_then(|pr| pr.url.clone());
    let error_message = snapshot
        .structured_output
        .as_ref()
        .and_then(|so| so.get("error_message"))
        .and_then(|v| v.as_str())
        .map(str::to_owned);

    if snapshot.status_enum == "blocked" && pr_url.is_some() {
        tracing::info!("Session blocked with PR present — treating as success");
        return InterpretedStatus {
            state: SessionState::Success,
            pr_url,
            error_message,
        };
    }

    let state = match snapshot.status_enum.as_str() {
        "working" => SessionState::Working,
        "dispatched" => SessionState::Dispatched,
        "finished" => SessionState::Success,
        "blocked" => SessionState::Blocked,
        "expired" => SessionState::Timeout,
        "suspend_requested" | "resume_requested" | "resumed" => SessionState::Working,
        other => {
            if !other.is_empty() {
                tracing::warn!(
                    "Unknown backend status '{}' — treating as working (will keep polling)",
                    other
                );
            }
            SessionState::Working
        }
    };

    InterpretedStatus {
        state,
        pr_url,
        error_message,
    }
}
