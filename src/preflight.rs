//! Pre-dispatch validation. Any failure aborts the run before the first
//! wave, with a human-readable reason per check.

use std::collections::HashSet;
use std::path::Path;

use crate::backend::AgentBackend;
use crate::config::Config;
use crate::model::Finding;
use crate::playbook::playbook_path;

/// Run all preflight checks. An empty vector means the run may proceed.
///
/// Checks:
/// 1. API key present (skipped in mock mode)
/// 2. Backend reachable via `list_sessions(limit=1)` (skipped in mock mode)
/// 3. A playbook file exists on disk for every finding category
/// 4. `connected_repos` non-empty when hybrid mode is on
/// 5. At least one finding
pub async fn preflight_check(
    backend: &dyn AgentBackend,
    config: &Config,
    findings: &[Finding],
    playbooks_dir: &Path,
) -> Vec<String> {
    let mut errors = Vec::new();

    if config.mock_mode {
        if findings.is_empty() {
            errors.push("No findings to remediate".to_string());
            return errors;
        }
        errors.extend(check_playbooks(findings, playbooks_dir));
        return errors;
    }

    if config.agent_api_key.is_empty() {
        errors.push("AGENT_API_KEY is not set".to_string());
    } else {
        match backend.list_sessions(None, 1, 0).await {
            Ok(_) => tracing::info!("Preflight: agent API is reachable"),
            Err(e) => errors.push(format!("Cannot reach agent API: {e}")),
        }
    }

    if !findings.is_empty() {
        errors.extend(check_playbooks(findings, playbooks_dir));
    }

    if config.hybrid_mode && config.connected_repos.is_empty() {
        errors.push("CONNECTED_REPOS must be set when using hybrid mode".to_string());
    }

    if findings.is_empty() {
        errors.push("No findings to remediate".to_string());
    }

    errors
}

fn check_playbooks(findings: &[Finding], playbooks_dir: &Path) -> Vec<String> {
    let mut errors = Vec::new();
    let mut seen = HashSet::new();

    for finding in findings {
        if !seen.insert(finding.category) {
            continue;
        }
        let path = playbook_path(playbooks_dir, finding.category);
        if !path.exists() {
            errors.push(format!(
                "Playbook file missing for category '{}': {}",
                finding.category.as_str(),
                path.display()
            ));
        }
    }

    if errors.is_empty() {
        tracing::info!(
            "Preflight: all required playbook files exist ({} categories)",
            seen.len()
        );
    }
    errors
}
