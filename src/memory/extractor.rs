//! Memory extraction from terminal sessions.

use chrono::Utc;

use crate::model::{BatchRun, RemediationSession, SessionState};

use super::MemoryItem;

/// Convert every terminal session in the run into a memory item.
pub fn extract_memories(run: &BatchRun) -> Vec<MemoryItem> {
    let items: Vec<MemoryItem> = run
        .sessions()
        .filter(|s| s.status.is_terminal())
        .map(|s| session_to_memory(s, &run.run_id))
        .collect();

    tracing::info!("Extracted {} memory items from run {}", items.len(), run.run_id);
    items
}

fn session_to_memory(session: &RemediationSession, run_id: &str) -> MemoryItem {
    let finding = &session.finding;
    let so = session.structured_output.as_ref();

    let outcome = if session.status == SessionState::Success {
        "success"
    } else {
        "failed"
    };

    MemoryItem {
        item_id: format!("{}-{}", run_id, finding.finding_id),
        finding_id: finding.finding_id.clone(),
        category: finding.category.as_str().to_string(),
        service_name: finding.service_name.clone(),
        severity: finding.severity.as_str().to_string(),
        title: finding.title.clone(),
        data_source: session.data_source.as_str().to_string(),
        outcome: outcome.to_string(),
        confidence: so.and_then(|s| s.confidence.clone()),
        fix_approach: so.and_then(|s| s.fix_approach.clone()),
        files_modified: so.map(|s| s.files_modified.clone()).unwrap_or_default(),
        error_message: session
            .error_message
            .clone()
            .or_else(|| so.and_then(|s| s.error_message.clone())),
        tests_passed: so.and_then(|s| s.tests_passed),
        tests_added: so.and_then(|s| s.tests_added).unwrap_or(0),
        pr_url: session.pr_url.clone(),
        run_id: run_id.to_string(),
        created_at: Utc::now().to_rfc3339(),
    }
}
