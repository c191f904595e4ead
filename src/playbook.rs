//! Category → playbook selection and upload.
//!
//! Playbooks live on disk as `playbooks/<name>.devin.md` and are uploaded to
//! the backend once; the returned ids are stamped onto sessions before
//! dispatch.

use std::collections::HashMap;
use std::path::{Path, PathBuf};

use anyhow::Result;

use crate::backend::AgentBackend;
use crate::model::{FindingCategory, Wave};

/// Playbook file name per category. Categories without a dedicated playbook
/// fall back to the dependency one, which carries the generic instructions.
pub fn playbook_file(category: FindingCategory) -> &'static str {
    match category {
        FindingCategory::DependencyVulnerability => "dependency_vulnerability.devin.md",
        FindingCategory::SqlInjection => "sql_injection.devin.md",
        FindingCategory::HardcodedSecret => "hardcoded_secrets.devin.md",
        FindingCategory::PiiLogging => "pii_logging.devin.md",
        FindingCategory::MissingEncryption => "missing_encryption.devin.md",
        FindingCategory::AccessLogging => "access_logging.devin.md",
        FindingCategory::Xss | FindingCategory::PathTraversal | FindingCategory::Other => {
            "dependency_vulnerability.devin.md"
        }
    }
}

pub fn playbook_path(playbooks_dir: &Path, category: FindingCategory) -> PathBuf {
    playbooks_dir.join(playbook_file(category))
}

/// Playbook title as registered on the backend: file name minus `.devin.md`.
fn playbook_title(file: &str) -> String {
    file.trim_end_matches(".devin.md").to_string()
}

/// Upload every mapped playbook that the backend does not already have.
/// Returns file name → playbook id. Files missing on disk are skipped with
/// a warning; preflight reports them separately.
pub async fn ensure_playbooks_uploaded(
    backend: &dyn AgentBackend,
    playbooks_dir: &Path,
) -> Result<HashMap<String, String>> {
    let existing: HashMap<String, String> = backend
        .list_playbooks()
        .await?
        .into_iter()
        .map(|pb| (pb.title, pb.playbook_id))
        .collect();

    let mut unique_files: Vec<&'static str> = [
        FindingCategory::DependencyVulnerability,
        FindingCategory::SqlInjection,
        FindingCategory::HardcodedSecret,
        FindingCategory::PiiLogging,
        FindingCategory::MissingEncryption,
        FindingCategory::AccessLogging,
    ]
    .into_iter()
    .map(playbook_file)
    .collect();
    unique_files.sort_unstable();
    unique_files.dedup();

    let mut file_to_id = HashMap::new();
    for file in unique_files {
        let title = playbook_title(file);
        if let Some(id) = existing.get(&title) {
            tracing::info!("Playbook already exists: {} -> {}", file, id);
            file_to_id.insert(file.to_string(), id.clone());
            continue;
        }

        let path = playbooks_dir.join(file);
        let body = match std::fs::read_to_string(&path) {
            Ok(body) => body,
            Err(e) => {
                tracing::warn!("Playbook file not found on disk: {} ({})", path.display(), e);
                continue;
            }
        };

        let created = backend.create_playbook(&title, &body).await?;
        tracing::info!("Uploaded playbook: {} -> {}", file, created.playbook_id);
        file_to_id.insert(file.to_string(), created.playbook_id);
    }

    Ok(file_to_id)
}

/// Stamp each session's `playbook_id` from its finding's category, falling
/// back to any available id when the mapping is missing.
pub fn assign_playbooks(waves: &mut [Wave], file_to_id: &HashMap<String, String>) {
    let fallback = file_to_id.values().next().cloned();

    for wave in waves {
        for session in &mut wave.sessions {
            let file = playbook_file(session.finding.category);
            match file_to_id.get(file).or(fallback.as_ref()) {
                Some(id) => session.playbook_id = id.clone(),
                None => {
                    tracing::warn!(
                        "No playbook id available for category {}, leaving empty",
                        session.finding.category.as_str()
                    );
                }
            }
        }
    }
}
