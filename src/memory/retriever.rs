//! Ranked memory retrieval for prompt enrichment.

use chrono::{DateTime, Utc};

use crate::model::Finding;

use super::{MemoryGraphEntry, MemoryStore};

const CATEGORY_MATCH_SCORE: f64 = 10.0;
const SERVICE_MATCH_SCORE: f64 = 5.0;
const SEVERITY_MATCH_SCORE: f64 = 2.0;
const LIVE_SOURCE_BONUS: f64 = 2.0;
const SUCCESS_BONUS: f64 = 3.0;
/// Score halves every 30 days of item age.
const FRESHNESS_HALF_LIFE_DAYS: f64 = 30.0;

/// A retrieved memory with its citation for prompt injection.
#[derive(Debug, Clone)]
pub struct RetrievedMemory {
    pub content: String,
    pub score: f64,
    pub source_note: String,
    pub data_source: String,
}

/// Retrieve up to `max_results` memories relevant to `finding`, best first.
///
/// Items matching neither the category nor the service are excluded
/// outright. Items whose markdown is missing are skipped without error.
pub fn retrieve_memories(
    finding: &Finding,
    store: &MemoryStore,
    max_results: usize,
) -> Vec<RetrievedMemory> {
    let graph = store.load_graph();
    if graph.entries.is_empty() {
        return Vec::new();
    }

    let mut scored: Vec<(f64, &MemoryGraphEntry)> = graph
        .entries
        .iter()
        .filter_map(|entry| {
            let score = score_entry(entry, finding, Utc::now());
            (score > 0.0).then_some((score, entry))
        })
        .collect();
    scored.sort_by(|a, b| b.0.partial_cmp(&a.0).unwrap_or(std::cmp::Ordering::Equal));

    let mut results = Vec::new();
    for (score, entry) in scored.into_iter().take(max_results) {
        let Some(content) = store.load_item(&entry.item_id) else {
            continue;
        };

        let mut source_note = format!(
            "[Memory from run {}, source: {}]",
            entry.run_id, entry.data_source
        );
        if entry.data_source == "mock" {
            source_note.push_str(
                " (Note: this memory is from a mock session — actual behavior may differ)",
            );
        }

        results.push(RetrievedMemory {
            content,
            score,
            source_note,
            data_source: entry.data_source.clone(),
        });
    }

    tracing::info!(
        "Retrieved {} memories for {} (category={}, service={})",
        results.len(),
        finding.finding_id,
        finding.category.as_str(),
        finding.service_name
    );
    results
}

/// Relevance score for one entry. Zero means excluded.
fn score_entry(entry: &MemoryGraphEntry, finding: &Finding, now: DateTime<Utc>) -> f64 {
    let mut score = 0.0;

    if entry.category == finding.category.as_str() {
        score += CATEGORY_MATCH_SCORE;
    }
    if entry.service_name == finding.service_name {
        score += SERVICE_MATCH_SCORE;
    }
    // Zero-relevance gate: no category and no service match → out.
    if score == 0.0 {
        return 0.0;
    }

    if entry.severity == finding.severity.as_str() {
        score += SEVERITY_MATCH_SCORE;
    }
    score += match entry.confidence.as_deref() {
        Some("high") => 3.0,
        Some("medium") => 1.5,
        Some("low") => 0.5,
        _ => 0.0,
    };
    if entry.data_source == "live" {
        score += LIVE_SOURCE_BONUS;
    }
    if entry.outcome == "success" {
        score += SUCCESS_BONUS;
    }

    // Freshness decay: unparseable timestamps skip the decay rather than
    // poisoning the entry.
    if let Ok(created) = DateTime::parse_from_rfc3339(&entry.created_at) {
        let age_days = (now - created.with_timezone(&Utc)).num_seconds() as f64 / 86_400.0;
        if age_days > 0.0 {
            score *= 0.5_f64.powf(age_days / FRESHNESS_HALF_LIFE_DAYS);
        }
    }

    score
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::{FindingCategory, Severity};
    use chrono::Duration;

    fn entry(id: &str, category: &str, service: &str) -> MemoryGraphEntry {
        MemoryGraphEntry {
            item_id: id.to_string(),
            finding_id: "FIND-0001".to_string(),
            category: category.to_string(),
            service_name: service.to_string(),
            severity: "high".to_string(),
            data_source: "mock".to_string(),
            outcome: "success".to_string(),
            confidence: Some("high".to_string()),
            fix_approach_summary: None,
            created_at: Utc::now().to_rfc3339(),
            run_id: "r1".to_string(),
            relationships: Vec::new(),
        }
    }

    fn query() -> Finding {
        Finding {
            finding_id: "FIND-0099".into(),
            scanner: "sast".into(),
            category: FindingCategory::SqlInjection,
            severity: Severity::High,
            title: "t".into(),
            description: "d".into(),
            service_name: "payment-service".into(),
            repo_url: "r".into(),
            file_path: "f".into(),
            line_number: None,
            cwe_id: None,
            dependency_name: None,
            current_version: None,
            fixed_version: None,
            language: None,
            priority_score: 0.0,
        }
    }

    #[test]
    fn zero_relevance_gate_excludes_unrelated() {
        let unrelated = entry("a", "xss", "catalog-service");
        assert_eq!(score_entry(&unrelated, &query(), Utc::now()), 0.0);
    }

    #[test]
    fn full_match_scores_all_components() {
        let mut full = entry("a", "sql_injection", "payment-service");
        full.data_source = "live".to_string();
        // 10 + 5 + 2 (severity) + 3 (high confidence) + 2 (live) + 3 (success),
        // with negligible decay for a fresh item.
        let score = score_entry(&full, &query(), Utc::now());
        assert!((score - 25.0).abs() < 0.1, "score={score}");
    }

    #[test]
    fn freshness_halves_at_thirty_days() {
        let mut aged = entry("a", "sql_injection", "unrelated");
        aged.created_at = (Utc::now() - Duration::days(30)).to_rfc3339();
        let fresh_score = score_entry(&entry("b", "sql_injection", "unrelated"), &query(), Utc::now());
        let aged_score = score_entry(&aged, &query(), Utc::now());
        assert!((aged_score - fresh_score / 2.0).abs() < 0.1);
    }

    #[test]
    fn retrieval_ranks_and_cites() {
        let dir = tempfile::tempdir().unwrap();
        let store = MemoryStore::new(dir.path());
        let mut graph = store.load_graph();

        let make = |id: &str, category: &str, service: &str, source: &str| {
            let mut item = crate::memory::store::tests::item(id, category, service);
            item.data_source = source.to_string();
            item
        };

        // Category+service+live beats category-only beats service-only.
        store.upsert(&make("r1-F1", "sql_injection", "payment-service", "live"), &mut graph).unwrap();
        store.upsert(&make("r1-F2", "sql_injection", "other-service", "mock"), &mut graph).unwrap();
        store.upsert(&make("r1-F3", "xss", "payment-service", "mock"), &mut graph).unwrap();
        store.upsert(&make("r1-F4", "xss", "nowhere-service", "mock"), &mut graph).unwrap();
        store.save_graph(&graph).unwrap();

        let results = retrieve_memories(&query(), &store, 3);
        assert_eq!(results.len(), 3);
        assert!(results[0].score >= results[1].score && results[1].score >= results[2].score);
        assert!(results[0].source_note.contains("run r1"));
        assert!(results[0].source_note.contains("source: live"));
        // Mock items carry the warning, live ones do not.
        assert!(!results[0].source_note.contains("mock session"));
        assert!(results[1].source_note.contains("mock session"));
    }

    #[test]
    fn missing_item_markdown_is_skipped() {
        let dir = tempfile::tempdir().unwrap();
        let store = MemoryStore::new(dir.path());
        let mut graph = store.load_graph();
        graph.entries.push(entry("r1-GONE", "sql_injection", "payment-service"));
        store.save_graph(&graph).unwrap();

        let results = retrieve_memories(&query(), &store, 3);
        assert!(results.is_empty());
    }
}
