//! Filesystem-backed memory store: graph index plus per-item markdown.

use std::path::{Path, PathBuf};

use anyhow::{Context, Result};

use crate::store::atomic_write_json;
use crate::store::lock::{self, FileLock};

use super::{MemoryGraph, MemoryGraphEntry, MemoryItem, MemoryRelationship};

#[derive(Debug, Clone)]
pub struct MemoryStore {
    graph_path: PathBuf,
    items_dir: PathBuf,
}

impl MemoryStore {
    pub fn new(memory_dir: impl Into<PathBuf>) -> Self {
        let dir = memory_dir.into();
        Self {
            graph_path: dir.join("graph.json"),
            items_dir: dir.join("items"),
        }
    }

    pub fn graph_path(&self) -> &Path {
        &self.graph_path
    }

    /// Load the graph. Missing or malformed index reads as empty.
    pub fn load_graph(&self) -> MemoryGraph {
        match std::fs::read_to_string(&self.graph_path) {
            Ok(text) => match serde_json::from_str(&text) {
                Ok(graph) => graph,
                Err(e) => {
                    tracing::warn!("Could not load memory graph: {} — treating as empty", e);
                    MemoryGraph::default()
                }
            },
            Err(_) => MemoryGraph::default(),
        }
    }

    /// Persist the graph under the shared lock protocol; the review dashboard
    /// and concurrent engine processes write this file too.
    pub fn save_graph(&self, graph: &MemoryGraph) -> Result<()> {
        if let Some(parent) = self.graph_path.parent() {
            std::fs::create_dir_all(parent)?;
        }
        let _lock = FileLock::acquire(&self.graph_path, "memory", lock::DEFAULT_TIMEOUT)
            .with_context(|| format!("Locking {}", self.graph_path.display()))?;
        atomic_write_json(&self.graph_path, graph)
    }

    pub fn save_item(&self, item: &MemoryItem) -> Result<()> {
        std::fs::create_dir_all(&self.items_dir)?;
        let path = self.items_dir.join(format!("{}.md", item.item_id));
        std::fs::write(&path, render_markdown(item))
            .with_context(|| format!("Writing memory item {}", path.display()))?;
        tracing::debug!("Saved memory item {}", item.item_id);
        Ok(())
    }

    /// Load an item's markdown. None when absent or unreadable.
    pub fn load_item(&self, item_id: &str) -> Option<String> {
        std::fs::read_to_string(self.items_dir.join(format!("{item_id}.md"))).ok()
    }

    /// Add or update an item: write the markdown, build the metadata entry,
    /// and link both endpoints of every `same_category` / `same_service`
    /// relationship so the graph stays symmetric.
    pub fn upsert(&self, item: &MemoryItem, graph: &mut MemoryGraph) -> Result<()> {
        self.save_item(item)?;

        let mut entry = MemoryGraphEntry {
            item_id: item.item_id.clone(),
            finding_id: item.finding_id.clone(),
            category: item.category.clone(),
            service_name: item.service_name.clone(),
            severity: item.severity.clone(),
            data_source: item.data_source.clone(),
            outcome: item.outcome.clone(),
            confidence: item.confidence.clone(),
            fix_approach_summary: item
                .fix_approach
                .as_ref()
                .map(|a| a.chars().take(100).collect()),
            created_at: item.created_at.clone(),
            run_id: item.run_id.clone(),
            relationships: Vec::new(),
        };

        // Drop any previous copy of this item before recomputing links.
        graph.entries.retain(|e| e.item_id != entry.item_id);
        for existing in &mut graph.entries {
            existing
                .relationships
                .retain(|r| r.target_id != entry.item_id);
        }

        for existing in &mut graph.entries {
            if existing.category == entry.category {
                link_both(&mut entry, existing, "same_category");
            }
            if existing.service_name == entry.service_name {
                link_both(&mut entry, existing, "same_service");
            }
        }

        graph.entries.push(entry);
        Ok(())
    }
}

fn link_both(new: &mut MemoryGraphEntry, existing: &mut MemoryGraphEntry, relation: &str) {
    new.relationships.push(MemoryRelationship {
        target_id: existing.item_id.clone(),
        relation_type: relation.to_string(),
    });
    existing.relationships.push(MemoryRelationship {
        target_id: new.item_id.clone(),
        relation_type: relation.to_string(),
    });
}

fn render_markdown(item: &MemoryItem) -> String {
    let outcome = if item.outcome == "success" { "SUCCESS" } else { "FAILED" };
    let confidence = item.confidence.as_deref().unwrap_or("unknown");
    let files = if item.files_modified.is_empty() {
        "- None".to_string()
    } else {
        item.files_modified
            .iter()
            .map(|f| format!("- `{f}`"))
            .collect::<Vec<_>>()
            .join("\n")
    };
    let tests = match item.tests_passed {
        Some(true) => "Yes",
        Some(false) => "No",
        None => "N/A",
    };

    format!(
        "# Memory: {finding} — {title}\n\n\
         ## Metadata\n\
         - **Category**: {category}\n\
         - **Service**: {service}\n\
         - **Severity**: {severity}\n\
         - **Outcome**: {outcome}\n\
         - **Confidence**: {confidence}\n\
         - **Data Source**: {source}\n\
         - **Run ID**: {run}\n\
         - **Created**: {created}\n\n\
         ## Fix Approach\n{approach}\n\n\
         ## Files Modified\n{files}\n\n\
         ## Test Results\n\
         - **Tests Passed**: {tests}\n\
         - **Tests Added**: {tests_added}\n\n\
         ## PR\n{pr}\n\n\
         ## Error\n{error}\n",
        finding = item.finding_id,
        title = item.title,
        category = item.category,
        service = item.service_name,
        severity = item.severity,
        outcome = outcome,
        confidence = confidence,
        source = item.data_source,
        run = item.run_id,
        created = item.created_at,
        approach = item.fix_approach.as_deref().unwrap_or("No fix approach recorded."),
        files = files,
        tests = tests,
        tests_added = item.tests_added,
        pr = item.pr_url.as_deref().unwrap_or("No PR created."),
        error = item.error_message.as_deref().unwrap_or("No errors."),
    )
}

#[cfg(test)]
pub(crate) mod tests {
    use super::*;
    use chrono::Utc;

    pub(crate) fn item(id: &str, category: &str, service: &str) -> MemoryItem {
        MemoryItem {
            item_id: id.to_string(),
            finding_id: id.split('-').skip(1).collect::<Vec<_>>().join("-"),
            category: category.to_string(),
            service_name: service.to_string(),
            severity: "high".to_string(),
            title: "Fix".to_string(),
            data_source: "mock".to_string(),
            outcome: "success".to_string(),
            confidence: Some("high".to_string()),
            fix_approach: Some("Parameterize the query".to_string()),
            files_modified: vec!["src/dao.java".to_string()],
            error_message: None,
            tests_passed: Some(true),
            tests_added: 2,
            pr_url: Some("https://g/pr/1".to_string()),
            run_id: id.split('-').next().unwrap_or("run").to_string(),
            created_at: Utc::now().to_rfc3339(),
        }
    }

    #[test]
    fn upsert_saves_markdown_and_entry() {
        let dir = tempfile::tempdir().unwrap();
        let store = MemoryStore::new(dir.path());
        let mut graph = store.load_graph();

        store.upsert(&item("r1-FIND-0001", "sql_injection", "payment-service"), &mut graph).unwrap();
        store.save_graph(&graph).unwrap();

        let reloaded = store.load_graph();
        assert_eq!(reloaded.entries.len(), 1);
        let content = store.load_item("r1-FIND-0001").unwrap();
        assert!(content.contains("## Fix Approach"));
        assert!(content.contains("Parameterize the query"));
    }

    #[test]
    fn relationships_are_symmetric() {
        let dir = tempfile::tempdir().unwrap();
        let store = MemoryStore::new(dir.path());
        let mut graph = store.load_graph();

        store.upsert(&item("r1-FIND-0001", "sql_injection", "payment-service"), &mut graph).unwrap();
        store.upsert(&item("r1-FIND-0002", "sql_injection", "user-service"), &mut graph).unwrap();
        store.upsert(&item("r2-FIND-0003", "xss", "payment-service"), &mut graph).unwrap();

        let by_id = |id: &str| graph.entries.iter().find(|e| e.item_id == id).unwrap();

        let first = by_id("r1-FIND-0001");
        assert!(first.relationships.iter().any(|r| {
            r.target_id == "r1-FIND-0002" && r.relation_type == "same_category"
        }));
        assert!(first.relationships.iter().any(|r| {
            r.target_id == "r2-FIND-0003" && r.relation_type == "same_service"
        }));

        // Both endpoints carry the edge.
        let second = by_id("r1-FIND-0002");
        assert!(second.relationships.iter().any(|r| {
            r.target_id == "r1-FIND-0001" && r.relation_type == "same_category"
        }));
        let third = by_id("r2-FIND-0003");
        assert!(third.relationships.iter().any(|r| {
            r.target_id == "r1-FIND-0001" && r.relation_type == "same_service"
        }));
    }

    #[test]
    fn re_upsert_replaces_without_duplicate_edges() {
        let dir = tempfile::tempdir().unwrap();
        let store = MemoryStore::new(dir.path());
        let mut graph = store.load_graph();

        store.upsert(&item("r1-FIND-0001", "xss", "web"), &mut graph).unwrap();
        store.upsert(&item("r1-FIND-0002", "xss", "web"), &mut graph).unwrap();
        // Same item again.
        store.upsert(&item("r1-FIND-0002", "xss", "web"), &mut graph).unwrap();

        assert_eq!(graph.entries.len(), 2);
        let first = graph.entries.iter().find(|e| e.item_id == "r1-FIND-0001").unwrap();
        let edges_to_second = first
            .relationships
            .iter()
            .filter(|r| r.target_id == "r1-FIND-0002")
            .count();
        // One same_category edge and one same_service edge, no duplicates.
        assert_eq!(edges_to_second, 2);
    }

    #[test]
    fn corrupt_graph_reads_as_empty() {
        let dir = tempfile::tempdir().unwrap();
        std::fs::write(dir.path().join("graph.json"), "not json at all").unwrap();
        let store = MemoryStore::new(dir.path());
        assert!(store.load_graph().entries.is_empty());
    }

    #[test]
    fn missing_item_is_none() {
        let dir = tempfile::tempdir().unwrap();
        let store = MemoryStore::new(dir.path());
        assert!(store.load_item("nope").is_none());
    }
}
