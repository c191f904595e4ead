//! Cross-run memory: a filesystem-backed knowledge graph of prior session
//! outcomes, with ranked retrieval for prompt enrichment.
//!
//! Layout: `<memory>/graph.json` holds the metadata-only index plus the
//! `same_category`/`same_service` relationships; the full narrative for each
//! item lives in `<memory>/items/<item_id>.md`. The graph is
//! corruption-tolerant — a malformed index reads as empty while the item
//! files on disk stay usable.

pub mod extractor;
pub mod retriever;
pub mod store;

pub use extractor::extract_memories;
pub use retriever::{retrieve_memories, RetrievedMemory};
pub use store::MemoryStore;

use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct MemoryRelationship {
    pub target_id: String,
    /// `same_category` or `same_service`; both are kept symmetric.
    pub relation_type: String,
}

/// Metadata-only entry in `graph.json` (no narrative content).
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MemoryGraphEntry {
    pub item_id: String,
    pub finding_id: String,
    pub category: String,
    pub service_name: String,
    pub severity: String,
    pub data_source: String,
    /// `success` or `failed`
    pub outcome: String,
    #[serde(default)]
    pub confidence: Option<String>,
    #[serde(default)]
    pub fix_approach_summary: Option<String>,
    pub created_at: String,
    pub run_id: String,
    #[serde(default)]
    pub relationships: Vec<MemoryRelationship>,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct MemoryGraph {
    #[serde(default = "default_version")]
    pub version: u32,
    #[serde(default)]
    pub entries: Vec<MemoryGraphEntry>,
}

fn default_version() -> u32 {
    1
}

/// Full narrative memory item, rendered to markdown on save.
///
/// `item_id` is `{run_id}-{finding_id}`, so the same finding across reruns
/// produces distinct items.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MemoryItem {
    pub item_id: String,
    pub finding_id: String,
    pub category: String,
    pub service_name: String,
    pub severity: String,
    pub title: String,
    pub data_source: String,
    pub outcome: String,
    #[serde(default)]
    pub confidence: Option<String>,
    #[serde(default)]
    pub fix_approach: Option<String>,
    #[serde(default)]
    pub files_modified: Vec<String>,
    #[serde(default)]
    pub error_message: Option<String>,
    #[serde(default)]
    pub tests_passed: Option<bool>,
    #[serde(default)]
    pub tests_added: u32,
    #[serde(default)]
    pub pr_url: Option<String>,
    pub run_id: String,
    pub created_at: String,
}
