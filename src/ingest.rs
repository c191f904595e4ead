//! Findings ingest: CSV parsing, deduplication, and priority scoring.
//!
//! The scanner export is row-per-finding. Rows carrying an unknown category
//! or severity are dropped with a warning rather than failing the whole
//! file; a missing required column fails fast and names the column.

use std::collections::HashMap;
use std::io::Read;

use thiserror::Error;

use crate::model::{Finding, FindingCategory, Severity};

pub const REQUIRED_COLUMNS: [&str; 9] = [
    "finding_id",
    "scanner",
    "category",
    "severity",
    "title",
    "description",
    "service_name",
    "repo_url",
    "file_path",
];

const OPTIONAL_COLUMNS: [&str; 6] = [
    "line_number",
    "cwe_id",
    "dependency_name",
    "current_version",
    "fixed_version",
    "language",
];

#[derive(Debug, Error)]
pub enum IngestError {
    #[error("missing required column: {0}")]
    MissingColumn(String),

    #[error("csv error: {0}")]
    Csv(#[from] csv::Error),
}

fn parse_category(raw: &str) -> Option<FindingCategory> {
    Some(match raw {
        "dependency_vulnerability" => FindingCategory::DependencyVulnerability,
        "sql_injection" => FindingCategory::SqlInjection,
        "hardcoded_secret" => FindingCategory::HardcodedSecret,
        "pii_logging" => FindingCategory::PiiLogging,
        "missing_encryption" => FindingCategory::MissingEncryption,
        "access_logging" => FindingCategory::AccessLogging,
        "xss" => FindingCategory::Xss,
        "path_traversal" => FindingCategory::PathTraversal,
        "other" => FindingCategory::Other,
        _ => return None,
    })
}

fn parse_severity(raw: &str) -> Option<Severity> {
    Some(match raw {
        "critical" => Severity::Critical,
        "high" => Severity::High,
        "medium" => Severity::Medium,
        "low" => Severity::Low,
        _ => return None,
    })
}

/// Parse a findings CSV. Priority scores are left at zero; scoring is the
/// prioritizer's job.
pub fn parse_findings_csv(input: impl Read) -> Result<Vec<Finding>, IngestError> {
    let mut reader = csv::Reader::from_reader(input);

    let headers = reader.headers()?.clone();
    let index: HashMap<&str, usize> = headers
        .iter()
        .enumerate()
        .map(|(i, name)| (name.trim(), i))
        .collect();
    for column in REQUIRED_COLUMNS {
        if !index.contains_key(column) {
            return Err(IngestError::MissingColumn(column.to_string()));
        }
    }

    let field = |record: &csv::StringRecord, name: &str| -> String {
        index
            .get(name)
            .and_then(|&i| record.get(i))
            .unwrap_or("")
            .trim()
            .to_string()
    };
    let optional = |record: &csv::StringRecord, name: &str| -> Option<String> {
        let value = field(record, name);
        (!value.is_empty()).then_some(value)
    };

    let mut findings = Vec::new();
    for record in reader.records() {
        let record = record?;
        let finding_id = field(&record, "finding_id");

        let raw_category = field(&record, "category");
        let Some(category) = parse_category(&raw_category) else {
            tracing::warn!("Skipping {}: invalid category '{}'", finding_id, raw_category);
            continue;
        };
        let raw_severity = field(&record, "severity");
        let Some(severity) = parse_severity(&raw_severity) else {
            tracing::warn!("Skipping {}: invalid severity '{}'", finding_id, raw_severity);
            continue;
        };

        let line_number = optional(&record, "line_number").and_then(|raw| raw.parse().ok());

        findings.push(Finding {
            finding_id,
            scanner: field(&record, "scanner"),
            category,
            severity,
            title: field(&record, "title"),
            description: field(&record, "description"),
            service_name: field(&record, "service_name"),
            repo_url: field(&record, "repo_url"),
            file_path: field(&record, "file_path"),
            line_number,
            cwe_id: optional(&record, "cwe_id"),
            dependency_name: optional(&record, "dependency_name"),
            current_version: optional(&record, "current_version"),
            fixed_version: optional(&record, "fixed_version"),
            language: optional(&record, "language"),
            priority_score: 0.0,
        });
    }

    tracing::info!("Parsed {} findings", findings.len());
    Ok(findings)
}

/// Deduplicate on `(service_name, file_path, line_number, category)`,
/// keeping the higher-severity row. Ties keep the first row encountered;
/// kept rows preserve their original order.
pub fn normalize_findings(findings: Vec<Finding>) -> Vec<Finding> {
    let mut seen: HashMap<(String, String, Option<u32>, FindingCategory), usize> = HashMap::new();
    let mut result: Vec<Finding> = Vec::new();
    let input_len = findings.len();

    for finding in findings {
        let key = (
            finding.service_name.clone(),
            finding.file_path.clone(),
            finding.line_number,
            finding.category,
        );
        match seen.get(&key) {
            None => {
                seen.insert(key, result.len());
                result.push(finding);
            }
            Some(&existing_idx) => {
                if finding.severity.rank() > result[existing_idx].severity.rank() {
                    tracing::debug!(
                        "Replaced {} with higher-severity {}",
                        result[existing_idx].finding_id,
                        finding.finding_id
                    );
                    result[existing_idx] = finding;
                }
            }
        }
    }

    let removed = input_len - result.len();
    if removed > 0 {
        tracing::info!("Removed {} duplicate findings", removed);
    }
    result
}

fn severity_weight(severity: Severity) -> f64 {
    match severity {
        Severity::Critical => 40.0,
        Severity::High => 30.0,
        Severity::Medium => 15.0,
        Severity::Low => 5.0,
    }
}

fn category_weight(category: FindingCategory) -> f64 {
    match category {
        FindingCategory::SqlInjection => 25.0,
        FindingCategory::HardcodedSecret => 25.0,
        FindingCategory::DependencyVulnerability => 20.0,
        FindingCategory::Xss => 20.0,
        FindingCategory::PathTraversal => 20.0,
        FindingCategory::PiiLogging => 15.0,
        FindingCategory::MissingEncryption => 15.0,
        FindingCategory::AccessLogging => 10.0,
        FindingCategory::Other => 10.0,
    }
}

pub const DEFAULT_SERVICE_WEIGHT: f64 = 10.0;

/// Business-criticality weights per service. Callers may override.
pub fn default_service_weights() -> HashMap<String, f64> {
    HashMap::from([
        ("payment-service".to_string(), 20.0),
        ("auth-service".to_string(), 20.0),
        ("user-service".to_string(), 15.0),
        ("catalog-service".to_string(), 10.0),
    ])
}

/// Score and sort findings by priority, highest first.
///
/// `priority_score = severity_weight + category_weight + service_weight`.
pub fn prioritize_findings(
    mut findings: Vec<Finding>,
    service_weights: &HashMap<String, f64>,
) -> Vec<Finding> {
    for finding in &mut findings {
        finding.priority_score = severity_weight(finding.severity)
            + category_weight(finding.category)
            + service_weights
                .get(&finding.service_name)
                .copied()
                .unwrap_or(DEFAULT_SERVICE_WEIGHT);
    }
    findings.sort_by(|a, b| {
        b.priority_score
            .partial_cmp(&a.priority_score)
            .unwrap_or(std::cmp::Ordering::Equal)
    });
    findings
}

/// Full pipeline: parse → dedupe → prioritize.
pub fn ingest_findings(input: impl Read) -> Result<Vec<Finding>, IngestError> {
    let findings = parse_findings_csv(input)?;
    let findings = normalize_findings(findings);
    Ok(prioritize_findings(findings, &default_service_weights()))
}
