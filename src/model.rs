//! Core data model shared by the run engine, the review path, and the API.
//!
//! Everything here serializes to the on-disk JSON layout consumed by the
//! dashboard, so field names and enum spellings are load-bearing.

use std::collections::BTreeMap;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// Finding severity, ordered from worst to least.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Severity {
    Critical,
    High,
    Medium,
    Low,
}

impl Severity {
    /// Rank for dedup comparisons (higher = more severe).
    pub fn rank(self) -> u8 {
        match self {
            Severity::Critical => 4,
            Severity::High => 3,
            Severity::Medium => 2,
            Severity::Low => 1,
        }
    }

    pub fn as_str(self) -> &'static str {
        match self {
            Severity::Critical => "critical",
            Severity::High => "high",
            Severity::Medium => "medium",
            Severity::Low => "low",
        }
    }
}

/// Scanner-reported vulnerability class.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FindingCategory {
    DependencyVulnerability,
    SqlInjection,
    HardcodedSecret,
    PiiLogging,
    MissingEncryption,
    AccessLogging,
    Xss,
    PathTraversal,
    Other,
}

impl FindingCategory {
    pub fn as_str(self) -> &'static str {
        match self {
            FindingCategory::DependencyVulnerability => "dependency_vulnerability",
            FindingCategory::SqlInjection => "sql_injection",
            FindingCategory::HardcodedSecret => "hardcoded_secret",
            FindingCategory::PiiLogging => "pii_logging",
            FindingCategory::MissingEncryption => "missing_encryption",
            FindingCategory::AccessLogging => "access_logging",
            FindingCategory::Xss => "xss",
            FindingCategory::PathTraversal => "path_traversal",
            FindingCategory::Other => "other",
        }
    }
}

/// One scanner-reported issue. Immutable once ingested.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Finding {
    pub finding_id: String,
    pub scanner: String,
    pub category: FindingCategory,
    pub severity: Severity,
    pub title: String,
    pub description: String,
    pub service_name: String,
    pub repo_url: String,
    pub file_path: String,
    #[serde(default)]
    pub line_number: Option<u32>,
    #[serde(default)]
    pub cwe_id: Option<String>,
    #[serde(default)]
    pub dependency_name: Option<String>,
    #[serde(default)]
    pub current_version: Option<String>,
    #[serde(default)]
    pub fixed_version: Option<String>,
    #[serde(default)]
    pub language: Option<String>,
    #[serde(default)]
    pub priority_score: f64,
}

/// Internal lifecycle of one remediation session.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SessionState {
    Pending,
    Dispatched,
    Working,
    Blocked,
    Success,
    Failed,
    Timeout,
}

impl SessionState {
    /// Terminal states never transition again (BLOCKED is transient: it is
    /// promoted to FAILED once the session timeout elapses).
    pub fn is_terminal(self) -> bool {
        matches!(
            self,
            SessionState::Success | SessionState::Failed | SessionState::Timeout
        )
    }

    /// States that still need polling.
    pub fn is_active(self) -> bool {
        matches!(
            self,
            SessionState::Dispatched | SessionState::Working | SessionState::Blocked
        )
    }

    pub fn as_str(self) -> &'static str {
        match self {
            SessionState::Pending => "pending",
            SessionState::Dispatched => "dispatched",
            SessionState::Working => "working",
            SessionState::Blocked => "blocked",
            SessionState::Success => "success",
            SessionState::Failed => "failed",
            SessionState::Timeout => "timeout",
        }
    }
}

/// Which backend a single session ran against.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DataSource {
    Live,
    Mock,
}

impl DataSource {
    pub fn as_str(self) -> &'static str {
        match self {
            DataSource::Live => "live",
            DataSource::Mock => "mock",
        }
    }
}

/// Run-level routing mode.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RunMode {
    Live,
    Mock,
    Hybrid,
}

impl RunMode {
    pub fn as_str(self) -> &'static str {
        match self {
            RunMode::Live => "live",
            RunMode::Mock => "mock",
            RunMode::Hybrid => "hybrid",
        }
    }
}

impl std::str::FromStr for RunMode {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "live" => Ok(RunMode::Live),
            "mock" => Ok(RunMode::Mock),
            "hybrid" => Ok(RunMode::Hybrid),
            other => Err(format!("unknown mode '{other}' (expected live|mock|hybrid)")),
        }
    }
}

/// Rolling status document an agent session emits while it works.
///
/// The blob is playbook-shaped; only the documented keys are interpreted and
/// everything else is preserved verbatim in `extra`.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct StructuredOutput {
    #[serde(default)]
    pub finding_id: Option<String>,
    /// Stage reported by the agent: analyzing, fixing, testing, creating_pr,
    /// completed, failed. Kept as a string so unknown stages pass through.
    #[serde(default)]
    pub status: Option<String>,
    #[serde(default)]
    pub progress_pct: Option<u32>,
    #[serde(default)]
    pub current_step: Option<String>,
    #[serde(default)]
    pub fix_approach: Option<String>,
    #[serde(default)]
    pub files_modified: Vec<String>,
    #[serde(default)]
    pub tests_passed: Option<bool>,
    #[serde(default)]
    pub tests_added: Option<u32>,
    #[serde(default)]
    pub pr_url: Option<String>,
    #[serde(default)]
    pub error_message: Option<String>,
    #[serde(default)]
    pub confidence: Option<String>,
    #[serde(flatten)]
    pub extra: BTreeMap<String, serde_json::Value>,
}

/// Human review decision on a session's outcome.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ReviewStatus {
    Pending,
    Approved,
    Rejected,
}

/// Mutable state for one `(finding, attempt)` pair.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RemediationSession {
    #[serde(default)]
    pub session_id: Option<String>,
    pub finding: Finding,
    pub playbook_id: String,
    pub status: SessionState,
    #[serde(default)]
    pub backend_url: Option<String>,
    #[serde(default)]
    pub pr_url: Option<String>,
    #[serde(default)]
    pub structured_output: Option<StructuredOutput>,
    pub wave_number: u32,
    pub attempt: u32,
    #[serde(default)]
    pub created_at: Option<DateTime<Utc>>,
    #[serde(default)]
    pub completed_at: Option<DateTime<Utc>>,
    #[serde(default)]
    pub error_message: Option<String>,
    pub data_source: DataSource,
    #[serde(default)]
    pub version: u64,
    #[serde(default)]
    pub review_status: Option<ReviewStatus>,
    #[serde(default)]
    pub reviewed_by: Option<String>,
    #[serde(default)]
    pub reviewed_at: Option<DateTime<Utc>>,
    #[serde(default)]
    pub review_reason: Option<String>,
}

impl RemediationSession {
    /// Fresh PENDING session for a finding, attempt 1.
    pub fn new(finding: Finding, playbook_id: String, wave_number: u32) -> Self {
        Self {
            session_id: None,
            finding,
            playbook_id,
            status: SessionState::Pending,
            backend_url: None,
            pr_url: None,
            structured_output: None,
            wave_number,
            attempt: 1,
            created_at: None,
            completed_at: None,
            error_message: None,
            data_source: DataSource::Mock,
            version: 0,
            review_status: None,
            reviewed_by: None,
            reviewed_at: None,
            review_reason: None,
        }
    }

    /// New session record for the next attempt at the same finding.
    /// Retries carry a fresh idempotency key, so no fields are inherited
    /// beyond the finding, playbook, and wave.
    pub fn retry_of(&self) -> Self {
        let mut next = Self::new(
            self.finding.clone(),
            self.playbook_id.clone(),
            self.wave_number,
        );
        next.attempt = self.attempt + 1;
        next
    }

    pub fn duration_minutes(&self) -> Option<f64> {
        match (self.created_at, self.completed_at) {
            (Some(start), Some(end)) => Some((end - start).num_seconds() as f64 / 60.0),
            _ => None,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum WaveStatus {
    Pending,
    Running,
    Completed,
}

/// Ordered group of sessions dispatched together. Membership is fixed at
/// construction except for retry records, which append.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Wave {
    pub wave_number: u32,
    pub sessions: Vec<RemediationSession>,
    pub status: WaveStatus,
    #[serde(default)]
    pub success_count: u32,
    #[serde(default)]
    pub failure_count: u32,
}

impl Wave {
    pub fn total_count(&self) -> usize {
        self.sessions.len()
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RunStatus {
    Pending,
    Running,
    Completed,
    Paused,
    Interrupted,
}

impl RunStatus {
    pub fn as_str(self) -> &'static str {
        match self {
            RunStatus::Pending => "pending",
            RunStatus::Running => "running",
            RunStatus::Completed => "completed",
            RunStatus::Paused => "paused",
            RunStatus::Interrupted => "interrupted",
        }
    }
}

/// Timeline event kinds, spelled exactly as they appear on disk.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum EventKind {
    RunStarted,
    WaveStarted,
    SessionStarted,
    SessionProgress,
    SessionCompleted,
    SessionFailed,
    SessionRetry,
    WaveCompleted,
    WaveGated,
    RunCompleted,
    RunInterrupted,
    ReviewApproved,
    ReviewRejected,
    IdempotencyHit,
}

/// Append-only timeline record, ordered by insertion.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TimelineEvent {
    pub timestamp: DateTime<Utc>,
    pub event_type: EventKind,
    pub message: String,
    #[serde(default)]
    pub details: serde_json::Value,
}

impl TimelineEvent {
    pub fn new(event_type: EventKind, message: impl Into<String>, details: serde_json::Value) -> Self {
        Self {
            timestamp: Utc::now(),
            event_type,
            message: message.into(),
            details,
        }
    }
}

/// Root aggregate for one run.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BatchRun {
    pub run_id: String,
    pub started_at: DateTime<Utc>,
    pub waves: Vec<Wave>,
    pub total_findings: usize,
    #[serde(default)]
    pub completed: usize,
    #[serde(default)]
    pub successful: usize,
    #[serde(default)]
    pub failed: usize,
    #[serde(default)]
    pub prs_created: usize,
    pub status: RunStatus,
    pub data_source: RunMode,
    #[serde(default)]
    pub events: Vec<TimelineEvent>,
}

impl BatchRun {
    pub fn new(run_id: String, waves: Vec<Wave>, data_source: RunMode) -> Self {
        let total_findings = waves.iter().map(|w| w.sessions.len()).sum();
        Self {
            run_id,
            started_at: Utc::now(),
            waves,
            total_findings,
            completed: 0,
            successful: 0,
            failed: 0,
            prs_created: 0,
            status: RunStatus::Pending,
            data_source,
            events: Vec::new(),
        }
    }

    /// Iterate every session across all waves, retries included.
    pub fn sessions(&self) -> impl Iterator<Item = &RemediationSession> {
        self.waves.iter().flat_map(|w| w.sessions.iter())
    }
}

/// One row in `runs/index.json`. The index is append-order, newest last.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RunSummary {
    pub run_id: String,
    pub started_at: DateTime<Utc>,
    pub status: RunStatus,
    pub total_findings: usize,
    #[serde(default)]
    pub csv_filename: Option<String>,
    pub data_source: RunMode,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum BootstrapStatus {
    Starting,
    Started,
    FailedToSpawn,
}

/// Lifecycle marker written by the upload handler and updated by the
/// spawned engine process (`runs/<run_id>/bootstrap.json`).
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BootstrapMarker {
    pub status: BootstrapStatus,
    pub started_at: DateTime<Utc>,
    pub run_id: String,
    #[serde(default)]
    pub pid: Option<u32>,
    #[serde(default)]
    pub error: Option<String>,
}

#[cfg(test)]
mod tests {
    use super::*;

    fn finding() -> Finding {
        Finding {
            finding_id: "FIND-0001".into(),
            scanner: "sast".into(),
            category: FindingCategory::SqlInjection,
            severity: Severity::High,
            title: "SQL built via string concat".into(),
            description: "User input reaches a raw query".into(),
            service_name: "payment-service".into(),
            repo_url: "https://github.com/acme/payment-service".into(),
            file_path: "src/dao/OrderDao.java".into(),
            line_number: Some(42),
            cwe_id: Some("CWE-89".into()),
            dependency_name: None,
            current_version: None,
            fixed_version: None,
            language: Some("java".into()),
            priority_score: 0.0,
        }
    }

    #[test]
    fn session_state_classification() {
        assert!(SessionState::Success.is_terminal());
        assert!(SessionState::Failed.is_terminal());
        assert!(SessionState::Timeout.is_terminal());
        assert!(!SessionState::Blocked.is_terminal());
        assert!(SessionState::Blocked.is_active());
        assert!(!SessionState::Pending.is_active());
    }

    #[test]
    fn retry_record_starts_fresh() {
        let mut first = RemediationSession::new(finding(), "pb-1".into(), 2);
        first.session_id = Some("sess-a".into());
        first.status = SessionState::Failed;
        first.pr_url = Some("https://example.com/pr/1".into());
        first.version = 7;

        let retry = first.retry_of();
        assert_eq!(retry.attempt, 2);
        assert_eq!(retry.wave_number, 2);
        assert_eq!(retry.status, SessionState::Pending);
        assert!(retry.session_id.is_none());
        assert!(retry.pr_url.is_none());
        assert_eq!(retry.version, 0);
    }

    #[test]
    fn enums_serialize_snake_case() {
        assert_eq!(
            serde_json::to_string(&FindingCategory::DependencyVulnerability).unwrap(),
            "\"dependency_vulnerability\""
        );
        assert_eq!(serde_json::to_string(&SessionState::Dispatched).unwrap(), "\"dispatched\"");
        assert_eq!(serde_json::to_string(&RunStatus::Interrupted).unwrap(), "\"interrupted\"");
        assert_eq!(serde_json::to_string(&EventKind::WaveGated).unwrap(), "\"wave_gated\"");
    }

    #[test]
    fn structured_output_preserves_unknown_keys() {
        let raw = serde_json::json!({
            "finding_id": "FIND-0001",
            "status": "fixing",
            "progress_pct": 40,
            "current_step": "patching",
            "playbook_custom": {"branch": "security/fix"},
        });
        let so: StructuredOutput = serde_json::from_value(raw.clone()).unwrap();
        assert_eq!(so.status.as_deref(), Some("fixing"));
        assert!(so.extra.contains_key("playbook_custom"));

        let back = serde_json::to_value(&so).unwrap();
        assert_eq!(back["playbook_custom"]["branch"], "security/fix");
    }

    #[test]
    fn batch_run_round_trips() {
        let mut session = RemediationSession::new(finding(), "pb-1".into(), 1);
        session.status = SessionState::Success;
        session.created_at = Some(Utc::now());
        session.completed_at = Some(Utc::now());
        let wave = Wave {
            wave_number: 1,
            sessions: vec![session],
            status: WaveStatus::Completed,
            success_count: 1,
            failure_count: 0,
        };
        let mut run = BatchRun::new("a1b2c3d4".into(), vec![wave], RunMode::Mock);
        run.events.push(TimelineEvent::new(
            EventKind::RunStarted,
            "Remediation run a1b2c3d4 started",
            serde_json::json!({}),
        ));

        let text = serde_json::to_string_pretty(&run).unwrap();
        let back: BatchRun = serde_json::from_str(&text).unwrap();
        assert_eq!(back.run_id, run.run_id);
        assert_eq!(back.total_findings, 1);
        assert_eq!(back.waves[0].sessions[0].status, SessionState::Success);
        assert_eq!(back.events.len(), 1);
        assert_eq!(back.events[0].event_type, EventKind::RunStarted);
    }
}
