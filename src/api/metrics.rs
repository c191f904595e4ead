//! Derived read-only metrics over the latest run: per-category evaluation
//! and operational timing/throughput/budget.

use std::collections::BTreeMap;

use chrono::Utc;
use serde::Serialize;

use crate::config::Config;
use crate::model::{BatchRun, RemediationSession, SessionState};

/// Minutes of agent work that map to one estimated compute unit.
const MINUTES_PER_UNIT: f64 = 15.0;
/// Throughput guard: elapsed time is clamped to at least one minute.
const MIN_ELAPSED_HOURS: f64 = 1.0 / 60.0;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum Health {
    Critical,
    Degraded,
    Healthy,
    InsufficientData,
}

impl Health {
    /// Sort rank: most severe first, insufficient data after real signals.
    fn rank(self) -> u8 {
        match self {
            Health::Critical => 0,
            Health::Degraded => 1,
            Health::InsufficientData => 2,
            Health::Healthy => 3,
        }
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct CategoryEval {
    pub category: String,
    pub total: usize,
    pub succeeded: usize,
    /// Counts failed, timeout, and blocked sessions.
    pub failed: usize,
    pub pass_rate: Option<f64>,
    pub avg_duration_minutes: Option<f64>,
    /// Sessions past their first attempt.
    pub retry_count: usize,
    /// high=1.0, medium=0.5, low=0.25, averaged where reported.
    pub avg_confidence: Option<f64>,
    pub health: Health,
}

#[derive(Debug, Clone, Serialize)]
pub struct OpsMetrics {
    pub p50_duration_minutes: Option<f64>,
    pub p95_duration_minutes: Option<f64>,
    pub avg_duration_minutes: Option<f64>,
    pub min_duration_minutes: Option<f64>,
    pub max_duration_minutes: Option<f64>,
    pub sessions_per_hour: Option<f64>,
    pub projected_remaining_minutes: Option<f64>,
    pub estimated_units_used: Option<f64>,
    pub estimated_units_budget: Option<f64>,
    pub burn_rate_per_hour: Option<f64>,
    pub current_wave: Option<u32>,
    pub elapsed_minutes: f64,
}

fn confidence_score(session: &RemediationSession) -> Option<f64> {
    match session
        .structured_output
        .as_ref()
        .and_then(|so| so.confidence.as_deref())
    {
        Some("high") => Some(1.0),
        Some("medium") => Some(0.5),
        Some("low") => Some(0.25),
        _ => None,
    }
}

fn counts_as_failed(state: SessionState) -> bool {
    matches!(
        state,
        SessionState::Failed | SessionState::Timeout | SessionState::Blocked
    )
}

/// Per-category evaluation metrics, sorted by health severity.
pub fn evaluate_run(run: &BatchRun) -> Vec<CategoryEval> {
    let mut by_category: BTreeMap<&str, Vec<&RemediationSession>> = BTreeMap::new();
    for session in run.sessions() {
        by_category
            .entry(session.finding.category.as_str())
            .or_default()
            .push(session);
    }

    let mut rows: Vec<CategoryEval> = by_category
        .into_iter()
        .map(|(category, sessions)| {
            let total = sessions.len();
            let succeeded = sessions
                .iter()
                .filter(|s| s.status == SessionState::Success)
                .count();
            let failed = sessions.iter().filter(|s| counts_as_failed(s.status)).count();
            let pass_rate = (total > 0).then(|| succeeded as f64 / total as f64);

            let durations: Vec<f64> = sessions.iter().filter_map(|s| s.duration_minutes()).collect();
            let avg_duration_minutes = (!durations.is_empty())
                .then(|| durations.iter().sum::<f64>() / durations.len() as f64);

            let retry_count = sessions.iter().filter(|s| s.attempt > 1).count();

            let confidences: Vec<f64> = sessions.iter().filter_map(|s| confidence_score(s)).collect();
            let avg_confidence = (!confidences.is_empty())
                .then(|| confidences.iter().sum::<f64>() / confidences.len() as f64);

            let health = if total < 3 {
                Health::InsufficientData
            } else {
                match pass_rate.unwrap_or(0.0) {
                    r if r >= 0.8 => Health::Healthy,
                    r if r >= 0.5 => Health::Degraded,
                    _ => Health::Critical,
                }
            };

            CategoryEval {
                category: category.to_string(),
                total,
                succeeded,
                failed,
                pass_rate,
                avg_duration_minutes,
                retry_count,
                avg_confidence,
                health,
            }
        })
        .collect();

    rows.sort_by(|a, b| {
        a.health
            .rank()
            .cmp(&b.health.rank())
            .then_with(|| a.category.cmp(&b.category))
    });
    rows
}

/// Nearest-rank percentile over an ascending-sorted slice.
fn percentile(sorted: &[f64], p: f64) -> Option<f64> {
    if sorted.is_empty() {
        return None;
    }
    let rank = ((p / 100.0) * sorted.len() as f64).ceil() as usize;
    Some(sorted[rank.clamp(1, sorted.len()) - 1])
}

/// Operational metrics for the latest run. Empty inputs yield nulls.
pub fn operational_metrics(run: &BatchRun, config: &Config) -> OpsMetrics {
    let mut durations: Vec<f64> = run.sessions().filter_map(|s| s.duration_minutes()).collect();
    durations.sort_by(|a, b| a.partial_cmp(b).unwrap_or(std::cmp::Ordering::Equal));

    let elapsed_minutes = (Utc::now() - run.started_at).num_seconds() as f64 / 60.0;
    let elapsed_hours = (elapsed_minutes / 60.0).max(MIN_ELAPSED_HOURS);

    let completed = run.completed;
    let sessions_per_hour = (completed > 0).then(|| completed as f64 / elapsed_hours);

    let remaining = run.total_findings.saturating_sub(completed);
    let projected_remaining_minutes = sessions_per_hour
        .filter(|&rate| rate > 0.0)
        .map(|rate| remaining as f64 / rate * 60.0);

    let terminal_durations: Vec<f64> = run
        .sessions()
        .filter(|s| s.status.is_terminal())
        .filter_map(|s| s.duration_minutes())
        .collect();
    let estimated_units_used = (!terminal_durations.is_empty())
        .then(|| terminal_durations.iter().map(|m| m / MINUTES_PER_UNIT).sum());

    let estimated_units_budget =
        (run.total_findings > 0).then(|| run.total_findings as f64 * config.max_acu_per_session as f64);

    let burn_rate_per_hour = estimated_units_used.map(|used: f64| used / elapsed_hours);

    let current_wave = run
        .waves
        .iter()
        .filter(|w| w.sessions.iter().any(|s| s.status != SessionState::Pending))
        .map(|w| w.wave_number)
        .max();

    OpsMetrics {
        p50_duration_minutes: percentile(&durations, 50.0),
        p95_duration_minutes: percentile(&durations, 95.0),
        avg_duration_minutes: (!durations.is_empty())
            .then(|| durations.iter().sum::<f64>() / durations.len() as f64),
        min_duration_minutes: durations.first().copied(),
        max_duration_minutes: durations.last().copied(),
        sessions_per_hour,
        projected_remaining_minutes,
        estimated_units_used,
        estimated_units_budget,
        burn_rate_per_hour,
        current_wave,
        elapsed_minutes,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::{
        DataSource, Finding, FindingCategory, RunMode, Severity, StructuredOutput, Wave,
        WaveStatus,
    };
    use chrono::{Duration, Utc};

    fn session(
        category: FindingCategory,
        status: SessionState,
        minutes: Option<f64>,
        confidence: Option<&str>,
        attempt: u32,
    ) -> RemediationSession {
        let finding = Finding {
            finding_id: "FIND-0001".into(),
            scanner: "sast".into(),
            category,
            severity: Severity::High,
            title: "t".into(),
            description: "d".into(),
            service_name: "svc".into(),
            repo_url: "r".into(),
            file_path: "f".into(),
            line_number: None,
            cwe_id: None,
            dependency_name: None,
            current_version: None,
            fixed_version: None,
            language: None,
            priority_score: 0.0,
        };
        let mut s = RemediationSession::new(finding, "pb".into(), 1);
        s.status = status;
        s.attempt = attempt;
        s.data_source = DataSource::Mock;
        if let Some(minutes) = minutes {
            let start = Utc::now() - Duration::seconds((minutes * 60.0) as i64) - Duration::hours(1);
            s.created_at = Some(start);
            s.completed_at = Some(start + Duration::seconds((minutes * 60.0) as i64));
        }
        if let Some(confidence) = confidence {
            s.structured_output = Some(StructuredOutput {
                confidence: Some(confidence.to_string()),
                ..Default::default()
            });
        }
        s
    }

    fn run_with(sessions: Vec<RemediationSession>) -> BatchRun {
        let wave = Wave {
            wave_number: 1,
            sessions,
            status: WaveStatus::Completed,
            success_count: 0,
            failure_count: 0,
        };
        let mut run = BatchRun::new("m1".into(), vec![wave], RunMode::Mock);
        run.completed = run
            .sessions()
            .filter(|s| s.status.is_terminal())
            .count();
        run
    }

    #[test]
    fn eval_health_labels_and_sort() {
        use FindingCategory::*;
        let run = run_with(vec![
            // xss: 3 sessions, all success → healthy
            session(Xss, SessionState::Success, Some(10.0), Some("high"), 1),
            session(Xss, SessionState::Success, Some(20.0), Some("medium"), 1),
            session(Xss, SessionState::Success, None, None, 1),
            // sql_injection: 4 sessions, 1 success → critical
            session(SqlInjection, SessionState::Success, Some(5.0), None, 1),
            session(SqlInjection, SessionState::Failed, None, None, 1),
            session(SqlInjection, SessionState::Timeout, None, None, 2),
            session(SqlInjection, SessionState::Blocked, None, None, 1),
            // pii_logging: 2 sessions → insufficient data
            session(PiiLogging, SessionState::Success, None, None, 1),
            session(PiiLogging, SessionState::Failed, None, None, 1),
            // hardcoded_secret: 3 of 4 success → degraded is 0.75 → degraded
            session(HardcodedSecret, SessionState::Success, None, None, 1),
            session(HardcodedSecret, SessionState::Success, None, None, 1),
            session(HardcodedSecret, SessionState::Success, None, None, 1),
            session(HardcodedSecret, SessionState::Failed, None, None, 1),
        ]);

        let rows = evaluate_run(&run);
        let order: Vec<(&str, Health)> = rows
            .iter()
            .map(|r| (r.category.as_str(), r.health))
            .collect();
        assert_eq!(
            order,
            vec![
                ("sql_injection", Health::Critical),
                ("hardcoded_secret", Health::Degraded),
                ("pii_logging", Health::InsufficientData),
                ("xss", Health::Healthy),
            ]
        );

        let sqli = rows.iter().find(|r| r.category == "sql_injection").unwrap();
        assert_eq!(sqli.total, 4);
        assert_eq!(sqli.succeeded, 1);
        // failed + timeout + blocked all count against the category.
        assert_eq!(sqli.failed, 3);
        assert_eq!(sqli.retry_count, 1);

        let xss = rows.iter().find(|r| r.category == "xss").unwrap();
        assert_eq!(xss.avg_duration_minutes, Some(15.0));
        // (1.0 + 0.5) / 2 over the two reported confidences.
        assert_eq!(xss.avg_confidence, Some(0.75));
    }

    #[test]
    fn percentiles_are_nearest_rank() {
        let sorted: Vec<f64> = (1..=20).map(|n| n as f64).collect();
        assert_eq!(percentile(&sorted, 50.0), Some(10.0));
        assert_eq!(percentile(&sorted, 95.0), Some(19.0));
        assert_eq!(percentile(&sorted, 100.0), Some(20.0));
        assert_eq!(percentile(&[], 50.0), None);
        assert_eq!(percentile(&[7.5], 95.0), Some(7.5));
    }

    #[test]
    fn ops_metrics_with_durations() {
        let dir = tempfile::tempdir().unwrap();
        let config = Config::for_tests(dir.path());
        let run = run_with(vec![
            session(FindingCategory::Xss, SessionState::Success, Some(30.0), None, 1),
            session(FindingCategory::Xss, SessionState::Success, Some(60.0), None, 1),
            session(FindingCategory::Xss, SessionState::Failed, Some(15.0), None, 1),
        ]);

        let ops = operational_metrics(&run, &config);
        assert_eq!(ops.min_duration_minutes, Some(15.0));
        assert_eq!(ops.max_duration_minutes, Some(60.0));
        assert_eq!(ops.avg_duration_minutes, Some(35.0));
        assert_eq!(ops.p50_duration_minutes, Some(30.0));
        // 105 minutes of work → 7 estimated units.
        assert_eq!(ops.estimated_units_used, Some(7.0));
        // 3 findings × 5 units cap.
        assert_eq!(ops.estimated_units_budget, Some(15.0));
        assert!(ops.sessions_per_hour.unwrap() > 0.0);
        assert_eq!(ops.current_wave, Some(1));
        assert!(ops.burn_rate_per_hour.unwrap() > 0.0);
        assert_eq!(ops.projected_remaining_minutes, Some(0.0));
    }

    #[test]
    fn ops_metrics_nulls_on_empty_run() {
        let dir = tempfile::tempdir().unwrap();
        let config = Config::for_tests(dir.path());
        let run = BatchRun::new("empty".into(), vec![], RunMode::Mock);

        let ops = operational_metrics(&run, &config);
        assert!(ops.p50_duration_minutes.is_none());
        assert!(ops.p95_duration_minutes.is_none());
        assert!(ops.avg_duration_minutes.is_none());
        assert!(ops.sessions_per_hour.is_none());
        assert!(ops.projected_remaining_minutes.is_none());
        assert!(ops.estimated_units_used.is_none());
        assert!(ops.estimated_units_budget.is_none());
        assert!(ops.current_wave.is_none());
    }
}
