//! Simulated agent backend with realistic timing and state transitions.
//!
//! Sessions progress through stages based on elapsed wall-clock time:
//! analyzing (5-10s) → fixing (10-20s) → testing (8-15s) → creating_pr
//! (3-8s) → finished. Roughly 15% of sessions are designated as failures at
//! creation time (seedable RNG); those stall at the testing stage with a
//! `blocked` status. Successful sessions expose a synthetic PR URL once
//! finished. The caller-facing semantics match the remote backend exactly.

use std::collections::HashMap;
use std::sync::Mutex;
use std::time::Instant;

use async_trait::async_trait;
use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};
use regex::Regex;

use super::{
    AgentBackend, BackendError, CreateSessionRequest, CreatedSession, Playbook, SessionSnapshot,
};

/// Stage table: (name, min_duration_s, max_duration_s, progress_start, progress_end).
const STAGES: [(&str, f64, f64, u32, u32); 4] = [
    ("analyzing", 5.0, 10.0, 0, 25),
    ("fixing", 10.0, 20.0, 25, 60),
    ("testing", 8.0, 15.0, 60, 85),
    ("creating_pr", 3.0, 8.0, 85, 95),
];

const FAILURE_RATE: f64 = 0.15;

fn fix_approach(category: &str) -> &'static str {
    match category {
        "sql_injection" => "Replace string concatenation in SQL query with parameterized query using PreparedStatement",
        "dependency_vulnerability" => "Upgrade vulnerable dependency to the patched version specified in the advisory",
        "hardcoded_secret" => "Move hardcoded credential to environment variable and load via application config",
        "pii_logging" => "Redact PII fields (email, phone, SSN) from log output using a sanitization filter",
        "missing_encryption" => "Add AES-256 encryption for sensitive data at rest using a managed key store",
        "access_logging" => "Add structured audit logging middleware to capture access events for compliance",
        "xss" => "Apply context-aware output encoding using the framework's built-in HTML escaping utilities",
        "path_traversal" => "Validate and canonicalize file paths against a whitelist of allowed directories",
        _ => "Apply security best practices to remediate the identified vulnerability",
    }
}

fn files_for(category: &str, service: &str) -> Vec<String> {
    let short = service.trim_end_matches("-service");
    match category {
        "sql_injection" => vec![
            format!("src/main/java/com/acme/{short}/dao/OrderDao.java"),
            format!("src/main/java/com/acme/{short}/dao/OrderDaoTest.java"),
        ],
        "dependency_vulnerability" => vec!["pom.xml".into(), "requirements.txt".into()],
        "hardcoded_secret" => vec![
            format!("src/main/java/com/acme/{short}/config/AppConfig.java"),
            "config.py".into(),
        ],
        "pii_logging" => vec![
            format!("app/routes/{short}_routes.py"),
            "src/middleware/logging.ts".into(),
        ],
        "missing_encryption" => vec![
            format!("src/main/java/com/acme/{short}/model/Customer.java"),
            format!("app/models/{short}.py"),
        ],
        "access_logging" => vec!["src/middleware/auth.ts".into()],
        "xss" => vec![format!("src/controllers/{short}Controller.ts")],
        "path_traversal" => vec!["src/controllers/fileController.ts".into()],
        _ => vec!["src/main/fix.java".into()],
    }
}

const KNOWN_CATEGORIES: [&str; 8] = [
    "sql_injection",
    "dependency_vulnerability",
    "hardcoded_secret",
    "pii_logging",
    "missing_encryption",
    "access_logging",
    "xss",
    "path_traversal",
];

#[derive(Debug, Clone)]
struct SimSession {
    session_id: String,
    created_at: Instant,
    will_fail: bool,
    /// (stage name, duration seconds, progress start, progress end)
    stage_durations: Vec<(&'static str, f64, u32, u32)>,
    prompt: String,
    tags: Vec<String>,
    finding_id: String,
    category: String,
    service: String,
    confidence: &'static str,
    pr_number: u32,
    tests_added: u32,
    terminated: bool,
}

struct SimState {
    rng: StdRng,
    sessions: HashMap<String, SimSession>,
    order: Vec<String>,
    playbooks: Vec<Playbook>,
    next_id: u64,
}

/// Deterministic stand-in for the remote platform.
pub struct SimulatedBackend {
    state: Mutex<SimState>,
    /// Divides every stage duration; tests crank this up to finish in ms.
    time_scale: f64,
    failure_rate: f64,
    finding_re: Regex,
    service_re: Regex,
}

impl SimulatedBackend {
    pub fn new() -> Self {
        Self::seeded(rand::thread_rng().gen())
    }

    pub fn seeded(seed: u64) -> Self {
        Self {
            state: Mutex::new(SimState {
                rng: StdRng::seed_from_u64(seed),
                sessions: HashMap::new(),
                order: Vec::new(),
                playbooks: Vec::new(),
                next_id: 0,
            }),
            time_scale: 1.0,
            failure_rate: FAILURE_RATE,
            finding_re: Regex::new(r"FIND-\d+").expect("static regex"),
            service_re: Regex::new(r"([\w-]+-service)").expect("static regex"),
        }
    }

    pub fn with_time_scale(mut self, scale: f64) -> Self {
        self.time_scale = scale.max(f64::MIN_POSITIVE);
        self
    }

    /// Override the failure designation rate (default ~15%). Tests use 0.0
    /// or 1.0 for deterministic outcomes.
    pub fn with_failure_rate(mut self, rate: f64) -> Self {
        self.failure_rate = rate.clamp(0.0, 1.0);
        self
    }

    fn extract_finding_id(&self, prompt: &str) -> String {
        self.finding_re
            .find(prompt)
            .map(|m| m.as_str().to_string())
            .unwrap_or_else(|| "FIND-UNKNOWN".to_string())
    }

    fn extract_category(&self, prompt: &str, tags: &[String]) -> String {
        for tag in tags {
            if KNOWN_CATEGORIES.contains(&tag.as_str()) {
                return tag.clone();
            }
        }
        let haystack = prompt.to_lowercase().replace(' ', "_");
        for cat in KNOWN_CATEGORIES {
            if haystack.contains(cat) {
                return cat.to_string();
            }
        }
        "other".to_string()
    }

    fn extract_service(&self, prompt: &str, tags: &[String]) -> String {
        if let Some(m) = self.service_re.find(prompt) {
            return m.as_str().to_string();
        }
        tags.iter()
            .find(|t| t.ends_with("-service"))
            .cloned()
            .unwrap_or_else(|| "unknown-service".to_string())
    }

    fn snapshot(&self, session: &SimSession) -> SessionSnapshot {
        if session.terminated {
            return self.build_response(session, "failed", 0, "blocked", Some("Session terminated by user"));
        }

        let elapsed = session.created_at.elapsed().as_secs_f64() * self.time_scale;
        let mut cumulative = 0.0;

        for &(name, dur, p_start, p_end) in &session.stage_durations {
            if elapsed < cumulative + dur {
                if session.will_fail && name == "testing" {
                    return self.build_response(
                        session,
                        "failed",
                        p_start,
                        "blocked",
                        Some("Tests failed: existing tests broke after applying fix"),
                    );
                }
                let frac = (elapsed - cumulative) / dur;
                let progress = p_start + (frac * (p_end - p_start) as f64) as u32;
                return self.build_response(session, name, progress, "working", None);
            }
            cumulative += dur;
        }

        if session.will_fail {
            return self.build_response(
                session,
                "failed",
                60,
                "blocked",
                Some("Tests failed: existing tests broke after applying fix"),
            );
        }
        self.build_response(session, "completed", 100, "finished", None)
    }

    fn build_response(
        &self,
        session: &SimSession,
        stage: &str,
        progress: u32,
        status_enum: &str,
        error: Option<&str>,
    ) -> SessionSnapshot {
        let stage_idx = match stage {
            "analyzing" => 0,
            "fixing" => 1,
            "testing" => 2,
            "creating_pr" => 3,
            "completed" => 4,
            _ => 5, // failed
        };
        let failed = stage == "failed";

        let approach = (stage_idx >= 1 || failed).then(|| fix_approach(&session.category));
        let confidence = (stage_idx >= 1 || failed).then_some(session.confidence);
        let files = if stage_idx >= 2 || failed {
            files_for(&session.category, &session.service)
        } else {
            Vec::new()
        };
        let tests_passed = if failed {
            Some(false)
        } else if stage_idx >= 3 {
            Some(true)
        } else {
            None
        };
        let tests_added = if failed {
            0
        } else if stage_idx >= 3 {
            session.tests_added
        } else {
            0
        };
        let pr_url = matches!(stage, "creating_pr" | "completed").then(|| {
            format!(
                "https://github.com/acme-demo/{}/pull/{}",
                session.service, session.pr_number
            )
        });

        let current_step = match stage {
            "analyzing" => format!(
                "Analyzing finding {}: {} in {}",
                session.finding_id, session.category, session.service
            ),
            "fixing" => format!("Applying fix for {}", session.finding_id),
            "testing" => format!("Running test suite for {}", session.finding_id),
            "creating_pr" => format!("Creating pull request with fix for {}", session.finding_id),
            "completed" => "Pull request created successfully".to_string(),
            _ => "Tests failed after applying fix".to_string(),
        };

        let structured_output = serde_json::json!({
            "finding_id": session.finding_id,
            "status": stage,
            "progress_pct": progress,
            "current_step": current_step,
            "fix_approach": approach,
            "files_modified": files,
            "tests_passed": tests_passed,
            "tests_added": tests_added,
            "pr_url": pr_url,
            "error_message": error,
            "confidence": confidence,
        });

        let pull_request = if stage == "completed" {
            pr_url.as_ref().map(|url| super::PullRequest { url: Some(url.clone()) })
        } else {
            None
        };

        SessionSnapshot {
            session_id: session.session_id.clone(),
            status_enum: status_enum.to_string(),
            url: Some(format!("https://app.devin.ai/sessions/{}", session.session_id)),
            title: Some(format!("Remediate {}", session.finding_id)),
            structured_output: Some(structured_output),
            pull_request,
        }
    }
}

impl Default for SimulatedBackend {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl AgentBackend for SimulatedBackend {
    async fn create_session(&self, req: CreateSessionRequest) -> Result<CreatedSession, BackendError> {
        let mut state = self.state.lock().unwrap();

        if req.idempotent {
            // Idempotency only covers in-flight work: a stalled or finished
            // session is not reused, so a retry gets a genuinely new one.
            let existing = state
                .sessions
                .values()
                .find(|s| s.prompt == req.prompt && self.snapshot(s).status_enum == "working");
            if let Some(existing) = existing {
                tracing::debug!("Idempotent hit for prompt: {:.60}", req.prompt);
                return Ok(CreatedSession {
                    session_id: existing.session_id.clone(),
                    url: Some(format!(
                        "https://app.devin.ai/sessions/{}",
                        existing.session_id
                    )),
                    is_new_session: false,
                });
            }
        }

        state.next_id += 1;
        let session_id = format!("mock-{:08x}", state.next_id);
        let will_fail = state.rng.gen_bool(self.failure_rate);
        let tags = req.tags.clone().unwrap_or_default();
        let finding_id = self.extract_finding_id(&req.prompt);
        let category = self.extract_category(&req.prompt, &tags);
        let service = self.extract_service(&req.prompt, &tags);

        let stage_durations = STAGES
            .iter()
            .map(|&(name, min_dur, max_dur, p_start, p_end)| {
                let dur = state.rng.gen_range(min_dur..max_dur);
                (name, dur, p_start, p_end)
            })
            .collect();
        let confidence = if category == "other" {
            "low"
        } else if state.rng.gen_bool(0.5) {
            "high"
        } else {
            "medium"
        };
        let pr_number = state.rng.gen_range(10..999);
        let tests_added = state.rng.gen_range(1..=5);

        let session = SimSession {
            session_id: session_id.clone(),
            created_at: Instant::now(),
            will_fail,
            stage_durations,
            prompt: req.prompt,
            tags,
            finding_id: finding_id.clone(),
            category,
            service,
            confidence,
            pr_number,
            tests_added,
            terminated: false,
        };

        tracing::info!(
            "Mock session created: {} (will_fail={}, finding={})",
            session_id,
            will_fail,
            finding_id
        );
        state.sessions.insert(session_id.clone(), session);
        state.order.push(session_id.clone());

        Ok(CreatedSession {
            url: Some(format!("https://app.devin.ai/sessions/{session_id}")),
            session_id,
            is_new_session: true,
        })
    }

    async fn get_session(&self, session_id: &str) -> Result<SessionSnapshot, BackendError> {
        let state = self.state.lock().unwrap();
        let session = state.sessions.get(session_id).ok_or(BackendError::Api {
            status: 404,
            body: format!("session {session_id} not found"),
        })?;
        Ok(self.snapshot(session))
    }

    async fn list_sessions(
        &self,
        tags: Option<&[String]>,
        limit: usize,
        offset: usize,
    ) -> Result<Vec<SessionSnapshot>, BackendError> {
        let state = self.state.lock().unwrap();
        let filtered: Vec<&SimSession> = state
            .order
            .iter()
            .filter_map(|id| state.sessions.get(id))
            .filter(|s| match tags {
                Some(wanted) => wanted.iter().all(|t| s.tags.contains(t)),
                None => true,
            })
            .collect();
        Ok(filtered
            .into_iter()
            .skip(offset)
            .take(limit)
            .map(|s| self.snapshot(s))
            .collect())
    }

    async fn send_message(&self, session_id: &str, message: &str) -> Result<(), BackendError> {
        tracing::debug!("Mock send_message to {}: {:.100}", session_id, message);
        Ok(())
    }

    async fn terminate_session(&self, session_id: &str) -> Result<(), BackendError> {
        let mut state = self.state.lock().unwrap();
        if let Some(session) = state.sessions.get_mut(session_id) {
            session.terminated = true;
            tracing::info!("Mock session terminated: {}", session_id);
        }
        Ok(())
    }

    async fn create_playbook(&self, title: &str, body: &str) -> Result<Playbook, BackendError> {
        let _ = body;
        let mut state = self.state.lock().unwrap();
        state.next_id += 1;
        let playbook = Playbook {
            playbook_id: format!("pb-mock-{:08x}", state.next_id),
            title: title.to_string(),
        };
        tracing::info!("Mock playbook created: {} ({})", playbook.playbook_id, title);
        state.playbooks.push(playbook.clone());
        Ok(playbook)
    }

    async fn list_playbooks(&self) -> Result<Vec<Playbook>, BackendError> {
        Ok(self.state.lock().unwrap().playbooks.clone())
    }
}
