//! Configuration management for the orchestrator.
//!
//! Everything is set via environment variables:
//! - `AGENT_API_KEY` - API key for the remote agent platform (required for live/hybrid runs).
//! - `AGENT_API_BASE_URL` - Optional. Defaults to `https://api.devin.ai/v1`.
//! - `MOCK_MODE` - Optional. `true` routes every session to the simulated backend. Defaults to `true`.
//! - `HYBRID_MODE` - Optional. Live for connected repos, simulated for the rest.
//! - `CONNECTED_REPOS` - Optional. Comma-separated repo list consulted in hybrid mode.
//! - `MAX_PARALLEL_SESSIONS` - Optional. Dispatch/poll concurrency cap. Defaults to `10`.
//! - `MAX_ACU_PER_SESSION` - Optional. Compute-unit cap per session. Defaults to `5`.
//! - `POLL_INTERVAL_SECONDS` - Optional. Defaults to `20`.
//! - `SESSION_TIMEOUT_MINUTES` - Optional. Defaults to `90`.
//! - `MIN_SUCCESS_RATE` - Optional. Wave gating threshold. Defaults to `0.7`.
//! - `WAVE_SIZE` - Optional. Findings per wave. Defaults to `10`.
//! - `MAX_RETRIES` - Optional. Max attempts per finding. Defaults to `2`.
//! - `CIRCUIT_BREAKER_THRESHOLD` / `CIRCUIT_BREAKER_COOLDOWN_SECONDS` - Optional. Defaults `5` / `30`.
//! - `RETRY_JITTER_MAX_SECONDS` - Optional. Defaults to `1.0`.
//! - `STATE_FILE_PATH` - Optional. Legacy state pointer. Defaults to `./state.json`.
//! - `RUNS_DIR` / `MEMORY_DIR` - Optional. Default `./runs` and `./memory`.
//! - `HOST` / `PORT` - Optional. HTTP surface bind address. Defaults `127.0.0.1:3000`.
//! - `API_BEARER_TOKEN` - Optional. Enables the bearer check on the HTTP surface.
//! - `ALLOWED_ORIGIN` - Optional. Origin allowed on browser-originating requests.

use std::path::PathBuf;

use thiserror::Error;

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("Missing required environment variable: {0}")]
    MissingEnvVar(String),

    #[error("Invalid value for {0}: {1}")]
    InvalidValue(String, String),
}

/// Orchestrator configuration. Constructed once and handed down; no module
/// reads the environment on its own.
#[derive(Debug, Clone)]
pub struct Config {
    /// Agent platform API key (may be empty in mock mode)
    pub agent_api_key: String,

    /// Agent platform base URL
    pub agent_api_base_url: String,

    /// Route every session to the simulated backend
    pub mock_mode: bool,

    /// Live for connected repos, simulated for everything else
    pub hybrid_mode: bool,

    /// Repos connected to the live platform (hybrid routing table)
    pub connected_repos: Vec<String>,

    /// Concurrency cap for dispatch and polling I/O
    pub max_parallel_sessions: usize,

    /// Compute-unit cap sent with every create_session
    pub max_acu_per_session: u32,

    pub poll_interval_seconds: f64,

    pub session_timeout_minutes: f64,

    /// Wave gating threshold on successful/(successful+failed)
    pub min_success_rate: f64,

    pub wave_size: usize,

    /// Maximum attempts per finding (attempt counter starts at 1)
    pub max_retries: u32,

    pub circuit_breaker_threshold: u32,

    pub circuit_breaker_cooldown_seconds: u64,

    pub retry_jitter_max_seconds: f64,

    /// Legacy state pointer kept equal to the most recent run's state
    pub state_file_path: PathBuf,

    pub runs_dir: PathBuf,

    pub memory_dir: PathBuf,

    pub host: String,

    pub port: u16,

    /// When set, the HTTP surface requires `Authorization: Bearer <token>`
    pub api_bearer_token: Option<String>,

    /// When set, browser-originating requests must carry this Origin
    pub allowed_origin: Option<String>,
}

fn env_parse<T: std::str::FromStr>(name: &str, default: T) -> Result<T, ConfigError>
where
    T::Err: std::fmt::Display,
{
    match std::env::var(name) {
        Ok(raw) => raw
            .parse()
            .map_err(|e| ConfigError::InvalidValue(name.to_string(), format!("{e}"))),
        Err(_) => Ok(default),
    }
}

fn env_bool(name: &str, default: bool) -> bool {
    match std::env::var(name) {
        Ok(raw) => matches!(raw.trim().to_ascii_lowercase().as_str(), "1" | "true" | "yes"),
        Err(_) => default,
    }
}

impl Config {
    /// Load configuration from environment variables.
    pub fn from_env() -> Result<Self, ConfigError> {
        let agent_api_key = std::env::var("AGENT_API_KEY").unwrap_or_default();

        let agent_api_base_url = std::env::var("AGENT_API_BASE_URL")
            .unwrap_or_else(|_| "https://api.devin.ai/v1".to_string());

        let connected_repos = std::env::var("CONNECTED_REPOS")
            .map(|raw| {
                raw.split(',')
                    .map(|r| r.trim().to_string())
                    .filter(|r| !r.is_empty())
                    .collect()
            })
            .unwrap_or_default();

        Ok(Self {
            agent_api_key,
            agent_api_base_url,
            mock_mode: env_bool("MOCK_MODE", true),
            hybrid_mode: env_bool("HYBRID_MODE", false),
            connected_repos,
            max_parallel_sessions: env_parse("MAX_PARALLEL_SESSIONS", 10)?,
            max_acu_per_session: env_parse("MAX_ACU_PER_SESSION", 5)?,
            poll_interval_seconds: env_parse("POLL_INTERVAL_SECONDS", 20.0)?,
            session_timeout_minutes: env_parse("SESSION_TIMEOUT_MINUTES", 90.0)?,
            min_success_rate: env_parse("MIN_SUCCESS_RATE", 0.7)?,
            wave_size: env_parse("WAVE_SIZE", 10)?,
            max_retries: env_parse("MAX_RETRIES", 2)?,
            circuit_breaker_threshold: env_parse("CIRCUIT_BREAKER_THRESHOLD", 5)?,
            circuit_breaker_cooldown_seconds: env_parse("CIRCUIT_BREAKER_COOLDOWN_SECONDS", 30)?,
            retry_jitter_max_seconds: env_parse("RETRY_JITTER_MAX_SECONDS", 1.0)?,
            state_file_path: std::env::var("STATE_FILE_PATH")
                .map(PathBuf::from)
                .unwrap_or_else(|_| PathBuf::from("./state.json")),
            runs_dir: std::env::var("RUNS_DIR")
                .map(PathBuf::from)
                .unwrap_or_else(|_| PathBuf::from("./runs")),
            memory_dir: std::env::var("MEMORY_DIR")
                .map(PathBuf::from)
                .unwrap_or_else(|_| PathBuf::from("./memory")),
            host: std::env::var("HOST").unwrap_or_else(|_| "127.0.0.1".to_string()),
            port: env_parse("PORT", 3000)?,
            api_bearer_token: std::env::var("API_BEARER_TOKEN").ok().filter(|t| !t.is_empty()),
            allowed_origin: std::env::var("ALLOWED_ORIGIN").ok().filter(|o| !o.is_empty()),
        })
    }

    /// The run-level mode derived from the mock/hybrid flags.
    pub fn run_mode(&self) -> crate::model::RunMode {
        if self.hybrid_mode {
            crate::model::RunMode::Hybrid
        } else if self.mock_mode {
            crate::model::RunMode::Mock
        } else {
            crate::model::RunMode::Live
        }
    }

    pub fn session_timeout(&self) -> std::time::Duration {
        std::time::Duration::from_secs_f64((self.session_timeout_minutes * 60.0).max(0.0))
    }

    pub fn poll_interval(&self) -> std::time::Duration {
        std::time::Duration::from_secs_f64(self.poll_interval_seconds.max(0.0))
    }

    /// Create a config rooted at a scratch directory (useful for testing).
    pub fn for_tests(root: &std::path::Path) -> Self {
        Self {
            agent_api_key: String::new(),
            agent_api_base_url: "http://127.0.0.1:0".to_string(),
            mock_mode: true,
            hybrid_mode: false,
            connected_repos: Vec::new(),
            max_parallel_sessions: 10,
            max_acu_per_session: 5,
            poll_interval_seconds: 20.0,
            session_timeout_minutes: 90.0,
            min_success_rate: 0.7,
            wave_size: 10,
            max_retries: 2,
            circuit_breaker_threshold: 5,
            circuit_breaker_cooldown_seconds: 30,
            retry_jitter_max_seconds: 1.0,
            state_file_path: root.join("state.json"),
            runs_dir: root.join("runs"),
            memory_dir: root.join("memory"),
            host: "127.0.0.1".to_string(),
            port: 0,
            api_bearer_token: None,
            allowed_origin: None,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::RunMode;

    #[test]
    fn run_mode_derivation() {
        let dir = tempfile::tempdir().unwrap();
        let mut config = Config::for_tests(dir.path());
        assert_eq!(config.run_mode(), RunMode::Mock);

        config.mock_mode = false;
        assert_eq!(config.run_mode(), RunMode::Live);

        config.hybrid_mode = true;
        assert_eq!(config.run_mode(), RunMode::Hybrid);
    }

    #[test]
    fn durations_derive_from_fields() {
        let dir = tempfile::tempdir().unwrap();
        let mut config = Config::for_tests(dir.path());
        config.session_timeout_minutes = 2.0;
        config.poll_interval_seconds = 7.0;
        assert_eq!(config.session_timeout().as_secs(), 120);
        assert_eq!(config.poll_interval().as_secs(), 7);
    }
}
