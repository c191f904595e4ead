//! Agent-platform backends.
//!
//! One polymorphic contract, two implementations: [`remote::RemoteBackend`]
//! speaks the platform's HTTP+Bearer protocol with retry and a circuit
//! breaker, [`sim::SimulatedBackend`] computes deterministic session
//! progressions from wall time. Callers cannot tell them apart.

pub mod breaker;
pub mod remote;
pub mod sim;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use thiserror::Error;

#[derive(Debug, Error)]
pub enum BackendError {
    #[error("agent API error {status}: {body}")]
    Api { status: u16, body: String },

    #[error("circuit breaker is open (cooldown {cooldown_secs}s remaining)")]
    CircuitOpen { cooldown_secs: u64 },

    #[error("network error: {0}")]
    Network(String),

    #[error("request cancelled")]
    Cancelled,
}

impl BackendError {
    pub fn status(&self) -> Option<u16> {
        match self {
            BackendError::Api { status, .. } => Some(*status),
            _ => None,
        }
    }
}

/// Parameters for `create_session`. `idempotent` is always sent as true by
/// the engine; the flag exists so the contract mirrors the wire protocol.
#[derive(Debug, Clone, Serialize)]
pub struct CreateSessionRequest {
    pub prompt: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub playbook_id: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub tags: Option<Vec<String>>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub structured_output_schema: Option<serde_json::Value>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub max_acu_limit: Option<u32>,
    pub idempotent: bool,
}

#[derive(Debug, Clone, Deserialize)]
pub struct CreatedSession {
    pub session_id: String,
    #[serde(default)]
    pub url: Option<String>,
    #[serde(default)]
    pub is_new_session: bool,
}

#[derive(Debug, Clone, Default, Deserialize)]
pub struct PullRequest {
    #[serde(default)]
    pub url: Option<String>,
}

/// Point-in-time view of a backend session as returned by `get_session`.
///
/// `status_enum` stays a raw string: the wire enum is
/// `working | blocked | expired | finished | suspend_requested |
/// resume_requested | resumed`, and unknown values must keep polling rather
/// than fail, so interpretation happens in the session manager.
#[derive(Debug, Clone, Deserialize)]
pub struct SessionSnapshot {
    pub session_id: String,
    #[serde(default)]
    pub status_enum: String,
    #[serde(default)]
    pub url: Option<String>,
    #[serde(default)]
    pub title: Option<String>,
    #[serde(default)]
    pub structured_output: Option<serde_json::Value>,
    #[serde(default)]
    pub pull_request: Option<PullRequest>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct Playbook {
    pub playbook_id: String,
    #[serde(default)]
    pub title: String,
}

/// The fixed operation set of the remote agent platform.
#[async_trait]
pub trait AgentBackend: Send + Sync {
    async fn create_session(&self, req: CreateSessionRequest) -> Result<CreatedSession, BackendError>;

    async fn get_session(&self, session_id: &str) -> Result<SessionSnapshot, BackendError>;

    async fn list_sessions(
        &self,
        tags: Option<&[String]>,
        limit: usize,
        offset: usize,
    ) -> Result<Vec<SessionSnapshot>, BackendError>;

    async fn send_message(&self, session_id: &str, message: &str) -> Result<(), BackendError>;

    async fn terminate_session(&self, session_id: &str) -> Result<(), BackendError>;

    /// Terminate for cleanup paths where "already gone" is expected: a 404
    /// must not count against the circuit breaker.
    async fn terminate_session_best_effort(&self, session_id: &str) -> Result<(), BackendError> {
        match self.terminate_session(session_id).await {
            Err(BackendError::Api { status: 404, .. }) => Ok(()),
            other => other,
        }
    }

    async fn create_playbook(&self, title: &str, body: &str) -> Result<Playbook, BackendError>;

    async fn list_playbooks(&self) -> Result<Vec<Playbook>, BackendError>;

    /// Close the breaker after cleanup operations so their failures cannot
    /// block the run proper. No-op for backends without one.
    fn reset_circuit_breaker(&self) {}
}
