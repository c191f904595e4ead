//! Remote agent-platform backend: HTTP + Bearer, hardened with retry,
//! jittered exponential backoff, `Retry-After`, and a circuit breaker.
//!
//! Every request is cancellable through the shared [`CancellationToken`];
//! cancellation during a retry backoff is observed immediately.

use std::time::Duration;

use async_trait::async_trait;
use rand::Rng;
use reqwest::{Client, Method, StatusCode};
use tokio_util::sync::CancellationToken;

use crate::config::Config;

use super::breaker::CircuitBreaker;
use super::{
    AgentBackend, BackendError, CreateSessionRequest, CreatedSession, Playbook, SessionSnapshot,
};

/// Response statuses worth retrying.
const RETRYABLE: [u16; 4] = [429, 500, 502, 503];
/// `Retry-After` values are honored up to this cap.
const RETRY_AFTER_CAP: Duration = Duration::from_secs(60);

pub struct RemoteBackend {
    http: Client,
    base_url: String,
    api_key: String,
    max_retries: u32,
    retry_base: Duration,
    jitter_max: f64,
    breaker: CircuitBreaker,
    cancel: CancellationToken,
}

impl RemoteBackend {
    pub fn new(api_key: impl Into<String>, base_url: impl Into<String>) -> Self {
        let base_url = base_url.into();
        Self {
            http: Client::new(),
            base_url: base_url.trim_end_matches('/').to_string(),
            api_key: api_key.into(),
            max_retries: 3,
            retry_base: Duration::from_secs(1),
            jitter_max: 1.0,
            breaker: CircuitBreaker::new(5, Duration::from_secs(30)),
            cancel: CancellationToken::new(),
        }
    }

    pub fn from_config(config: &Config, cancel: CancellationToken) -> Self {
        let mut backend = Self::new(&config.agent_api_key, &config.agent_api_base_url);
        // `config.max_retries` caps session attempts, not HTTP attempts; the
        // per-request retry count stays at this client's own default.
        backend.jitter_max = config.retry_jitter_max_seconds;
        backend.breaker = CircuitBreaker::new(
            config.circuit_breaker_threshold,
            Duration::from_secs(config.circuit_breaker_cooldown_seconds),
        );
        backend.cancel = cancel;
        backend
    }

    pub fn with_retries(mut self, max_retries: u32, jitter_max: f64) -> Self {
        self.max_retries = max_retries;
        self.jitter_max = jitter_max;
        self
    }

    /// Shrink the backoff base; stub-server tests use this to stay fast.
    pub fn with_retry_base(mut self, base: Duration) -> Self {
        self.retry_base = base;
        self
    }

    pub fn with_breaker(mut self, threshold: u32, cooldown: Duration) -> Self {
        self.breaker = CircuitBreaker::new(threshold, cooldown);
        self
    }

    pub fn with_cancellation(mut self, cancel: CancellationToken) -> Self {
        self.cancel = cancel;
        self
    }

    /// Exponential delay before retry `attempt` (0-based), plus jitter,
    /// unless the server supplied a usable `Retry-After`.
    fn retry_delay(&self, attempt: u32, retry_after: Option<&str>) -> Duration {
        let base = retry_after
            .and_then(|raw| raw.trim().parse::<f64>().ok())
            .map(|secs| Duration::from_secs_f64(secs.max(0.0)).min(RETRY_AFTER_CAP))
            .unwrap_or_else(|| self.retry_base.mul_f64(2f64.powi(attempt as i32)));

        let jitter = if self.jitter_max > 0.0 {
            Duration::from_secs_f64(rand::thread_rng().gen_range(0.0..self.jitter_max))
        } else {
            Duration::ZERO
        };
        base + jitter
    }

    async fn sleep_cancellable(&self, delay: Duration) -> Result<(), BackendError> {
        tokio::select! {
            _ = self.cancel.cancelled() => Err(BackendError::Cancelled),
            _ = tokio::time::sleep(delay) => Ok(()),
        }
    }

    /// One logical API call: breaker gate, then up to `max_retries + 1`
    /// attempts with backoff on 429/5xx and network errors.
    async fn request(
        &self,
        method: Method,
        path: &str,
        body: Option<serde_json::Value>,
        query: &[(&str, String)],
    ) -> Result<serde_json::Value, BackendError> {
        self.breaker.check()?;
        let url = format!("{}{}", self.base_url, path);
        let mut last_status: u16 = 0;

        for attempt in 0..=self.max_retries {
            let mut builder = self
                .http
                .request(method.clone(), &url)
                .bearer_auth(&self.api_key);
            if !query.is_empty() {
                builder = builder.query(query);
            }
            if let Some(ref body) = body {
                builder = builder.json(body);
            }

            let response = tokio::select! {
                _ = self.cancel.cancelled() => return Err(BackendError::Cancelled),
                resp = builder.send() => resp,
            };

            match response {
                Ok(resp) => {
                    let status = resp.status();
                    last_status = status.as_u16();

                    if RETRYABLE.contains(&status.as_u16()) && attempt < self.max_retries {
                        let retry_after = resp
                            .headers()
                            .get(reqwest::header::RETRY_AFTER)
                            .and_then(|v| v.to_str().ok())
                            .map(str::to_owned);
                        let delay = self.retry_delay(attempt, retry_after.as_deref());
                        tracing::warn!(
                            "Retryable error {} on {} {}, retrying in {:.1}s (attempt {}/{})",
                            status,
                            method,
                            path,
                            delay.as_secs_f64(),
                            attempt + 1,
                            self.max_retries,
                        );
                        self.sleep_cancellable(delay).await?;
                        continue;
                    }

                    if status.as_u16() >= 400 {
                        let text = resp.text().await.unwrap_or_default();
                        self.breaker.record_failure();
                        return Err(BackendError::Api {
                            status: status.as_u16(),
                            body: text,
                        });
                    }

                    self.breaker.record_success();
                    if status == StatusCode::NO_CONTENT {
                        return Ok(serde_json::json!({}));
                    }
                    let text = resp.text().await.unwrap_or_default();
                    if text.is_empty() {
                        return Ok(serde_json::json!({}));
                    }
                    return Ok(serde_json::from_str(&text).unwrap_or(serde_json::json!({})));
                }
                Err(e) => {
                    self.breaker.record_failure();
                    if attempt < self.max_retries {
                        let delay = self.retry_delay(attempt, None);
                        tracing::warn!(
                            "Network error on {} {}: {}, retrying in {:.1}s",
                            method,
                            path,
                            e,
                            delay.as_secs_f64(),
                        );
                        self.sleep_cancellable(delay).await?;
                        continue;
                    }
                    return Err(BackendError::Network(e.to_string()));
                }
            }
        }

        self.breaker.record_failure();
        Err(BackendError::Api {
            status: last_status,
            body: format!("retryable error after {} retries", self.max_retries),
        })
    }

    #[cfg(test)]
    pub(crate) fn breaker(&self) -> &CircuitBreaker {
        &self.breaker
    }
}

fn from_value<T: serde::de::DeserializeOwned>(value: serde_json::Value) -> Result<T, BackendError> {
    serde_json::from_value(value).map_err(|e| BackendError::Network(format!("bad response shape: {e}")))
}

/// The list endpoints return either a bare array or `{"<key>": [...]}`.
fn unwrap_list(value: serde_json::Value, key: &str) -> serde_json::Value {
    if value.is_array() {
        value
    } else {
        value.get(key).cloned().unwrap_or(serde_json::json!([]))
    }
}

#[async_trait]
impl AgentBackend for RemoteBackend {
    async fn create_session(&self, req: CreateSessionRequest) -> Result<CreatedSession, BackendError> {
        let body = serde_json::to_value(&req)
            .map_err(|e| BackendError::Network(format!("bad request shape: {e}")))?;
        let value = self.request(Method::POST, "/sessions", Some(body), &[]).await?;
        from_value(value)
    }

    async fn get_session(&self, session_id: &str) -> Result<SessionSnapshot, BackendError> {
        let value = self
            .request(Method::GET, &format!("/sessions/{session_id}"), None, &[])
            .await?;
        from_value(value)
    }

    async fn list_sessions(
        &self,
        tags: Option<&[String]>,
        limit: usize,
        offset: usize,
    ) -> Result<Vec<SessionSnapshot>, BackendError> {
        let mut query = vec![("limit", limit.to_string()), ("offset", offset.to_string())];
        if let Some(tags) = tags {
            query.push(("tags", tags.join(",")));
        }
        let value = self.request(Method::GET, "/sessions", None, &query).await?;
        from_value(unwrap_list(value, "sessions"))
    }

    async fn send_message(&self, session_id: &str, message: &str) -> Result<(), BackendError> {
        self.request(
            Method::POST,
            &format!("/sessions/{session_id}/message"),
            Some(serde_json::json!({ "message": message })),
            &[],
        )
        .await?;
        Ok(())
    }

    async fn terminate_session(&self, session_id: &str) -> Result<(), BackendError> {
        self.request(Method::DELETE, &format!("/sessions/{session_id}"), None, &[])
            .await?;
        Ok(())
    }

    async fn terminate_session_best_effort(&self, session_id: &str) -> Result<(), BackendError> {
        match self.terminate_session(session_id).await {
            Err(BackendError::Api { status: 404, .. }) => {
                // Already gone — undo the breaker failure this recorded.
                self.breaker.record_success();
                Ok(())
            }
            other => other,
        }
    }

    async fn create_playbook(&self, title: &str, body: &str) -> Result<Playbook, BackendError> {
        let value = self
            .request(
                Method::POST,
                "/playbooks",
                Some(serde_json::json!({ "title": title, "body": body })),
                &[],
            )
            .await?;
        from_value(value)
    }

    async fn list_playbooks(&self) -> Result<Vec<Playbook>, BackendError> {
        let value = self.request(Method::GET, "/playbooks", None, &[]).await?;
        from_value(unwrap_list(value, "playbooks"))
    }

    fn reset_circuit_breaker(&self) {
        self.breaker.reset();
    }
}
