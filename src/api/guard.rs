//! Guardrails middleware: bearer check, per-IP rate limit, content-type and
//! origin checks. Runs in front of every route.

use std::collections::HashMap;
use std::net::{IpAddr, SocketAddr};
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};

use axum::{
    body::Body,
    extract::{ConnectInfo, State},
    http::{header, Method, Request, StatusCode},
    middleware::Next,
    response::{IntoResponse, Response},
};

use super::routes::AppState;

/// Requests allowed per IP inside one sliding window.
const RATE_LIMIT_MAX: usize = 60;
const RATE_LIMIT_WINDOW: Duration = Duration::from_secs(60);

/// Identity attached to the request by the auth layer; the review path
/// records it as the reviewer. Never sourced from the request body.
#[derive(Debug, Clone)]
pub struct ReviewerIdentity(pub String);

/// Sliding-window request counter per client IP.
#[derive(Clone, Default)]
pub struct RateLimiter {
    hits: Arc<Mutex<HashMap<IpAddr, Vec<Instant>>>>,
}

impl RateLimiter {
    pub fn new() -> Self {
        Self::default()
    }

    /// Record a hit. Err carries the seconds until the oldest hit leaves
    /// the window (the Retry-After hint).
    pub fn check(&self, ip: IpAddr) -> Result<(), u64> {
        let now = Instant::now();
        let mut hits = self.hits.lock().unwrap();
        let bucket = hits.entry(ip).or_default();
        bucket.retain(|t| now.duration_since(*t) < RATE_LIMIT_WINDOW);

        if bucket.len() >= RATE_LIMIT_MAX {
            let oldest = bucket.first().copied().unwrap_or(now);
            let retry_after = RATE_LIMIT_WINDOW
                .saturating_sub(now.duration_since(oldest))
                .as_secs()
                .max(1);
            return Err(retry_after);
        }
        bucket.push(now);
        Ok(())
    }
}

pub(crate) fn constant_time_eq(a: &str, b: &str) -> bool {
    let a = a.as_bytes();
    let b = b.as_bytes();
    if a.len() != b.len() {
        return false;
    }
    let mut diff: u8 = 0;
    for i in 0..a.len() {
        diff |= a[i] ^ b[i];
    }
    diff == 0
}

/// The guardrail chain: rate limit → bearer (when configured) → origin →
/// content-type on mutating methods. Attaches [`ReviewerIdentity`] from the
/// auth context for downstream handlers.
pub async fn guardrails(
    State(state): State<Arc<AppState>>,
    ConnectInfo(addr): ConnectInfo<SocketAddr>,
    mut req: Request<Body>,
    next: Next,
) -> Response {
    // Rate limit first so even unauthenticated floods are cheap.
    if let Err(retry_after) = state.rate_limiter.check(addr.ip()) {
        return (
            StatusCode::TOO_MANY_REQUESTS,
            [(header::RETRY_AFTER, retry_after.to_string())],
            "Rate limit exceeded",
        )
            .into_response();
    }

    // Optional bearer token.
    let mut authenticated = false;
    if let Some(expected) = &state.config.api_bearer_token {
        let supplied = req
            .headers()
            .get(header::AUTHORIZATION)
            .and_then(|h| h.to_str().ok())
            .and_then(|h| h.strip_prefix("Bearer "))
            .unwrap_or("");
        if !constant_time_eq(supplied, expected) {
            return (StatusCode::UNAUTHORIZED, "Invalid or missing bearer token").into_response();
        }
        authenticated = true;
    }

    // Origin check on browser-originating requests.
    if let Some(allowed) = &state.config.allowed_origin {
        if let Some(origin) = req.headers().get(header::ORIGIN).and_then(|h| h.to_str().ok()) {
            if origin != allowed {
                return (StatusCode::FORBIDDEN, "Origin not allowed").into_response();
            }
        }
    }

    // Mutating methods must declare a sane content type: multipart for the
    // upload endpoint, JSON everywhere else.
    if matches!(
        *req.method(),
        Method::POST | Method::PUT | Method::PATCH | Method::DELETE
    ) {
        let content_type = req
            .headers()
            .get(header::CONTENT_TYPE)
            .and_then(|h| h.to_str().ok())
            .unwrap_or("");
        let is_upload = req.uri().path() == "/runs";
        let acceptable = if is_upload {
            content_type.starts_with("multipart/form-data")
                || content_type.starts_with("application/json")
        } else {
            content_type.starts_with("application/json")
        };
        if !acceptable {
            return (
                StatusCode::UNSUPPORTED_MEDIA_TYPE,
                "Unsupported content type",
            )
                .into_response();
        }
    }

    let identity = if authenticated {
        "api-token".to_string()
    } else {
        format!("ip:{}", addr.ip())
    };
    req.extensions_mut().insert(ReviewerIdentity(identity));

    next.run(req).await
}
