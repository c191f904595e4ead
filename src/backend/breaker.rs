//! Circuit breaker for the remote backend: closed → open → half_open → closed.

use std::sync::Mutex;
use std::time::{Duration, Instant};

use super::BackendError;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BreakerState {
    Closed,
    Open,
    HalfOpen,
}

#[derive(Debug)]
struct Inner {
    failure_count: u32,
    last_failure: Option<Instant>,
    state: BreakerState,
}

/// Consecutive-failure breaker. While open, every request fails fast with
/// [`BackendError::CircuitOpen`] and performs no I/O; after the cooldown one
/// probe is allowed through (half_open) and its outcome decides the next
/// state.
#[derive(Debug)]
pub struct CircuitBreaker {
    threshold: u32,
    cooldown: Duration,
    inner: Mutex<Inner>,
}

impl CircuitBreaker {
    pub fn new(threshold: u32, cooldown: Duration) -> Self {
        Self {
            threshold,
            cooldown,
            inner: Mutex::new(Inner {
                failure_count: 0,
                last_failure: None,
                state: BreakerState::Closed,
            }),
        }
    }

    /// Current state, promoting open → half_open once the cooldown elapsed.
    pub fn state(&self) -> BreakerState {
        let mut inner = self.inner.lock().unwrap();
        if inner.state == BreakerState::Open {
            if let Some(last) = inner.last_failure {
                if last.elapsed() >= self.cooldown {
                    inner.state = BreakerState::HalfOpen;
                }
            }
        }
        inner.state
    }

    /// Gate a request. Err while open; a half_open probe passes through.
    pub fn check(&self) -> Result<(), BackendError> {
        if self.state() == BreakerState::Open {
            let remaining = {
                let inner = self.inner.lock().unwrap();
                inner
                    .last_failure
                    .map(|last| self.cooldown.saturating_sub(last.elapsed()))
                    .unwrap_or(self.cooldown)
            };
            return Err(BackendError::CircuitOpen {
                cooldown_secs: remaining.as_secs(),
            });
        }
        Ok(())
    }

    pub fn record_success(&self) {
        let mut inner = self.inner.lock().unwrap();
        inner.failure_count = 0;
        inner.state = BreakerState::Closed;
    }

    pub fn record_failure(&self) {
        let mut inner = self.inner.lock().unwrap();
        inner.failure_count += 1;
        inner.last_failure = Some(Instant::now());
        if inner.failure_count >= self.threshold {
            if inner.state != BreakerState::Open {
                tracing::warn!("Circuit breaker OPEN after {} failures", inner.failure_count);
            }
            inner.state = BreakerState::Open;
        }
    }

    /// Force the breaker back to closed, e.g. after a cleanup sweep whose
    /// failures should not poison the run.
    pub fn reset(&self) {
        let mut inner = self.inner.lock().unwrap();
        inner.failure_count = 0;
        inner.state = BreakerState::Closed;
    }
}
