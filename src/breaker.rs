//! Circuit breaker over flaky provider endpoints.
//!
//! Classic three-state machine: **closed** passes calls through and counts
//! consecutive failures; **open** rejects until `reset_timeout` has elapsed
//! since the last failure; **half-open** admits a single probe whose outcome
//! decides the next state. All state lives behind one mutex.

use std::sync::Mutex;
use std::time::{Duration, Instant};

use anyhow::Result;
use thiserror::Error;
use tracing::debug;

/// Sentinel returned while the breaker is open.
#[derive(Debug, Error)]
#[error("circuit breaker is open")]
pub struct CircuitOpenError;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BreakerState {
    Closed,
    Open,
    HalfOpen,
}

#[derive(Debug)]
struct Inner {
    state: BreakerState,
    consecutive_failures: u32,
    last_failure: Option<Instant>,
}

/// Thread-safe circuit breaker.
#[derive(Debug)]
pub struct CircuitBreaker {
    max_failures: u32,
    reset_timeout: Duration,
    inner: Mutex<Inner>,
}

impl CircuitBreaker {
    #[must_use]
    pub fn new(max_failures: u32, reset_timeout: Duration) -> Self {
        Self {
            max_failures: max_failures.max(1),
            reset_timeout,
            inner: Mutex::new(Inner {
                state: BreakerState::Closed,
                consecutive_failures: 0,
                last_failure: None,
            }),
        }
    }

    /// Whether a call may proceed right now. An open breaker whose reset
    /// timeout has elapsed transitions to half-open and admits one probe.
    #[must_use]
    pub fn can_execute(&self) -> bool {
        #[allow(clippy::unwrap_used)]
        let mut inner = self.inner.lock().unwrap();
        match inner.state {
            BreakerState::Closed | BreakerState::HalfOpen => true,
            BreakerState::Open => {
                let elapsed = inner
                    .last_failure
                    .map_or(true, |at| at.elapsed() >= self.reset_timeout);
                if elapsed {
                    debug!("circuit breaker half-open, admitting probe");
                    inner.state = BreakerState::HalfOpen;
                    true
                } else {
                    false
                }
            }
        }
    }

    /// Record a successful call: half-open closes, closed resets its count.
    pub fn record_success(&self) {
        #[allow(clippy::unwrap_used)]
        let mut inner = self.inner.lock().unwrap();
        inner.consecutive_failures = 0;
        inner.last_failure = None;
        if inner.state != BreakerState::Closed {
            debug!("circuit breaker closed");
        }
        inner.state = BreakerState::Closed;
    }

    /// Record a failed call: half-open re-opens, closed opens once the
    /// consecutive-failure count reaches the threshold.
    pub fn record_failure(&self) {
        #[allow(clippy::unwrap_used)]
        let mut inner = self.inner.lock().unwrap();
        inner.consecutive_failures = inner.consecutive_failures.saturating_add(1);
        inner.last_failure = Some(Instant::now());
        match inner.state {
            BreakerState::HalfOpen => {
                debug!("probe failed, circuit breaker re-opened");
                inner.state = BreakerState::Open;
            }
            BreakerState::Closed if inner.consecutive_failures >= self.max_failures => {
                debug!(
                    failures = inner.consecutive_failures,
                    "failure threshold reached, circuit breaker opened"
                );
                inner.state = BreakerState::Open;
            }
            _ => {}
        }
    }

    /// Current state without side effects.
    #[must_use]
    pub fn state(&self) -> BreakerState {
        #[allow(clippy::unwrap_used)]
        let inner = self.inner.lock().unwrap();
        inner.state
    }

    /// Force the breaker closed and clear all counters.
    pub fn reset(&self) {
        #[allow(clippy::unwrap_used)]
        let mut inner = self.inner.lock().unwrap();
        inner.state = BreakerState::Closed;
        inner.consecutive_failures = 0;
        inner.last_failure = None;
    }

    /// Run `op` through the breaker, recording its outcome.
    ///
    /// # Errors
    ///
    /// Returns [`CircuitOpenError`] without invoking `op` when the breaker
    /// rejects, otherwise propagates `op`'s error.
    pub async fn call<T, F, Fut>(&self, op: F) -> Result<T>
    where
        F: FnOnce() -> Fut,
        Fut: Future<Output = Result<T>>,
    {
        if !self.can_execute() {
            return Err(CircuitOpenError.into());
        }
        match op().await {
            Ok(value) => {
                self.record_success();
                Ok(value)
            }
            Err(err) => {
                self.record_failure();
                Err(err)
            }
        }
    }
}
