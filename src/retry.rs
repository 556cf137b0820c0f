//! Retry with exponential backoff and jitter.
//!
//! Delay for attempt *n* is `initial_delay * multiplier^(n-1)`, scaled by a
//! random factor in `[1 - jitter, 1 + jitter]` and clamped to
//! `[0, max_delay]`. Cancellation is checked before every attempt and during
//! every backoff sleep.

use std::time::Duration;

use anyhow::Result;
use tokio_util::sync::CancellationToken;
use tracing::debug;

use crate::error::{ErrorCode, SandboxError, is_retryable};

/// Backoff policy for [`retry`].
#[derive(Debug, Clone)]
pub struct RetryConfig {
    /// Maximum attempts; `0` means unlimited.
    pub max_attempts: u32,
    pub initial_delay: Duration,
    pub max_delay: Duration,
    pub multiplier: f64,
    /// Jitter fraction in `[0, 1]`.
    pub jitter: f64,
    /// When set, only errors whose structured code is in this list are
    /// retried. When `None`, the error's own retryable flag decides.
    pub retryable_codes: Option<Vec<ErrorCode>>,
}

impl Default for RetryConfig {
    fn default() -> Self {
        Self {
            max_attempts: 5,
            initial_delay: Duration::from_secs(1),
            max_delay: Duration::from_secs(30),
            multiplier: 2.0,
            jitter: 0.1,
            retryable_codes: None,
        }
    }
}

impl RetryConfig {
    /// Preset for SSH session establishment: patient and fine-grained.
    #[must_use]
    pub fn ssh() -> Self {
        Self {
            max_attempts: 10,
            initial_delay: Duration::from_millis(500),
            max_delay: Duration::from_secs(15),
            multiplier: 1.5,
            jitter: 0.2,
            retryable_codes: None,
        }
    }

    /// Preset for provider API calls: few attempts, coarse delays.
    #[must_use]
    pub fn network() -> Self {
        Self {
            max_attempts: 3,
            initial_delay: Duration::from_secs(2),
            max_delay: Duration::from_secs(10),
            multiplier: 2.0,
            jitter: 0.1,
            retryable_codes: None,
        }
    }

    fn should_retry(&self, err: &anyhow::Error) -> bool {
        match &self.retryable_codes {
            Some(codes) => crate::error::get_sandbox_error(err)
                .is_some_and(|s| codes.contains(&s.code())),
            None => is_retryable(err),
        }
    }
}

/// Undithered delay for a 1-indexed attempt: exponential growth clamped to
/// `max_delay`.
#[must_use]
pub fn base_delay_for_attempt(config: &RetryConfig, attempt: u32) -> Duration {
    let exp = attempt.saturating_sub(1).min(32);
    let raw = config.initial_delay.as_secs_f64() * config.multiplier.powi(exp as i32);
    Duration::from_secs_f64(raw.min(config.max_delay.as_secs_f64()).max(0.0))
}

/// Delay for a 1-indexed attempt with jitter applied, in
/// `[max(0, D*(1-j)), min(max_delay, D*(1+j))]`.
#[must_use]
pub fn delay_for_attempt(config: &RetryConfig, attempt: u32) -> Duration {
    use rand::Rng;

    let exp = attempt.saturating_sub(1).min(32);
    let base = config.initial_delay.as_secs_f64() * config.multiplier.powi(exp as i32);
    let factor = if config.jitter > 0.0 {
        let mut rng = rand::thread_rng();
        1.0 - config.jitter + rng.r#gen::<f64>() * 2.0 * config.jitter
    } else {
        1.0
    };
    let jittered = (base * factor)
        .min(config.max_delay.as_secs_f64())
        .max(0.0);
    Duration::from_secs_f64(jittered)
}

fn cancelled_error(attempts: u32) -> anyhow::Error {
    SandboxError::new(ErrorCode::Timeout, "retry")
        .with_context("attempts", attempts.to_string())
        .with_suggestion("The operation was cancelled; re-run it to continue")
        .into()
}

/// Run `op` until it succeeds, the policy is exhausted, or `cancel` fires.
///
/// The closure receives the 1-indexed attempt number. A cancelled token
/// yields a `timeout` error carrying the attempt count; policy exhaustion
/// yields a structured error wrapping the last failure.
///
/// # Errors
///
/// Returns the last error once attempts are exhausted, a non-retryable
/// error immediately, or a cancellation error.
pub async fn retry<T, F, Fut>(
    config: &RetryConfig,
    cancel: &CancellationToken,
    mut op: F,
) -> Result<T>
where
    F: FnMut(u32) -> Fut,
    Fut: Future<Output = Result<T>>,
{
    let mut attempt: u32 = 0;
    loop {
        attempt += 1;
        if cancel.is_cancelled() {
            return Err(cancelled_error(attempt - 1));
        }

        match op(attempt).await {
            Ok(value) => return Ok(value),
            Err(err) => {
                if !config.should_retry(&err) {
                    return Err(err);
                }
                if config.max_attempts > 0 && attempt >= config.max_attempts {
                    let code = crate::error::get_sandbox_error(&err)
                        .map_or(ErrorCode::Unknown, SandboxError::code);
                    return Err(SandboxError::new(code, "retry")
                        .with_context("attempts", attempt.to_string())
                        .retryable(false)
                        .with_source(anyhow::anyhow!(
                            "max retries ({}) exceeded: {err:#}",
                            config.max_attempts
                        ))
                        .into());
                }

                let delay = delay_for_attempt(config, attempt);
                debug!(attempt, ?delay, error = %err, "retrying after backoff");
                tokio::select! {
                    () = cancel.cancelled() => return Err(cancelled_error(attempt)),
                    () = tokio::time::sleep(delay) => {}
                }
            }
        }
    }
}
