//! Retry with exponential backoff and jitter.
//!
//! Attempt `i` (0-based) is followed by a sleep of
//! `min(base × 2^i + U[0, jitter], cap)`. No sleep follows the final attempt.

use std::future::Future;
use std::time::Duration;

use rand::Rng;
use tokio_util::sync::CancellationToken;

use crate::error::AppError;

/// Retry policy for partner API calls.
#[derive(Debug, Clone, PartialEq)]
pub struct RetryConfig {
    /// Total attempts, including the first one.
    pub max_attempts: u32,
    pub base_delay: Duration,
    /// Upper bound of the uniform jitter added to each delay.
    pub max_jitter: Duration,
    /// Cap applied after jitter.
    pub max_delay: Duration,
}

impl Default for RetryConfig {
    fn default() -> Self {
        Self {
            max_attempts: 5,
            base_delay: Duration::from_secs(10),
            max_jitter: Duration::from_secs(5),
            max_delay: Duration::from_secs(180),
        }
    }
}

impl RetryConfig {
    /// A policy that never sleeps, for tests and dry runs.
    pub fn immediate(max_attempts: u32) -> Self {
        Self {
            max_attempts: max_attempts.max(1),
            base_delay: Duration::ZERO,
            max_jitter: Duration::ZERO,
            max_delay: Duration::ZERO,
        }
    }

    /// The deterministic part of the delay after `attempt`.
    pub fn base_delay_for(&self, attempt: u32) -> Duration {
        let factor = 2u32.checked_pow(attempt).unwrap_or(u32::MAX);
        self.base_delay
            .checked_mul(factor)
            .unwrap_or(self.max_delay)
    }

    /// Delay to sleep after a failed `attempt` (0-based).
    pub fn delay_for_attempt(&self, attempt: u32) -> Duration {
        let jitter_ms = self.max_jitter.as_millis() as u64;
        let jitter = if jitter_ms == 0 {
            Duration::ZERO
        } else {
            Duration::from_millis(rand::rng().random_range(0..=jitter_ms))
        };
        self.base_delay_for(attempt)
            .saturating_add(jitter)
            .min(self.max_delay)
    }
}

/// Runs `op` until it succeeds, returns a non-retryable error, or the
/// attempt ceiling is reached. The last error is returned on exhaustion.
///
/// Cancelling `cancel` interrupts a pending backoff and returns the error
/// of the attempt that preceded it.
pub async fn with_retry<T, F, Fut>(
    config: &RetryConfig,
    cancel: &CancellationToken,
    label: &str,
    mut op: F,
) -> Result<T, AppError>
where
    F: FnMut() -> Fut,
    Fut: Future<Output = Result<T, AppError>>,
{
    let max_attempts = config.max_attempts.max(1);
    let mut attempt = 0;

    loop {
        let err = match op().await {
            Ok(value) => return Ok(value),
            Err(e) => e,
        };

        if !err.is_retryable() {
            return Err(err);
        }
        if attempt + 1 >= max_attempts {
            tracing::error!(
                operation = label,
                attempts = max_attempts,
                error = %err,
                "Retries exhausted"
            );
            return Err(err);
        }

        let delay = config.delay_for_attempt(attempt);
        tracing::warn!(
            operation = label,
            attempt = attempt + 1,
            max_attempts,
            delay_ms = delay.as_millis() as u64,
            error = %err,
            "Request failed, retrying"
        );

        tokio::select! {
            _ = cancel.cancelled() => return Err(err),
            _ = tokio::time::sleep(delay) => {}
        }
        attempt += 1;
    }
}
