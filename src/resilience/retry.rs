//! Bounded retry with exponential backoff

use std::fmt::Display;
use std::future::Future;
use std::time::Duration;

use tracing::{debug, warn};

use super::Classify;

/// Retry schedule: `max_attempts` tries, waiting `initial_backoff`,
/// then `initial_backoff * multiplier`, ... capped at `max_backoff`
#[derive(Debug, Clone)]
pub struct RetryPolicy {
    pub max_attempts: u32,
    pub initial_backoff: Duration,
    pub multiplier: u32,
    pub max_backoff: Duration,
}

#[derive(Debug, thiserror::Error)]
pub enum RetryError<E> {
    #[error("gave up after {attempts} attempts: {last}")]
    Exhausted { attempts: u32, last: E },

    #[error("{0}")]
    Fatal(E),
}

/// A retry run that already gave up is never retried again by an outer
/// policy; it counts as a failure if its last error did.
impl<E: Classify> Classify for RetryError<E> {
    fn is_retryable(&self) -> bool {
        false
    }

    fn is_failure(&self) -> bool {
        match self {
            RetryError::Exhausted { last, .. } => last.is_failure(),
            RetryError::Fatal(err) => err.is_failure(),
        }
    }
}

impl RetryPolicy {
    pub fn new(max_attempts: u32, initial_backoff: Duration, max_backoff: Duration) -> Self {
        Self {
            max_attempts,
            initial_backoff,
            multiplier: 2,
            max_backoff,
        }
    }

    /// Delay to wait after the given (1-based) failed attempt
    pub fn backoff_for(&self, attempt: u32) -> Duration {
        let factor = self
            .multiplier
            .max(1)
            .saturating_pow(attempt.saturating_sub(1));
        self.initial_backoff
            .checked_mul(factor)
            .unwrap_or(self.max_backoff)
            .min(self.max_backoff)
    }

    /// Run `op` until it succeeds, fails with a non-retryable error, or the
    /// attempts run out. `op` receives the 1-based attempt number.
    pub async fn run<T, E, F, Fut>(&self, operation: &str, mut op: F) -> Result<T, RetryError<E>>
    where
        F: FnMut(u32) -> Fut,
        Fut: Future<Output = Result<T, E>>,
        E: Classify + Display,
    {
        let max_attempts = self.max_attempts.max(1);
        let mut attempt = 1;

        loop {
            match op(attempt).await {
                Ok(value) => return Ok(value),
                Err(err) if !err.is_retryable() => return Err(RetryError::Fatal(err)),
                Err(err) if attempt >= max_attempts => {
                    warn!(operation, attempts = attempt, error = %err, "Retries exhausted");
                    return Err(RetryError::Exhausted {
                        attempts: attempt,
                        last: err,
                    });
                }
                Err(err) => {
                    let delay = self.backoff_for(attempt);
                    debug!(operation, attempt, ?delay, error = %err, "Attempt failed, backing off");
                    tokio::time::sleep(delay).await;
                    attempt += 1;
                }
            }
        }
    }
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self::new(3, Duration::from_millis(50), Duration::from_secs(1))
    }
}
