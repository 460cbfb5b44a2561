//! Bounded exponential-backoff retry for transiently failing operations.
//!
//! Retry is applied explicitly at call sites by wrapping an operation in
//! [`with_retry`]. It is meant for failures that resolve themselves after a
//! short wait (DNS propagation, `sshd` still booting, provider rate limits),
//! never for validation errors.

use std::fmt::Display;
use std::future::Future;
use std::time::Duration;

use thiserror::Error;
use tokio::time::{sleep, timeout};
use tracing::warn;

/// Default number of attempts, including the first one.
pub const DEFAULT_MAX_ATTEMPTS: u32 = 3;
/// Default delay before the second attempt.
pub const DEFAULT_INITIAL_DELAY: Duration = Duration::from_secs(1);
/// Default upper bound on a single backoff delay.
pub const DEFAULT_MAX_DELAY: Duration = Duration::from_secs(10);

/// Attempt bound and backoff schedule.
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub struct RetryPolicy {
    /// Total attempts, including the first; zero is treated as one.
    pub max_attempts: u32,
    /// Delay after the first failure; doubled after each further failure.
    pub initial_delay: Duration,
    /// Cap applied to every delay.
    pub max_delay: Duration,
}

impl RetryPolicy {
    /// Creates a policy.
    #[must_use]
    pub const fn new(max_attempts: u32, initial_delay: Duration, max_delay: Duration) -> Self {
        Self {
            max_attempts,
            initial_delay,
            max_delay,
        }
    }

    /// Returns the delay to wait after the given failed attempt (1-based).
    #[must_use]
    pub fn delay_after(&self, attempt: u32) -> Duration {
        let exponent = attempt.saturating_sub(1);
        let factor = 2_u32.checked_pow(exponent).unwrap_or(u32::MAX);
        self.initial_delay.saturating_mul(factor).min(self.max_delay)
    }

    const fn attempts(&self) -> u32 {
        if self.max_attempts == 0 {
            1
        } else {
            self.max_attempts
        }
    }
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self::new(DEFAULT_MAX_ATTEMPTS, DEFAULT_INITIAL_DELAY, DEFAULT_MAX_DELAY)
    }
}

/// Errors returned by [`with_retry_within`].
#[derive(Clone, Debug, Error, Eq, PartialEq)]
pub enum RetryError<E> {
    /// The operation failed on its final attempt; carries that failure.
    #[error("{0}")]
    Operation(E),
    /// The outer time budget expired before the operation succeeded.
    #[error("{operation} did not succeed within {} seconds", budget.as_secs())]
    DeadlineExceeded {
        /// Name of the retried operation.
        operation: String,
        /// Budget supplied by the caller.
        budget: Duration,
    },
}

/// Runs `operation` until it succeeds or the policy's attempts run out.
///
/// The error from the final attempt is returned unchanged so callers see the
/// real failure rather than a generic "retries exhausted" error.
///
/// # Errors
///
/// Returns the operation's own error when every attempt fails.
pub async fn with_retry<T, E, F, Fut>(
    policy: &RetryPolicy,
    name: &str,
    mut operation: F,
) -> Result<T, E>
where
    F: FnMut() -> Fut,
    Fut: Future<Output = Result<T, E>>,
    E: Display,
{
    let attempts = policy.attempts();
    let mut attempt = 1;
    loop {
        match operation().await {
            Ok(value) => return Ok(value),
            Err(err) if attempt >= attempts => return Err(err),
            Err(err) => {
                let delay = policy.delay_after(attempt);
                warn!(
                    operation = name,
                    attempt,
                    max_attempts = attempts,
                    ?delay,
                    error = %err,
                    "transient failure; retrying"
                );
                sleep(delay).await;
                attempt += 1;
            }
        }
    }
}

/// Like [`with_retry`], but abandons the attempt loop (including any backoff
/// sleep in progress) once `budget` has elapsed.
///
/// # Errors
///
/// Returns [`RetryError::Operation`] with the final failure, or
/// [`RetryError::DeadlineExceeded`] when the budget expires first.
pub async fn with_retry_within<T, E, F, Fut>(
    policy: &RetryPolicy,
    name: &str,
    budget: Duration,
    operation: F,
) -> Result<T, RetryError<E>>
where
    F: FnMut() -> Fut,
    Fut: Future<Output = Result<T, E>>,
    E: Display,
{
    timeout(budget, with_retry(policy, name, operation))
        .await
        .map_err(|_| RetryError::DeadlineExceeded {
            operation: name.to_owned(),
            budget,
        })?
        .map_err(RetryError::Operation)
}

#[cfg(test)]
mod tests;
