//! Retry combinator shared by every hardware call site.
//!
//! Attempt counts and backoffs are per operation type and come from
//! [`crate::config::Timing`]. When a [`RunControl`] is supplied the stop flag
//! is checked before every attempt, so a stop request never waits out a full
//! retry budget.

use crate::control::RunControl;
use std::fmt::Display;
use std::future::Future;
use std::time::Duration;
use thiserror::Error;
use tokio::time::sleep;
use tracing::{debug, warn};

/// Fixed-backoff retry policy.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RetryPolicy {
    /// Total number of attempts, including the first one
    pub max_attempts: u32,
    /// Delay between consecutive attempts
    pub backoff: Duration,
}

impl RetryPolicy {
    /// `max_attempts` is clamped to at least one.
    pub fn new(max_attempts: u32, backoff: Duration) -> Self {
        Self {
            max_attempts: max_attempts.max(1),
            backoff,
        }
    }
}

/// Why a retried operation gave up.
#[derive(Error, Debug, Clone, PartialEq)]
pub enum RetryError<E> {
    /// Every attempt failed, or a non-retryable error occurred.
    #[error("gave up after {attempts} attempt(s): {last}")]
    Exhausted {
        /// Attempts made.
        attempts: u32,
        /// Error of the final attempt.
        last: E,
    },
    /// The stop flag was observed before an attempt.
    #[error("stop requested after {attempts} attempt(s)")]
    Interrupted {
        /// Attempts made before the stop.
        attempts: u32,
    },
}

impl<E> RetryError<E> {
    /// Whether the stop flag ended the retries.
    pub fn is_interrupted(&self) -> bool {
        matches!(self, RetryError::Interrupted { .. })
    }

    /// The last error, if any attempt was made.
    pub fn last_error(&self) -> Option<&E> {
        match self {
            RetryError::Exhausted { last, .. } => Some(last),
            RetryError::Interrupted { .. } => None,
        }
    }
}

/// Run `op` until it succeeds or the policy is exhausted.
pub async fn with_retry<T, E, F, Fut>(
    policy: RetryPolicy,
    control: Option<&RunControl>,
    operation: &str,
    op: F,
) -> Result<T, RetryError<E>>
where
    E: Display,
    F: FnMut(u32) -> Fut,
    Fut: Future<Output = Result<T, E>>,
{
    with_retry_if(policy, control, operation, |_| true, op).await
}

/// Like [`with_retry`], but errors for which `is_retryable` returns false end
/// the loop immediately.
pub async fn with_retry_if<T, E, F, Fut, P>(
    policy: RetryPolicy,
    control: Option<&RunControl>,
    operation: &str,
    is_retryable: P,
    mut op: F,
) -> Result<T, RetryError<E>>
where
    E: Display,
    F: FnMut(u32) -> Fut,
    Fut: Future<Output = Result<T, E>>,
    P: Fn(&E) -> bool,
{
    let max_attempts = policy.max_attempts.max(1);
    let mut attempt = 0;

    loop {
        if let Some(control) = control {
            if control.checkpoint().is_err() {
                debug!(operation, attempts = attempt, "stop requested before attempt");
                return Err(RetryError::Interrupted { attempts: attempt });
            }
        }

        attempt += 1;
        match op(attempt).await {
            Ok(value) => return Ok(value),
            Err(err) if attempt < max_attempts && is_retryable(&err) => {
                warn!(
                    operation,
                    attempt,
                    max_attempts,
                    error = %err,
                    "attempt failed, retrying in {:?}",
                    policy.backoff
                );
                sleep(policy.backoff).await;
            }
            Err(err) => {
                warn!(operation, attempts = attempt, error = %err, "giving up");
                return Err(RetryError::Exhausted {
                    attempts: attempt,
                    last: err,
                });
            }
        }
    }
}
