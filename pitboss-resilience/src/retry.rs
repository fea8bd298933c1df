//! Retry policy and executor

use log::{debug, info, warn};
use pitboss_core::{ErrorRecord, RecoveryStrategy};
use serde::{Deserialize, Serialize};
use std::future::Future;
use std::time::Duration;
use tokio::time::sleep;

use crate::backoff::{BackoffCalculator, BackoffStrategy};

/// Upper bound applied to any computed retry delay
const MAX_RETRY_DELAY: Duration = Duration::from_secs(300);

/// Retry policy configuration
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RetryPolicy {
    /// Maximum number of retry attempts after the original failure
    pub max_attempts: u32,

    /// Delay before each retry
    pub backoff_strategy: BackoffStrategy,

    /// Whether to add jitter to retry delays
    pub jitter: bool,
}

impl RetryPolicy {
    pub fn new(max_attempts: u32, delays: &[Duration], jitter: bool) -> Self {
        Self {
            max_attempts,
            backoff_strategy: BackoffStrategy::from_delays(delays),
            jitter,
        }
    }

    /// Three quick retries: 0ms, 100ms, 200ms
    pub fn immediate() -> Self {
        Self::new(
            3,
            &[
                Duration::ZERO,
                Duration::from_millis(100),
                Duration::from_millis(200),
            ],
            false,
        )
    }

    /// Five retries doubling from one second
    pub fn backoff() -> Self {
        Self::new(
            5,
            &[
                Duration::from_secs(1),
                Duration::from_secs(2),
                Duration::from_secs(4),
                Duration::from_secs(8),
                Duration::from_secs(16),
            ],
            false,
        )
    }

    /// Default policy for a retrying strategy; `None` for the others
    pub fn for_strategy(strategy: RecoveryStrategy) -> Option<Self> {
        match strategy {
            RecoveryStrategy::ImmediateRetry => Some(Self::immediate()),
            RecoveryStrategy::BackoffRetry => Some(Self::backoff()),
            _ => None,
        }
    }

    /// Delay before retry `attempt` (1-indexed)
    pub fn delay_for_attempt(&self, attempt: u32) -> Duration {
        let calculator = BackoffCalculator::new(
            self.backoff_strategy.clone(),
            Duration::ZERO,
            MAX_RETRY_DELAY,
            self.jitter,
        );

        calculator.calculate_delay(attempt)
    }
}

/// Trait for errors that can be retried
pub trait Retryable {
    /// Whether this error is retryable
    fn is_retryable(&self) -> bool;

    /// Custom retry delay for this error type
    fn retry_delay(&self) -> Option<Duration> {
        None
    }
}

impl Retryable for ErrorRecord {
    fn is_retryable(&self) -> bool {
        self.recoverable
    }

    fn retry_delay(&self) -> Option<Duration> {
        self.retry_after
    }
}

/// Runs the retries of a policy. The original failure has already happened,
/// so every attempt made here is preceded by its delay.
pub struct RetryExecutor {
    policy: RetryPolicy,
}

impl RetryExecutor {
    /// Create a new retry executor with the given policy
    pub fn new(policy: RetryPolicy) -> Self {
        Self { policy }
    }

    pub fn policy(&self) -> &RetryPolicy {
        &self.policy
    }

    /// Retry until success, exhaustion, or a non-retryable error. The
    /// closure receives the 1-indexed retry number.
    pub async fn execute_with_context<F, Fut, T, E>(&self, mut f: F) -> Result<T, RetryError<E>>
    where
        F: FnMut(u32) -> Fut,
        Fut: Future<Output = Result<T, E>>,
        E: Retryable,
    {
        let mut attempt = 1;
        let mut next_delay = self.policy.delay_for_attempt(attempt);

        loop {
            if !next_delay.is_zero() {
                debug!("Retrying in {:?}", next_delay);
                sleep(next_delay).await;
            }

            debug!(
                "Executing retry {} of {}",
                attempt, self.policy.max_attempts
            );

            match f(attempt).await {
                Ok(result) => {
                    info!("Operation succeeded after {} retries", attempt);
                    return Ok(result);
                }
                Err(error) => {
                    if !error.is_retryable() {
                        warn!("Retry {} failed with non-retryable error", attempt);
                        return Err(RetryError::NonRetryableError {
                            attempts: attempt,
                            error,
                        });
                    }

                    if attempt >= self.policy.max_attempts {
                        warn!("Operation failed after {} retries", attempt);
                        return Err(RetryError::MaxAttemptsExceeded {
                            attempts: attempt,
                            last_error: error,
                        });
                    }

                    attempt += 1;
                    next_delay = error
                        .retry_delay()
                        .unwrap_or_else(|| self.policy.delay_for_attempt(attempt));
                }
            }
        }
    }
}

/// Retry error types
#[derive(Debug, thiserror::Error)]
pub enum RetryError<E> {
    /// Maximum retry attempts exceeded
    #[error("Maximum retry attempts ({attempts}) exceeded")]
    MaxAttemptsExceeded { attempts: u32, last_error: E },

    /// Non-retryable error encountered
    #[error("Non-retryable error on retry {attempts}")]
    NonRetryableError { attempts: u32, error: E },
}

impl<E> RetryError<E> {
    /// Retries made, including the last failed one
    pub fn attempts(&self) -> u32 {
        match self {
            RetryError::MaxAttemptsExceeded { attempts, .. }
            | RetryError::NonRetryableError { attempts, .. } => *attempts,
        }
    }

    /// Get the underlying error
    pub fn into_inner(self) -> E {
        match self {
            RetryError::MaxAttemptsExceeded { last_error, .. } => last_error,
            RetryError::NonRetryableError { error, .. } => error,
        }
    }
}
