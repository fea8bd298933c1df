//! Error types for the worker pool

use pitboss_core::{ClassifiedError, ErrorRecord};
use thiserror::Error;

/// Errors raised while building or tearing down a pool.
///
/// Per-call failures are reported as [`ClassifiedError`] instead.
#[derive(Error, Debug)]
pub enum PoolError {
    #[error("Configuration error: {0}")]
    ConfigurationError(#[from] pitboss_config::ConfigError),

    #[error("No workers started ({failed} of {size} failed): {first_error}")]
    NoWorkersStarted {
        size: usize,
        failed: usize,
        first_error: String,
    },

    #[error("Pool coordinator is no longer running")]
    CoordinatorGone,
}

impl PoolError {
    pub(crate) fn no_workers(size: usize, failures: &[ErrorRecord]) -> Self {
        PoolError::NoWorkersStarted {
            size,
            failed: failures.len(),
            first_error: failures
                .first()
                .map(|record| format!("{} ({})", record.message(), record.category))
                .unwrap_or_else(|| "pool size is zero".to_string()),
        }
    }
}

/// Outcome of one pool call
pub type CallResult = Result<serde_json::Value, ClassifiedError>;

/// Result of pool lifecycle operations
pub type PoolResult<T> = Result<T, PoolError>;
