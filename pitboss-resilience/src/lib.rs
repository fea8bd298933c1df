//! Resilience patterns for Pitboss
//!
//! This crate provides the failure-handling half of the pool: named circuit
//! breakers, retry policies with their delay sequences, the strategy table
//! that maps a classified failure to a recovery strategy, and the
//! orchestrator that runs recoveries in the background.

pub mod backoff;
pub mod bank;
pub mod circuit_breaker;
pub mod recovery;
pub mod retry;
pub mod strategy;

// Re-export commonly used types
pub use backoff::{BackoffCalculator, BackoffStrategy};
pub use bank::{
    CircuitBreakerBank, DispatchPermits, POOL_CONNECTIONS, POOL_RESOURCES, WORKER_INITIALIZATION,
};
pub use circuit_breaker::{
    BreakerPermit, BreakerRejection, BreakerSnapshot, CircuitBreaker, CircuitBreakerConfig,
    CircuitState,
};
pub use recovery::{
    AttemptFn, AttemptFuture, PendingRecovery, RecoveryDisposition, RecoveryMetrics,
    RecoveryOperation, RecoveryOrchestrator, RecoveryState, RecoveryStatus, RecoveryTuning,
};
pub use retry::{RetryError, RetryExecutor, RetryPolicy, Retryable};
pub use strategy::StrategySelector;
