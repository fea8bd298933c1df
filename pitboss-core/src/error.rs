//! Failure taxonomy for the worker pool

use serde::{Deserialize, Serialize};
use serde_json::Value as JsonValue;
use std::collections::HashMap;
use std::fmt;
use std::time::Duration;
use thiserror::Error;

/// Failure category assigned by the classifier
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum ErrorCategory {
    #[serde(rename = "initialization_error")]
    Initialization,
    #[serde(rename = "connection_error")]
    Connection,
    #[serde(rename = "communication_error")]
    Communication,
    #[serde(rename = "timeout_error")]
    Timeout,
    #[serde(rename = "resource_error")]
    Resource,
    #[serde(rename = "health_check_error")]
    HealthCheck,
    #[serde(rename = "session_error")]
    Session,
    #[serde(rename = "worker_error")]
    Worker,
    #[serde(rename = "system_error")]
    System,
}

impl ErrorCategory {
    pub const ALL: [ErrorCategory; 9] = [
        ErrorCategory::Initialization,
        ErrorCategory::Connection,
        ErrorCategory::Communication,
        ErrorCategory::Timeout,
        ErrorCategory::Resource,
        ErrorCategory::HealthCheck,
        ErrorCategory::Session,
        ErrorCategory::Worker,
        ErrorCategory::System,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            ErrorCategory::Initialization => "initialization_error",
            ErrorCategory::Connection => "connection_error",
            ErrorCategory::Communication => "communication_error",
            ErrorCategory::Timeout => "timeout_error",
            ErrorCategory::Resource => "resource_error",
            ErrorCategory::HealthCheck => "health_check_error",
            ErrorCategory::Session => "session_error",
            ErrorCategory::Worker => "worker_error",
            ErrorCategory::System => "system_error",
        }
    }

    /// Severity before any context modifiers are applied
    pub fn base_severity(&self) -> Severity {
        match self {
            ErrorCategory::Initialization | ErrorCategory::Resource => Severity::Critical,
            ErrorCategory::Connection
            | ErrorCategory::Communication
            | ErrorCategory::Timeout
            | ErrorCategory::Worker
            | ErrorCategory::System => Severity::Major,
            ErrorCategory::HealthCheck | ErrorCategory::Session => Severity::Minor,
        }
    }
}

impl fmt::Display for ErrorCategory {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Failure severity, ordered from least to most severe
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Severity {
    Minor,
    Major,
    Critical,
}

impl Severity {
    /// One level up; critical stays critical
    pub fn escalate(self) -> Self {
        match self {
            Severity::Minor => Severity::Major,
            Severity::Major | Severity::Critical => Severity::Critical,
        }
    }
}

impl fmt::Display for Severity {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Severity::Minor => write!(f, "minor"),
            Severity::Major => write!(f, "major"),
            Severity::Critical => write!(f, "critical"),
        }
    }
}

/// Recovery strategy chosen for a classified failure
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RecoveryStrategy {
    ImmediateRetry,
    BackoffRetry,
    CircuitBreak,
    Failover,
    Abandon,
}

impl RecoveryStrategy {
    /// Strategies that never spawn a recovery task
    pub fn is_terminal(&self) -> bool {
        matches!(self, RecoveryStrategy::CircuitBreak | RecoveryStrategy::Abandon)
    }

    pub fn is_retry(&self) -> bool {
        matches!(
            self,
            RecoveryStrategy::ImmediateRetry | RecoveryStrategy::BackoffRetry
        )
    }
}

impl fmt::Display for RecoveryStrategy {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            RecoveryStrategy::ImmediateRetry => write!(f, "immediate_retry"),
            RecoveryStrategy::BackoffRetry => write!(f, "backoff_retry"),
            RecoveryStrategy::CircuitBreak => write!(f, "circuit_break"),
            RecoveryStrategy::Failover => write!(f, "failover"),
            RecoveryStrategy::Abandon => write!(f, "abandon"),
        }
    }
}

/// Configured replacement for the default strategy of a category.
///
/// With no `severity` the override applies to every severity of the category.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct StrategyOverride {
    pub category: ErrorCategory,
    #[serde(skip_serializing_if = "Option::is_none", default)]
    pub severity: Option<Severity>,
    pub strategy: RecoveryStrategy,
}

impl StrategyOverride {
    pub fn matches(&self, category: ErrorCategory, severity: Severity) -> bool {
        self.category == category && self.severity.map_or(true, |s| s == severity)
    }
}

/// Where and how a failure happened
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ErrorContext {
    #[serde(skip_serializing_if = "Option::is_none", default)]
    pub worker_id: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none", default)]
    pub session_id: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none", default)]
    pub operation: Option<String>,
    /// 1-based attempt number of the failing call
    pub attempt: u32,
    #[serde(default)]
    pub affecting_all_workers: bool,
    #[serde(default)]
    pub user_facing: bool,
    #[serde(skip_serializing_if = "HashMap::is_empty", default)]
    pub metadata: HashMap<String, JsonValue>,
}

impl Default for ErrorContext {
    fn default() -> Self {
        Self {
            worker_id: None,
            session_id: None,
            operation: None,
            attempt: 1,
            affecting_all_workers: false,
            user_facing: false,
            metadata: HashMap::new(),
        }
    }
}

impl ErrorContext {
    pub fn new(operation: impl Into<String>) -> Self {
        Self {
            operation: Some(operation.into()),
            ..Default::default()
        }
    }

    pub fn with_worker(mut self, worker_id: impl Into<String>) -> Self {
        self.worker_id = Some(worker_id.into());
        self
    }

    pub fn with_session(mut self, session_id: impl Into<String>) -> Self {
        self.session_id = Some(session_id.into());
        self
    }

    pub fn with_attempt(mut self, attempt: u32) -> Self {
        self.attempt = attempt.max(1);
        self
    }

    pub fn affecting_all_workers(mut self, flag: bool) -> Self {
        self.affecting_all_workers = flag;
        self
    }

    pub fn user_facing(mut self, flag: bool) -> Self {
        self.user_facing = flag;
        self
    }

    pub fn with_metadata(mut self, key: impl Into<String>, value: impl Serialize) -> Self {
        if let Ok(json_value) = serde_json::to_value(value) {
            self.metadata.insert(key.into(), json_value);
        }
        self
    }
}

/// Raw failure observed somewhere in the pool, before classification
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "signal", rename_all = "snake_case")]
pub enum FailureSignal {
    SpawnFailed { message: String },
    HandshakeFailed { message: String },
    HandshakeTimeout { after_ms: u64 },
    ProcessExited { code: Option<i32> },
    ConnectionClosed,
    WriteFailed { message: String },
    ProtocolViolation { message: String },
    ResponseTimeout { after_ms: u64 },
    QueueFull { depth: usize },
    QueueTimeout { waited_ms: u64 },
    ResourceExhausted { message: String },
    HealthProbeFailed { message: String },
    SessionWorkerUnavailable { session_id: String, worker_id: String },
    WorkerReported { error_type: String, message: String },
    CircuitOpen { breaker: String, retry_after_ms: u64 },
    RecoveryCapacityExceeded { limit: usize },
    RecoveryCancelled { recovery_id: u64 },
    ShuttingDown,
    Unclassified { message: String },
}

impl FailureSignal {
    pub fn reason(&self) -> ErrorReason {
        match self {
            FailureSignal::QueueFull { .. } => ErrorReason::QueueFull,
            FailureSignal::QueueTimeout { .. } => ErrorReason::QueueTimeout,
            FailureSignal::SessionWorkerUnavailable { .. } => ErrorReason::SessionWorkerUnavailable,
            FailureSignal::CircuitOpen { .. } => ErrorReason::CircuitOpen,
            FailureSignal::RecoveryCapacityExceeded { .. } => {
                ErrorReason::RecoveryCapacityExceeded
            }
            FailureSignal::RecoveryCancelled { .. } => ErrorReason::RecoveryCancelled,
            FailureSignal::ShuttingDown => ErrorReason::ShuttingDown,
            _ => ErrorReason::Failed,
        }
    }

    /// Signals the core reports straight back to the caller without recovery
    pub fn is_synchronous(&self) -> bool {
        self.reason() != ErrorReason::Failed
    }
}

impl fmt::Display for FailureSignal {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            FailureSignal::SpawnFailed { message } => write!(f, "worker spawn failed: {}", message),
            FailureSignal::HandshakeFailed { message } => {
                write!(f, "worker handshake failed: {}", message)
            }
            FailureSignal::HandshakeTimeout { after_ms } => {
                write!(f, "worker handshake timed out after {}ms", after_ms)
            }
            FailureSignal::ProcessExited { code: Some(code) } => {
                write!(f, "worker process exited with code {}", code)
            }
            FailureSignal::ProcessExited { code: None } => write!(f, "worker process exited"),
            FailureSignal::ConnectionClosed => write!(f, "worker connection closed"),
            FailureSignal::WriteFailed { message } => {
                write!(f, "failed to write to worker: {}", message)
            }
            FailureSignal::ProtocolViolation { message } => {
                write!(f, "worker protocol violation: {}", message)
            }
            FailureSignal::ResponseTimeout { after_ms } => {
                write!(f, "no response from worker within {}ms", after_ms)
            }
            FailureSignal::QueueFull { depth } => write!(f, "request queue full ({} waiting)", depth),
            FailureSignal::QueueTimeout { waited_ms } => {
                write!(f, "no worker became available within {}ms", waited_ms)
            }
            FailureSignal::ResourceExhausted { message } => {
                write!(f, "resource exhausted: {}", message)
            }
            FailureSignal::HealthProbeFailed { message } => {
                write!(f, "health probe failed: {}", message)
            }
            FailureSignal::SessionWorkerUnavailable {
                session_id,
                worker_id,
            } => write!(
                f,
                "worker {} bound to session {} is no longer available",
                worker_id, session_id
            ),
            FailureSignal::WorkerReported {
                error_type,
                message,
            } => write!(f, "{}: {}", error_type, message),
            FailureSignal::CircuitOpen {
                breaker,
                retry_after_ms,
            } => write!(
                f,
                "circuit {} is open, retry after {}ms",
                breaker, retry_after_ms
            ),
            FailureSignal::RecoveryCapacityExceeded { limit } => {
                write!(f, "recovery capacity of {} exceeded", limit)
            }
            FailureSignal::RecoveryCancelled { recovery_id } => {
                write!(f, "recovery {} cancelled", recovery_id)
            }
            FailureSignal::ShuttingDown => write!(f, "pool is shutting down"),
            FailureSignal::Unclassified { message } => f.write_str(message),
        }
    }
}

/// Distinguishes the outcomes a caller may want to react to
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ErrorReason {
    Failed,
    QueueFull,
    QueueTimeout,
    SessionWorkerUnavailable,
    CircuitOpen,
    RecoveryCapacityExceeded,
    RecoveryCancelled,
    RetriesExhausted,
    ShuttingDown,
}

impl fmt::Display for ErrorReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            ErrorReason::Failed => "failed",
            ErrorReason::QueueFull => "queue_full",
            ErrorReason::QueueTimeout => "queue_timeout",
            ErrorReason::SessionWorkerUnavailable => "session_worker_unavailable",
            ErrorReason::CircuitOpen => "circuit_open",
            ErrorReason::RecoveryCapacityExceeded => "recovery_capacity_exceeded",
            ErrorReason::RecoveryCancelled => "recovery_cancelled",
            ErrorReason::RetriesExhausted => "retries_exhausted",
            ErrorReason::ShuttingDown => "shutting_down",
        };
        f.write_str(name)
    }
}

/// A classified failure, consumed once by the recovery orchestrator
#[derive(Debug, Clone, PartialEq)]
pub struct ErrorRecord {
    pub category: ErrorCategory,
    pub severity: Severity,
    pub recoverable: bool,
    pub retry_after: Option<Duration>,
    pub context: ErrorContext,
    pub signal: FailureSignal,
}

impl ErrorRecord {
    pub fn reason(&self) -> ErrorReason {
        self.signal.reason()
    }

    pub fn message(&self) -> String {
        self.signal.to_string()
    }

    pub fn with_retry_after(mut self, retry_after: Option<Duration>) -> Self {
        self.retry_after = retry_after;
        self
    }
}

/// Error surfaced to callers of the pool
#[derive(Debug, Clone, PartialEq, Error, Serialize, Deserialize)]
#[error("{reason}: {message} ({category}, {severity}, {recovery_strategy})")]
pub struct ClassifiedError {
    pub reason: ErrorReason,
    pub category: ErrorCategory,
    pub severity: Severity,
    pub recovery_strategy: RecoveryStrategy,
    #[serde(with = "humantime_serde", skip_serializing_if = "Option::is_none", default)]
    pub retry_after: Option<Duration>,
    pub message: String,
    pub context: ErrorContext,
    /// Automatic attempts made before surfacing, including the first
    pub attempts: u32,
}

impl ClassifiedError {
    pub fn from_record(record: &ErrorRecord, strategy: RecoveryStrategy) -> Self {
        Self {
            reason: record.reason(),
            category: record.category,
            severity: record.severity,
            recovery_strategy: strategy,
            retry_after: record.retry_after,
            message: record.message(),
            context: record.context.clone(),
            attempts: 1,
        }
    }

    pub fn with_reason(mut self, reason: ErrorReason) -> Self {
        self.reason = reason;
        self
    }

    pub fn with_attempts(mut self, attempts: u32) -> Self {
        self.attempts = attempts;
        self
    }

    pub fn is_session_worker_unavailable(&self) -> bool {
        self.reason == ErrorReason::SessionWorkerUnavailable
    }

    pub fn is_circuit_open(&self) -> bool {
        self.reason == ErrorReason::CircuitOpen
    }

    /// Whether retrying the same call could plausibly succeed
    pub fn is_retryable(&self) -> bool {
        !matches!(
            self.reason,
            ErrorReason::SessionWorkerUnavailable
                | ErrorReason::CircuitOpen
                | ErrorReason::RecoveryCancelled
                | ErrorReason::ShuttingDown
        ) && self.category != ErrorCategory::System
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_category_wire_names() {
        let json = serde_json::to_string(&ErrorCategory::HealthCheck).unwrap();
        assert_eq!(json, "\"health_check_error\"");
        let parsed: ErrorCategory = serde_json::from_str("\"resource_error\"").unwrap();
        assert_eq!(parsed, ErrorCategory::Resource);

        for category in ErrorCategory::ALL {
            let json = serde_json::to_string(&category).unwrap();
            assert_eq!(json, format!("\"{}\"", category.as_str()));
        }
    }

    #[test]
    fn test_severity_escalation() {
        assert_eq!(Severity::Minor.escalate(), Severity::Major);
        assert_eq!(Severity::Major.escalate(), Severity::Critical);
        assert_eq!(Severity::Critical.escalate(), Severity::Critical);
        assert!(Severity::Minor < Severity::Critical);
    }

    #[test]
    fn test_synchronous_signals() {
        assert!(FailureSignal::QueueFull { depth: 4 }.is_synchronous());
        assert!(FailureSignal::CircuitOpen {
            breaker: "pool_resources".to_string(),
            retry_after_ms: 10
        }
        .is_synchronous());
        assert!(!FailureSignal::ConnectionClosed.is_synchronous());
        assert_eq!(
            FailureSignal::SessionWorkerUnavailable {
                session_id: "s1".to_string(),
                worker_id: "worker-2".to_string()
            }
            .reason(),
            ErrorReason::SessionWorkerUnavailable
        );
    }

    #[test]
    fn test_classified_error_serialization() {
        let record = ErrorRecord {
            category: ErrorCategory::Connection,
            severity: Severity::Major,
            recoverable: true,
            retry_after: Some(Duration::from_secs(1)),
            context: ErrorContext::new("execute").with_worker("worker-1"),
            signal: FailureSignal::ConnectionClosed,
        };
        let error = ClassifiedError::from_record(&record, RecoveryStrategy::BackoffRetry);
        let json = serde_json::to_value(&error).unwrap();

        assert_eq!(json["reason"], "failed");
        assert_eq!(json["category"], "connection_error");
        assert_eq!(json["severity"], "major");
        assert_eq!(json["recovery_strategy"], "backoff_retry");
        assert_eq!(json["retry_after"], "1s");
        assert_eq!(json["context"]["worker_id"], "worker-1");
    }

    #[test]
    fn test_strategy_override_matching() {
        let any_severity: StrategyOverride = serde_json::from_str(
            r#"{"category": "worker_error", "strategy": "immediate_retry"}"#,
        )
        .unwrap();
        assert!(any_severity.matches(ErrorCategory::Worker, Severity::Critical));
        assert!(!any_severity.matches(ErrorCategory::Timeout, Severity::Major));

        let critical_only = StrategyOverride {
            severity: Some(Severity::Critical),
            ..any_severity
        };
        assert!(critical_only.matches(ErrorCategory::Worker, Severity::Critical));
        assert!(!critical_only.matches(ErrorCategory::Worker, Severity::Major));
    }

    #[test]
    fn test_retryability() {
        let record = ErrorRecord {
            category: ErrorCategory::Session,
            severity: Severity::Minor,
            recoverable: false,
            retry_after: None,
            context: ErrorContext::default(),
            signal: FailureSignal::SessionWorkerUnavailable {
                session_id: "s1".to_string(),
                worker_id: "worker-0".to_string(),
            },
        };
        let error = ClassifiedError::from_record(&record, RecoveryStrategy::Abandon);
        assert!(error.is_session_worker_unavailable());
        assert!(!error.is_retryable());
    }
}
