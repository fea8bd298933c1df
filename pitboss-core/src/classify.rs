//! Deterministic mapping from raw failure signals to (category, severity)

use crate::error::{ErrorCategory, ErrorContext, ErrorReason, ErrorRecord, FailureSignal, Severity};

/// Keyword rules applied, in order, to errors reported by a worker itself.
/// The first rule with a keyword contained in the lowercased error type or
/// message wins; anything unmatched is a plain `worker_error`.
const WORKER_REPORTED_RULES: &[(&[&str], ErrorCategory)] = &[
    (&["timeout", "timed out", "timed_out", "deadline"], ErrorCategory::Timeout),
    (
        &["memoryerror", "out of memory", "resource", "exhausted", "quota", "too many open files"],
        ErrorCategory::Resource,
    ),
    (&["connection", "broken pipe", "disconnected"], ErrorCategory::Connection),
    (&["session"], ErrorCategory::Session),
    (&["health"], ErrorCategory::HealthCheck),
    (
        &["decode", "encode", "serializ", "protocol", "jsondecodeerror"],
        ErrorCategory::Communication,
    ),
    (&["importerror", "modulenotfounderror", "not initialized"], ErrorCategory::Initialization),
];

/// Spawn failures caused by the host rather than the worker program
const SPAWN_RESOURCE_KEYWORDS: &[&str] = &[
    "too many open files",
    "resource temporarily unavailable",
    "cannot allocate memory",
    "out of memory",
];

/// Pure failure classifier
pub struct ErrorClassifier;

impl ErrorClassifier {
    /// Classify a raw signal under the given context
    pub fn classify(signal: &FailureSignal, context: &ErrorContext) -> (ErrorCategory, Severity) {
        let category = Self::categorize(signal);
        let severity = Self::adjust_severity(category.base_severity(), context);
        (category, severity)
    }

    /// Category for a signal, independent of context
    pub fn categorize(signal: &FailureSignal) -> ErrorCategory {
        match signal {
            FailureSignal::SpawnFailed { message } => {
                if contains_any(message, SPAWN_RESOURCE_KEYWORDS) {
                    ErrorCategory::Resource
                } else {
                    ErrorCategory::Initialization
                }
            }
            FailureSignal::HandshakeFailed { .. } | FailureSignal::HandshakeTimeout { .. } => {
                ErrorCategory::Initialization
            }
            FailureSignal::ProcessExited { .. } | FailureSignal::ConnectionClosed => {
                ErrorCategory::Connection
            }
            FailureSignal::WriteFailed { .. } | FailureSignal::ProtocolViolation { .. } => {
                ErrorCategory::Communication
            }
            FailureSignal::ResponseTimeout { .. } | FailureSignal::QueueTimeout { .. } => {
                ErrorCategory::Timeout
            }
            FailureSignal::QueueFull { .. }
            | FailureSignal::ResourceExhausted { .. }
            | FailureSignal::RecoveryCapacityExceeded { .. } => ErrorCategory::Resource,
            FailureSignal::HealthProbeFailed { .. } => ErrorCategory::HealthCheck,
            FailureSignal::SessionWorkerUnavailable { .. } => ErrorCategory::Session,
            FailureSignal::WorkerReported {
                error_type,
                message,
            } => Self::categorize_worker_report(error_type, message),
            FailureSignal::CircuitOpen { breaker, .. } => match breaker.as_str() {
                "pool_connections" => ErrorCategory::Connection,
                "pool_resources" => ErrorCategory::Resource,
                "worker_initialization" => ErrorCategory::Initialization,
                _ => ErrorCategory::System,
            },
            FailureSignal::RecoveryCancelled { .. }
            | FailureSignal::ShuttingDown
            | FailureSignal::Unclassified { .. } => ErrorCategory::System,
        }
    }

    fn categorize_worker_report(error_type: &str, message: &str) -> ErrorCategory {
        let haystack = format!("{} {}", error_type, message).to_lowercase();
        WORKER_REPORTED_RULES
            .iter()
            .find(|(keywords, _)| keywords.iter().any(|k| haystack.contains(k)))
            .map(|(_, category)| *category)
            .unwrap_or(ErrorCategory::Worker)
    }

    /// Apply the context modifiers to a base severity
    pub fn adjust_severity(base: Severity, context: &ErrorContext) -> Severity {
        let mut severity = base;

        if context.attempt > 3 {
            severity = severity.escalate();
        }

        if context.user_facing && severity == Severity::Minor {
            severity = Severity::Major;
        }

        if context.affecting_all_workers {
            severity = Severity::Critical;
        }

        severity
    }

    /// Classify and package a signal as an `ErrorRecord`
    pub fn record(signal: FailureSignal, context: ErrorContext) -> ErrorRecord {
        let (category, severity) = Self::classify(&signal, &context);
        let recoverable = category != ErrorCategory::System
            && !matches!(
                signal.reason(),
                ErrorReason::SessionWorkerUnavailable
                    | ErrorReason::CircuitOpen
                    | ErrorReason::RecoveryCancelled
                    | ErrorReason::ShuttingDown
            );

        ErrorRecord {
            category,
            severity,
            recoverable,
            retry_after: None,
            context,
            signal,
        }
    }
}

/// Free-function form of [`ErrorClassifier::classify`]
pub fn classify(signal: &FailureSignal, context: &ErrorContext) -> (ErrorCategory, Severity) {
    ErrorClassifier::classify(signal, context)
}

fn contains_any(text: &str, keywords: &[&str]) -> bool {
    let lowered = text.to_lowercase();
    keywords.iter().any(|k| lowered.contains(k))
}
