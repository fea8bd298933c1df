use pitboss_core::{
    ClassifiedError, ErrorCategory, ErrorReason, RecoveryStrategy, Severity,
};
use serde::{Deserialize, Serialize};
use serde_json::Value as JsonValue;
use std::collections::HashMap;

/// Flattened, log-friendly view of a surfaced pool error
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ErrorInfo {
    pub reason: ErrorReason,
    pub category: ErrorCategory,
    pub severity: Severity,
    pub recovery_strategy: RecoveryStrategy,
    pub message: String,
    pub is_retryable: bool,
    pub attempts: u32,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub retry_after_ms: Option<u64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub worker_id: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub session_id: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub operation: Option<String>,
    #[serde(skip_serializing_if = "HashMap::is_empty")]
    pub context: HashMap<String, JsonValue>,
    pub suggestions: ErrorSuggestions,
}

#[derive(Debug, Clone, Serialize, Deserialize, Default)]
pub struct ErrorSuggestions {
    #[serde(skip_serializing_if = "Vec::is_empty")]
    pub immediate: Vec<String>,
    #[serde(skip_serializing_if = "Vec::is_empty")]
    pub preventive: Vec<String>,
}

impl ErrorInfo {
    pub fn from_classified(error: &ClassifiedError) -> Self {
        let mut info = Self {
            reason: error.reason,
            category: error.category,
            severity: error.severity,
            recovery_strategy: error.recovery_strategy,
            message: error.message.clone(),
            is_retryable: error.is_retryable(),
            attempts: error.attempts,
            retry_after_ms: error.retry_after.map(|d| d.as_millis() as u64),
            worker_id: error.context.worker_id.clone(),
            session_id: error.context.session_id.clone(),
            operation: error.context.operation.clone(),
            context: error.context.metadata.clone(),
            suggestions: ErrorSuggestions::default(),
        };
        info.add_default_suggestions();
        info
    }

    pub fn with_suggestion(mut self, immediate: impl Into<String>) -> Self {
        self.suggestions.immediate.push(immediate.into());
        self
    }

    pub fn with_preventive_suggestion(mut self, preventive: impl Into<String>) -> Self {
        self.suggestions.preventive.push(preventive.into());
        self
    }

    pub fn to_json(&self) -> JsonValue {
        serde_json::to_value(self).unwrap_or(JsonValue::Null)
    }

    fn add_default_suggestions(&mut self) {
        match self.reason {
            ErrorReason::QueueFull => {
                self.suggestions
                    .immediate
                    .push("retry after in-flight calls drain".to_string());
                self.suggestions
                    .preventive
                    .push("raise pool.queue_depth or pool.size".to_string());
            }
            ErrorReason::QueueTimeout => {
                self.suggestions
                    .preventive
                    .push("raise pool.request_timeout or pool.size".to_string());
            }
            ErrorReason::SessionWorkerUnavailable => {
                self.suggestions
                    .immediate
                    .push("recreate the session state on a new session".to_string());
            }
            ErrorReason::CircuitOpen => {
                if let Some(ms) = self.retry_after_ms {
                    self.suggestions
                        .immediate
                        .push(format!("wait {}ms for the breaker cooldown", ms));
                }
            }
            ErrorReason::RecoveryCapacityExceeded => {
                self.suggestions
                    .preventive
                    .push("raise recovery.max_concurrent_recoveries".to_string());
            }
            _ => {}
        }
    }
}

/// Emit a structured event for a surfaced pool error
///
/// Critical errors log at `error`, major at `warn`, minor at `info`.
pub fn log_classified(error: &ClassifiedError) {
    let info = ErrorInfo::from_classified(error);
    let worker_id = info.worker_id.as_deref().unwrap_or("-");
    let session_id = info.session_id.as_deref().unwrap_or("-");

    macro_rules! emit {
        ($level:ident) => {
            tracing::$level!(
                reason = %info.reason,
                category = %info.category,
                severity = %info.severity,
                strategy = %info.recovery_strategy,
                attempts = info.attempts,
                worker_id,
                session_id,
                retryable = info.is_retryable,
                "{}",
                info.message
            )
        };
    }

    match info.severity {
        Severity::Critical => emit!(error),
        Severity::Major => emit!(warn),
        Severity::Minor => emit!(info),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use pitboss_core::{ErrorClassifier, ErrorContext, FailureSignal};
    use std::time::Duration;

    fn surfaced(signal: FailureSignal, strategy: RecoveryStrategy) -> ClassifiedError {
        let record = ErrorClassifier::record(
            signal,
            ErrorContext::new("execute")
                .with_worker("worker_1")
                .with_session("s1")
                .with_metadata("command", "echo"),
        );
        ClassifiedError::from_record(&record, strategy)
    }

    #[test]
    fn test_from_classified_copies_context() {
        let error = surfaced(
            FailureSignal::ResponseTimeout { after_ms: 1000 },
            RecoveryStrategy::BackoffRetry,
        )
        .with_attempts(6)
        .with_reason(ErrorReason::RetriesExhausted);

        let info = ErrorInfo::from_classified(&error);
        assert_eq!(info.reason, ErrorReason::RetriesExhausted);
        assert_eq!(info.category, ErrorCategory::Timeout);
        assert_eq!(info.attempts, 6);
        assert_eq!(info.worker_id.as_deref(), Some("worker_1"));
        assert_eq!(info.session_id.as_deref(), Some("s1"));
        assert_eq!(info.context["command"], "echo");

        let json = info.to_json();
        assert_eq!(json["category"], "timeout_error");
        assert_eq!(json["reason"], "retries_exhausted");
    }

    #[test]
    fn test_default_suggestions() {
        let info = ErrorInfo::from_classified(&surfaced(
            FailureSignal::QueueFull { depth: 8 },
            RecoveryStrategy::Abandon,
        ));
        assert!(!info.suggestions.preventive.is_empty());

        let mut error = surfaced(
            FailureSignal::CircuitOpen {
                breaker: "pool_connections".to_string(),
                retry_after_ms: 1500,
            },
            RecoveryStrategy::CircuitBreak,
        );
        error.retry_after = Some(Duration::from_millis(1500));
        let info = ErrorInfo::from_classified(&error);
        assert!(info.suggestions.immediate[0].contains("1500ms"));
        assert!(!info.is_retryable);
    }

    #[test]
    fn test_log_classified_without_subscriber() {
        log_classified(&surfaced(
            FailureSignal::ShuttingDown,
            RecoveryStrategy::Abandon,
        ));
    }
}
