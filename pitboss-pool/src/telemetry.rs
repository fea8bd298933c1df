//! Tracing spans for pool calls

use std::time::Duration;
use tracing::field::{display, Empty};
use tracing::Span;

use crate::error::CallResult;

/// Span wrapping one `execute` call, including any recovery it triggers
pub(crate) fn dispatch_span(command: &str, session_id: Option<&str>) -> Span {
    tracing::info_span!(
        "pool.dispatch",
        command,
        session_id = session_id.unwrap_or(""),
        outcome = Empty,
        reason = Empty,
        category = Empty,
        severity = Empty,
        strategy = Empty,
        attempts = Empty,
        duration_ms = Empty,
    )
}

pub(crate) fn record_outcome(span: &Span, result: &CallResult, elapsed: Duration) {
    span.record("duration_ms", elapsed.as_millis() as u64);
    match result {
        Ok(_) => {
            span.record("outcome", "success");
        }
        Err(error) => {
            span.record("outcome", "error");
            span.record("reason", display(error.reason));
            span.record("category", display(error.category));
            span.record("severity", display(error.severity));
            span.record("strategy", display(error.recovery_strategy));
            span.record("attempts", error.attempts);
        }
    }
}
