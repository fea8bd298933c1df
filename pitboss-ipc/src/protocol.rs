//! IPC protocol definitions and message types

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value as JsonValue;
use std::fmt;
use uuid::Uuid;

/// Lightweight health probe every worker must answer
pub const PING_COMMAND: &str = "ping";

/// Asks a worker to release its resources and exit after replying
pub const SHUTDOWN_COMMAND: &str = "shutdown";

/// Upper bound on a single frame body
pub const MAX_FRAME_BYTES: usize = 16 * 1024 * 1024;

/// Request sent from the pool to a worker process
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct WorkerRequest {
    /// Correlation id echoed back in the response
    pub id: Uuid,
    pub command: String,
    #[serde(default = "empty_args")]
    pub args: JsonValue,
    #[serde(skip_serializing_if = "Option::is_none", default)]
    pub session_id: Option<String>,
    pub timestamp: DateTime<Utc>,
}

fn empty_args() -> JsonValue {
    JsonValue::Object(Default::default())
}

impl WorkerRequest {
    /// Create a request with a fresh correlation id
    pub fn new(command: impl Into<String>, args: JsonValue) -> Self {
        Self {
            id: Uuid::new_v4(),
            command: command.into(),
            args: if args.is_null() { empty_args() } else { args },
            session_id: None,
            timestamp: Utc::now(),
        }
    }

    /// Health probe request
    pub fn ping() -> Self {
        Self::new(PING_COMMAND, empty_args())
    }

    /// Graceful shutdown request
    pub fn shutdown() -> Self {
        Self::new(SHUTDOWN_COMMAND, empty_args())
    }

    pub fn with_session(mut self, session_id: Option<String>) -> Self {
        self.session_id = session_id;
        self
    }

    /// Look up a string argument
    pub fn arg_str(&self, key: &str) -> Option<&str> {
        self.args.get(key).and_then(JsonValue::as_str)
    }

    /// Look up an unsigned integer argument
    pub fn arg_u64(&self, key: &str) -> Option<u64> {
        self.args.get(key).and_then(JsonValue::as_u64)
    }
}

/// Outcome flag of a worker response
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ResponseStatus {
    Success,
    Error,
}

impl fmt::Display for ResponseStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ResponseStatus::Success => write!(f, "success"),
            ResponseStatus::Error => write!(f, "error"),
        }
    }
}

/// Response sent from a worker process back to the pool
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct WorkerResponse {
    pub id: Uuid,
    pub status: ResponseStatus,
    #[serde(skip_serializing_if = "Option::is_none", default)]
    pub result: Option<JsonValue>,
    #[serde(skip_serializing_if = "Option::is_none", default)]
    pub error_type: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none", default)]
    pub message: Option<String>,
}

impl WorkerResponse {
    /// Create a successful response
    pub fn success(id: Uuid, result: JsonValue) -> Self {
        Self {
            id,
            status: ResponseStatus::Success,
            result: Some(result),
            error_type: None,
            message: None,
        }
    }

    /// Create a failed response
    pub fn error(id: Uuid, error_type: impl Into<String>, message: impl Into<String>) -> Self {
        Self {
            id,
            status: ResponseStatus::Error,
            result: None,
            error_type: Some(error_type.into()),
            message: Some(message.into()),
        }
    }

    pub fn is_success(&self) -> bool {
        self.status == ResponseStatus::Success
    }

    /// Split into the result value or the reported `(error_type, message)`
    pub fn into_result(self) -> Result<JsonValue, (String, String)> {
        match self.status {
            ResponseStatus::Success => Ok(self.result.unwrap_or(JsonValue::Null)),
            ResponseStatus::Error => Err((
                self.error_type.unwrap_or_else(|| "worker_error".to_string()),
                self.message.unwrap_or_default(),
            )),
        }
    }
}
