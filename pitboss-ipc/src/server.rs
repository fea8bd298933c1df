//! Worker-side request loop
//!
//! A worker binary reads framed [`WorkerRequest`]s from its input, hands each
//! one to a [`RequestHandler`] and writes the framed [`WorkerResponse`] back.
//! [`ReferenceHandler`] is a small built-in handler used by the bundled echo
//! worker and by the pool's tests.

use async_trait::async_trait;
use log::{debug, warn};
use serde_json::{json, Value as JsonValue};
use std::collections::HashMap;
use std::time::Duration;
use tokio::io::{AsyncRead, AsyncWrite};

use crate::error::IpcError;
use crate::protocol::{WorkerRequest, WorkerResponse, PING_COMMAND, SHUTDOWN_COMMAND};
use crate::transport::{FrameReader, FrameWriter};

/// What the request loop should do after handling one request
#[derive(Debug, Clone, PartialEq)]
pub enum HandlerOutcome {
    /// Write the response and keep serving
    Reply(WorkerResponse),
    /// Write the response, then stop with the given exit code
    ReplyAndExit(WorkerResponse, i32),
    /// Stop immediately without replying
    Exit(i32),
}

/// Why [`serve`] returned
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ServeExit {
    /// The pool closed our input
    InputClosed,
    /// The handler asked to stop
    Exit(i32),
}

/// Handles decoded requests inside a worker process
#[async_trait]
pub trait RequestHandler: Send {
    async fn handle(&mut self, request: &WorkerRequest) -> HandlerOutcome;
}

/// Serve requests until the input closes or the handler asks to exit.
///
/// Frames that do not decode as a request are logged and skipped; there is no
/// id to answer them with.
pub async fn serve<R, W, H>(reader: R, writer: W, handler: &mut H) -> Result<ServeExit, IpcError>
where
    R: AsyncRead + Unpin,
    W: AsyncWrite + Unpin,
    H: RequestHandler + ?Sized,
{
    let mut reader = FrameReader::new(reader);
    let mut writer = FrameWriter::new(writer);

    loop {
        let body = match reader.read_frame().await? {
            Some(body) => body,
            None => return Ok(ServeExit::InputClosed),
        };

        let request: WorkerRequest = match serde_json::from_slice(&body) {
            Ok(request) => request,
            Err(e) => {
                warn!("Skipping undecodable request frame: {}", e);
                continue;
            }
        };

        debug!("Handling {} ({})", request.command, request.id);

        match handler.handle(&request).await {
            HandlerOutcome::Reply(response) => writer.send(&response).await?,
            HandlerOutcome::ReplyAndExit(response, code) => {
                writer.send(&response).await?;
                writer.close().await?;
                return Ok(ServeExit::Exit(code));
            }
            HandlerOutcome::Exit(code) => return Ok(ServeExit::Exit(code)),
        }
    }
}

/// Built-in handler with a handful of diagnostic commands.
///
/// | command     | args                         | behaviour                                 |
/// |-------------|------------------------------|-------------------------------------------|
/// | `ping`      |                              | `{"status": "ok", "worker_id": ..}`       |
/// | `echo`      | any                          | returns the args                          |
/// | `sleep`     | `ms`                         | sleeps, then returns `{"slept_ms": ..}`   |
/// | `fail`      | `error_type`, `message`      | error response                            |
/// | `crash`     | `code`                       | exits without replying                    |
/// | `put`/`get` | `key`, `value`               | per-session key/value state               |
/// | `get_stats` |                              | request counters                          |
/// | `shutdown`  |                              | replies, then exits 0                     |
pub struct ReferenceHandler {
    worker_id: String,
    requests_handled: u64,
    errors_returned: u64,
    sessions: HashMap<String, HashMap<String, JsonValue>>,
}

impl ReferenceHandler {
    pub fn new(worker_id: impl Into<String>) -> Self {
        Self {
            worker_id: worker_id.into(),
            requests_handled: 0,
            errors_returned: 0,
            sessions: HashMap::new(),
        }
    }

    pub fn worker_id(&self) -> &str {
        &self.worker_id
    }

    fn session_store(
        &mut self,
        request: &WorkerRequest,
    ) -> Result<&mut HashMap<String, JsonValue>, WorkerResponse> {
        match &request.session_id {
            Some(session_id) => Ok(self.sessions.entry(session_id.clone()).or_default()),
            None => Err(WorkerResponse::error(
                request.id,
                "SessionRequired",
                format!("command '{}' requires a session", request.command),
            )),
        }
    }

    fn dispatch(&mut self, request: &WorkerRequest) -> Result<JsonValue, WorkerResponse> {
        match request.command.as_str() {
            PING_COMMAND => Ok(json!({"status": "ok", "worker_id": self.worker_id})),
            "echo" => Ok(json!({"worker_id": self.worker_id, "args": request.args})),
            "fail" => Err(WorkerResponse::error(
                request.id,
                request.arg_str("error_type").unwrap_or("RuntimeError"),
                request.arg_str("message").unwrap_or("requested failure"),
            )),
            "put" => {
                let key = required_key(request)?;
                let value = request.args.get("value").cloned().unwrap_or(JsonValue::Null);
                let store = self.session_store(request)?;
                let previous = store.insert(key, value);
                Ok(json!({"previous": previous}))
            }
            "get" => {
                let key = required_key(request)?;
                let worker_id = self.worker_id.clone();
                let store = self.session_store(request)?;
                Ok(json!({"value": store.get(&key), "worker_id": worker_id}))
            }
            "get_stats" => Ok(json!({
                "worker_id": self.worker_id,
                "requests_handled": self.requests_handled,
                "errors_returned": self.errors_returned,
                "sessions": self.sessions.len(),
            })),
            other => Err(WorkerResponse::error(
                request.id,
                "UnknownCommand",
                format!("unknown command '{}'", other),
            )),
        }
    }
}

fn required_key(request: &WorkerRequest) -> Result<String, WorkerResponse> {
    request
        .arg_str("key")
        .map(str::to_string)
        .ok_or_else(|| WorkerResponse::error(request.id, "ValueError", "missing 'key' argument"))
}

#[async_trait]
impl RequestHandler for ReferenceHandler {
    async fn handle(&mut self, request: &WorkerRequest) -> HandlerOutcome {
        self.requests_handled += 1;

        match request.command.as_str() {
            SHUTDOWN_COMMAND => {
                return HandlerOutcome::ReplyAndExit(
                    WorkerResponse::success(request.id, json!({"status": "shutting_down"})),
                    0,
                );
            }
            "crash" => {
                let code = request.arg_u64("code").unwrap_or(1) as i32;
                return HandlerOutcome::Exit(code);
            }
            "sleep" => {
                let ms = request.arg_u64("ms").unwrap_or(0);
                tokio::time::sleep(Duration::from_millis(ms)).await;
                return HandlerOutcome::Reply(WorkerResponse::success(
                    request.id,
                    json!({"slept_ms": ms, "worker_id": self.worker_id}),
                ));
            }
            _ => {}
        }

        match self.dispatch(request) {
            Ok(result) => HandlerOutcome::Reply(WorkerResponse::success(request.id, result)),
            Err(response) => {
                self.errors_returned += 1;
                HandlerOutcome::Reply(response)
            }
        }
    }
}
