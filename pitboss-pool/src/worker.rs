//! A single long-lived worker process
//!
//! Requests are written as frames on the worker's stdin and matched to
//! responses by correlation id in a dedicated reader task. When the reader
//! sees EOF the worker is considered gone: every in-flight request is
//! resolved with a connection failure and a [`WorkerExit`] is sent to the
//! coordinator.

use chrono::{DateTime, Utc};
use parking_lot::Mutex;
use pitboss_core::FailureSignal;
use pitboss_ipc::{FrameReader, FrameWriter, IpcError, WorkerRequest, WorkerResponse};
use serde::Serialize;
use serde_json::Value as JsonValue;
use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{mpsc, oneshot, Notify};
use tokio::task::JoinHandle;
use tokio::time::Instant;
use tracing::{debug, info, warn};
use uuid::Uuid;

use crate::launcher::{BoxedReader, BoxedWriter, WorkerControl, WorkerLauncher};

/// Time the reader gives a disconnected worker to report its exit code
const EXIT_REAP_TIMEOUT: Duration = Duration::from_secs(1);
/// Time a worker gets to exit after its stdin is closed
const STDIN_CLOSE_WAIT: Duration = Duration::from_secs(2);
/// Time a worker gets to exit after SIGTERM
const TERMINATE_WAIT: Duration = Duration::from_secs(2);

/// Worker status as tracked by the coordinator
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum WorkerStatus {
    Starting,
    Idle,
    Busy,
    Unhealthy,
    Terminated,
}

/// Sent to the coordinator when a worker's output stream ends
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct WorkerExit {
    pub worker_id: String,
    pub code: Option<i32>,
}

/// Per-worker counters
#[derive(Debug, Clone, Serialize)]
pub struct WorkerStats {
    pub worker_id: String,
    pub pid: Option<u32>,
    pub started_at: DateTime<Utc>,
    pub alive: bool,
    pub requests: u64,
    pub failures: u64,
    pub in_flight: usize,
}

type ResponseSlot = oneshot::Sender<Result<WorkerResponse, FailureSignal>>;

struct WorkerShared {
    id: String,
    pending: Mutex<HashMap<Uuid, ResponseSlot>>,
    alive: AtomicBool,
    exit_code: Mutex<Option<i32>>,
    drained: Notify,
    requests: AtomicU64,
    failures: AtomicU64,
}

impl WorkerShared {
    fn resolve(&self, response: WorkerResponse) {
        let slot = self.pending.lock().remove(&response.id);
        match slot {
            Some(slot) => {
                if slot.send(Ok(response)).is_err() {
                    debug!(worker_id = %self.id, "Caller gave up before the response arrived");
                }
            }
            None => warn!(
                worker_id = %self.id,
                request_id = %response.id,
                "Dropping response with no waiting request"
            ),
        }
        self.notify_if_drained();
    }

    fn fail_all(&self, signal: &FailureSignal) {
        let slots: Vec<_> = self.pending.lock().drain().map(|(_, slot)| slot).collect();
        if !slots.is_empty() {
            warn!(
                worker_id = %self.id,
                in_flight = slots.len(),
                "Failing in-flight requests of exited worker"
            );
        }
        for slot in slots {
            let _ = slot.send(Err(signal.clone()));
        }
        self.drained.notify_waiters();
    }

    fn notify_if_drained(&self) {
        if self.pending.lock().is_empty() {
            self.drained.notify_waiters();
        }
    }

    fn exit_signal(&self) -> FailureSignal {
        match *self.exit_code.lock() {
            Some(code) => FailureSignal::ProcessExited { code: Some(code) },
            None => FailureSignal::ConnectionClosed,
        }
    }
}

/// Removes a pending entry when its caller stops waiting
struct PendingGuard<'a> {
    shared: &'a WorkerShared,
    id: Uuid,
}

impl Drop for PendingGuard<'_> {
    fn drop(&mut self) {
        self.shared.pending.lock().remove(&self.id);
        self.shared.notify_if_drained();
    }
}

/// Handle on one running worker process
pub struct WorkerProcess {
    id: String,
    pid: Option<u32>,
    started_at: DateTime<Utc>,
    shared: Arc<WorkerShared>,
    writer: tokio::sync::Mutex<FrameWriter<BoxedWriter>>,
    control: Arc<tokio::sync::Mutex<Box<dyn WorkerControl>>>,
    reader: Mutex<Option<JoinHandle<()>>>,
}

impl std::fmt::Debug for WorkerProcess {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("WorkerProcess")
            .field("id", &self.id)
            .field("pid", &self.pid)
            .field("alive", &self.is_alive())
            .finish()
    }
}

impl WorkerProcess {
    /// Launch a worker and wait for it to answer a `ping` within
    /// `handshake_timeout`. A worker that fails the handshake is killed.
    pub async fn start(
        worker_id: String,
        launcher: &dyn WorkerLauncher,
        handshake_timeout: Duration,
        exits: mpsc::UnboundedSender<WorkerExit>,
    ) -> Result<Arc<Self>, FailureSignal> {
        debug!(worker_id = %worker_id, "Starting worker process");
        let launched = launcher.launch(&worker_id).await?;

        let worker = Arc::new(Self::attach(
            worker_id,
            launched.pid,
            launched.reader,
            launched.writer,
            launched.control,
            exits,
        ));

        match tokio::time::timeout(handshake_timeout, worker.request(WorkerRequest::ping())).await {
            Ok(Ok(_)) => {
                info!(worker_id = %worker.id, pid = ?worker.pid, "Worker ready");
                Ok(worker)
            }
            Ok(Err(signal)) => {
                worker.kill().await;
                Err(FailureSignal::HandshakeFailed {
                    message: signal.to_string(),
                })
            }
            Err(_) => {
                worker.kill().await;
                Err(FailureSignal::HandshakeTimeout {
                    after_ms: handshake_timeout.as_millis() as u64,
                })
            }
        }
    }

    fn attach(
        id: String,
        pid: Option<u32>,
        reader: BoxedReader,
        writer: BoxedWriter,
        control: Box<dyn WorkerControl>,
        exits: mpsc::UnboundedSender<WorkerExit>,
    ) -> Self {
        let shared = Arc::new(WorkerShared {
            id: id.clone(),
            pending: Mutex::new(HashMap::new()),
            alive: AtomicBool::new(true),
            exit_code: Mutex::new(None),
            drained: Notify::new(),
            requests: AtomicU64::new(0),
            failures: AtomicU64::new(0),
        });
        let control = Arc::new(tokio::sync::Mutex::new(control));

        let reader_task = tokio::spawn(read_loop(
            shared.clone(),
            FrameReader::new(reader),
            control.clone(),
            exits,
        ));

        Self {
            id,
            pid,
            started_at: Utc::now(),
            shared,
            writer: tokio::sync::Mutex::new(FrameWriter::new(writer)),
            control,
            reader: Mutex::new(Some(reader_task)),
        }
    }

    pub fn id(&self) -> &str {
        &self.id
    }

    pub fn pid(&self) -> Option<u32> {
        self.pid
    }

    pub fn is_alive(&self) -> bool {
        self.shared.alive.load(Ordering::SeqCst)
    }

    pub fn in_flight(&self) -> usize {
        self.shared.pending.lock().len()
    }

    /// Failure a request to this worker reports once it is gone
    pub fn exit_signal(&self) -> FailureSignal {
        self.shared.exit_signal()
    }

    /// Send one request and wait for its response. There is no timeout
    /// here; callers bound the wait themselves.
    pub async fn request(&self, request: WorkerRequest) -> Result<JsonValue, FailureSignal> {
        let result = self.round_trip(request).await;
        if result.is_err() {
            self.shared.failures.fetch_add(1, Ordering::Relaxed);
        }
        result
    }

    async fn round_trip(&self, request: WorkerRequest) -> Result<JsonValue, FailureSignal> {
        if !self.is_alive() {
            return Err(self.exit_signal());
        }

        let id = request.id;
        let (sender, receiver) = oneshot::channel();
        self.shared.pending.lock().insert(id, sender);
        let _guard = PendingGuard {
            shared: &self.shared,
            id,
        };

        // The reader marks the worker dead before draining, so an entry added
        // after the drain is caught here
        if !self.is_alive() {
            return Err(self.exit_signal());
        }

        self.shared.requests.fetch_add(1, Ordering::Relaxed);

        {
            let mut writer = self.writer.lock().await;
            if let Err(e) = writer.send(&request).await {
                return Err(match e {
                    IpcError::SerializationError(message) => {
                        FailureSignal::ProtocolViolation { message }
                    }
                    e if e.is_disconnect() => self.exit_signal(),
                    e => FailureSignal::WriteFailed {
                        message: e.to_string(),
                    },
                });
            }
        }

        let response = match receiver.await {
            Ok(outcome) => outcome?,
            Err(_) => return Err(self.exit_signal()),
        };

        response
            .into_result()
            .map_err(|(error_type, message)| FailureSignal::WorkerReported {
                error_type,
                message,
            })
    }

    /// Stop the worker: wait for in-flight requests up to `grace`, close its
    /// stdin, then escalate to SIGTERM and finally kill.
    pub async fn shutdown(&self, grace: Duration) {
        let deadline = Instant::now() + grace;
        loop {
            let drained = self.shared.drained.notified();
            let in_flight = self.in_flight();
            if in_flight == 0 {
                break;
            }
            if tokio::time::timeout_at(deadline, drained).await.is_err() {
                warn!(
                    worker_id = %self.id,
                    in_flight,
                    "Shutdown grace elapsed with requests still in flight"
                );
                break;
            }
        }

        if let Err(e) = self.writer.lock().await.close().await {
            debug!(worker_id = %self.id, error = %e, "Closing worker stdin failed");
        }

        let mut control = self.control.lock().await;
        let status = match control.wait_exit(STDIN_CLOSE_WAIT).await {
            Some(status) => Some(status),
            None => {
                debug!(worker_id = %self.id, "Worker ignored stdin close, terminating");
                if control.terminate() {
                    control.wait_exit(TERMINATE_WAIT).await
                } else {
                    None
                }
            }
        };

        if status.is_none() {
            warn!(worker_id = %self.id, "Worker did not exit, killing");
            control.kill().await;
        }
        drop(control);

        self.shared.alive.store(false, Ordering::SeqCst);
        info!(worker_id = %self.id, code = ?status.and_then(|s| s.code), "Worker stopped");
    }

    /// Kill the worker immediately
    pub async fn kill(&self) {
        self.shared.alive.store(false, Ordering::SeqCst);
        self.control.lock().await.kill().await;
        if let Some(reader) = self.reader.lock().take() {
            reader.abort();
        }
        self.shared.fail_all(&FailureSignal::ConnectionClosed);
    }

    pub fn stats(&self) -> WorkerStats {
        WorkerStats {
            worker_id: self.id.clone(),
            pid: self.pid,
            started_at: self.started_at,
            alive: self.is_alive(),
            requests: self.shared.requests.load(Ordering::Relaxed),
            failures: self.shared.failures.load(Ordering::Relaxed),
            in_flight: self.in_flight(),
        }
    }
}

async fn read_loop(
    shared: Arc<WorkerShared>,
    mut reader: FrameReader<BoxedReader>,
    control: Arc<tokio::sync::Mutex<Box<dyn WorkerControl>>>,
    exits: mpsc::UnboundedSender<WorkerExit>,
) {
    let broken = loop {
        match reader.receive::<WorkerResponse>().await {
            Ok(response) => shared.resolve(response),
            Err(IpcError::DeserializationError(message)) => {
                warn!(worker_id = %shared.id, error = %message, "Skipping undecodable frame");
            }
            Err(e) if e.is_disconnect() => break false,
            Err(e) => {
                warn!(worker_id = %shared.id, error = %e, "Worker output stream is unusable");
                break true;
            }
        }
    };

    shared.alive.store(false, Ordering::SeqCst);

    let code = {
        let mut control = control.lock().await;
        if broken {
            control.kill().await;
        }
        control
            .wait_exit(EXIT_REAP_TIMEOUT)
            .await
            .and_then(|status| status.code)
    };
    *shared.exit_code.lock() = code;

    shared.fail_all(&FailureSignal::ProcessExited { code });
    info!(worker_id = %shared.id, ?code, "Worker output closed");

    let _ = exits.send(WorkerExit {
        worker_id: shared.id.clone(),
        code,
    });
}
