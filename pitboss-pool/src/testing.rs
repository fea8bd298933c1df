//! In-process workers for tests
//!
//! [`InProcessLauncher`] runs [`ReferenceHandler`] on a tokio task connected
//! through an in-memory duplex pipe, so pool behaviour can be exercised with
//! a paused clock and without spawning processes. Killing a worker aborts
//! its task, which the pool observes exactly like a process exit.

use async_trait::async_trait;
use parking_lot::Mutex;
use pitboss_core::FailureSignal;
use pitboss_ipc::{serve, HandlerOutcome, IpcError, ReferenceHandler, RequestHandler, ServeExit, WorkerRequest};
use std::collections::{HashMap, HashSet};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::task::{AbortHandle, JoinHandle};

use crate::launcher::{ExitStatus, LaunchedWorker, WorkerControl, WorkerLauncher};

const PIPE_CAPACITY: usize = 64 * 1024;

/// Launches reference workers as tokio tasks
#[derive(Clone, Default)]
pub struct InProcessLauncher {
    startup_delay: Duration,
    handshake_delay: Duration,
    failing: Arc<Mutex<HashSet<String>>>,
    frozen: Arc<Mutex<HashSet<String>>>,
    running: Arc<Mutex<HashMap<String, AbortHandle>>>,
    launched: Arc<AtomicUsize>,
}

impl InProcessLauncher {
    pub fn new() -> Self {
        Self::default()
    }

    /// Delay every launch, as a slow process start would
    pub fn with_startup_delay(mut self, delay: Duration) -> Self {
        self.startup_delay = delay;
        self
    }

    /// Delay each worker's first response
    pub fn with_handshake_delay(mut self, delay: Duration) -> Self {
        self.handshake_delay = delay;
        self
    }

    /// Make launches of `worker_id` fail
    pub fn fail_worker(&self, worker_id: impl Into<String>) {
        self.failing.lock().insert(worker_id.into());
    }

    /// Stop `worker_id` from answering; requests it receives afterwards hang
    pub fn freeze(&self, worker_id: impl Into<String>) {
        self.frozen.lock().insert(worker_id.into());
    }

    /// Abort a running worker. Returns false when no such worker is running.
    pub fn kill(&self, worker_id: &str) -> bool {
        match self.running.lock().remove(worker_id) {
            Some(handle) => {
                handle.abort();
                true
            }
            None => false,
        }
    }

    /// Number of successful launches so far
    pub fn launched(&self) -> usize {
        self.launched.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl WorkerLauncher for InProcessLauncher {
    async fn launch(&self, worker_id: &str) -> Result<LaunchedWorker, FailureSignal> {
        if !self.startup_delay.is_zero() {
            tokio::time::sleep(self.startup_delay).await;
        }

        if self.failing.lock().contains(worker_id) {
            return Err(FailureSignal::SpawnFailed {
                message: format!("{}: launch refused", worker_id),
            });
        }

        let (pool_side, worker_side) = tokio::io::duplex(PIPE_CAPACITY);
        let (pool_read, pool_write) = tokio::io::split(pool_side);
        let (worker_read, worker_write) = tokio::io::split(worker_side);

        let mut handler = SlowStart {
            inner: ReferenceHandler::new(worker_id),
            delay: Some(self.handshake_delay).filter(|d| !d.is_zero()),
            worker_id: worker_id.to_string(),
            frozen: self.frozen.clone(),
        };
        let task = tokio::spawn(async move { serve(worker_read, worker_write, &mut handler).await });

        self.running
            .lock()
            .insert(worker_id.to_string(), task.abort_handle());
        self.launched.fetch_add(1, Ordering::SeqCst);

        Ok(LaunchedWorker {
            reader: Box::new(pool_read),
            writer: Box::new(pool_write),
            control: Box::new(TaskControl {
                task: Some(task),
                exited: None,
            }),
            pid: None,
        })
    }
}

/// Holds back the first response by a fixed delay, and stops answering once
/// its worker is frozen
struct SlowStart {
    inner: ReferenceHandler,
    delay: Option<Duration>,
    worker_id: String,
    frozen: Arc<Mutex<HashSet<String>>>,
}

#[async_trait]
impl RequestHandler for SlowStart {
    async fn handle(&mut self, request: &WorkerRequest) -> HandlerOutcome {
        if let Some(delay) = self.delay.take() {
            tokio::time::sleep(delay).await;
        }
        let frozen = self.frozen.lock().contains(&self.worker_id);
        if frozen {
            std::future::pending::<()>().await;
        }
        self.inner.handle(request).await
    }
}

/// [`WorkerControl`] over an in-process serve task
struct TaskControl {
    task: Option<JoinHandle<Result<ServeExit, IpcError>>>,
    exited: Option<ExitStatus>,
}

#[async_trait]
impl WorkerControl for TaskControl {
    async fn wait_exit(&mut self, timeout: Duration) -> Option<ExitStatus> {
        if self.exited.is_some() {
            return self.exited;
        }
        let task = self.task.as_mut()?;

        let code = match tokio::time::timeout(timeout, task).await {
            Err(_) => return None,
            Ok(Ok(Ok(ServeExit::InputClosed))) => Some(0),
            Ok(Ok(Ok(ServeExit::Exit(code)))) => Some(code),
            Ok(Ok(Err(_))) => Some(1),
            // Aborted, the in-process equivalent of a signal
            Ok(Err(_)) => None,
        };

        self.task = None;
        self.exited = Some(ExitStatus { code });
        self.exited
    }

    fn terminate(&mut self) -> bool {
        match &self.task {
            Some(task) => {
                task.abort();
                true
            }
            None => false,
        }
    }

    async fn kill(&mut self) {
        if let Some(task) = &self.task {
            task.abort();
        }
        self.wait_exit(Duration::from_secs(1)).await;
    }
}

impl Drop for TaskControl {
    fn drop(&mut self) {
        if let Some(task) = &self.task {
            task.abort();
        }
    }
}
