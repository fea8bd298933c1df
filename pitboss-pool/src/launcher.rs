//! Starting worker processes
//!
//! A [`WorkerLauncher`] produces the raw pipes of a new worker plus a
//! [`WorkerControl`] handle used to reap, signal and kill it. The pool never
//! touches `tokio::process` directly, which lets tests swap in an in-process
//! launcher.

use async_trait::async_trait;
use pitboss_config::WorkerCommand;
use pitboss_core::FailureSignal;
use std::process::Stdio;
use std::time::Duration;
use tokio::io::{AsyncRead, AsyncWrite};
use tokio::process::{Child, Command};
use tracing::debug;

pub type BoxedReader = Box<dyn AsyncRead + Send + Unpin>;
pub type BoxedWriter = Box<dyn AsyncWrite + Send + Unpin>;

/// How a worker process ended
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ExitStatus {
    /// Exit code; `None` when the process was killed by a signal
    pub code: Option<i32>,
}

/// Lifecycle handle on a launched worker
#[async_trait]
pub trait WorkerControl: Send {
    /// Wait up to `timeout` for the worker to exit. `None` means it is still
    /// running.
    async fn wait_exit(&mut self, timeout: Duration) -> Option<ExitStatus>;

    /// Ask the worker to terminate. Returns false when the request could not
    /// be delivered.
    fn terminate(&mut self) -> bool;

    /// Kill the worker and reap it
    async fn kill(&mut self);
}

/// A started but not yet handshaken worker
pub struct LaunchedWorker {
    /// The worker's stdout
    pub reader: BoxedReader,
    /// The worker's stdin
    pub writer: BoxedWriter,
    pub control: Box<dyn WorkerControl>,
    pub pid: Option<u32>,
}

/// Starts worker processes
#[async_trait]
pub trait WorkerLauncher: Send + Sync + 'static {
    async fn launch(&self, worker_id: &str) -> Result<LaunchedWorker, FailureSignal>;
}

/// Launches the configured external program with piped stdin/stdout
#[derive(Debug, Clone)]
pub struct CommandLauncher {
    command: WorkerCommand,
}

impl CommandLauncher {
    pub fn new(command: WorkerCommand) -> Self {
        Self { command }
    }

    pub fn command(&self) -> &WorkerCommand {
        &self.command
    }

    fn build(&self, worker_id: &str) -> Command {
        let mut cmd = Command::new(&self.command.program);
        cmd.args(&self.command.args)
            .envs(&self.command.env)
            .stdin(Stdio::piped())
            .stdout(Stdio::piped())
            .stderr(Stdio::inherit())
            .kill_on_drop(true);

        if let Some(dir) = &self.command.working_dir {
            cmd.current_dir(dir);
        }

        if self.command.pass_worker_id {
            cmd.arg("--worker-id").arg(worker_id);
        }

        cmd
    }
}

#[async_trait]
impl WorkerLauncher for CommandLauncher {
    async fn launch(&self, worker_id: &str) -> Result<LaunchedWorker, FailureSignal> {
        let mut child = self.build(worker_id).spawn().map_err(|e| FailureSignal::SpawnFailed {
            message: format!("{}: {}", self.command.program, e),
        })?;

        let stdin = child.stdin.take().ok_or_else(|| FailureSignal::SpawnFailed {
            message: "worker stdin was not captured".to_string(),
        })?;
        let stdout = child.stdout.take().ok_or_else(|| FailureSignal::SpawnFailed {
            message: "worker stdout was not captured".to_string(),
        })?;

        let pid = child.id();
        debug!(worker_id, ?pid, program = %self.command.program, "Spawned worker process");

        Ok(LaunchedWorker {
            reader: Box::new(stdout),
            writer: Box::new(stdin),
            control: Box::new(ChildControl { child }),
            pid,
        })
    }
}

/// [`WorkerControl`] over an OS child process
pub struct ChildControl {
    child: Child,
}

#[async_trait]
impl WorkerControl for ChildControl {
    async fn wait_exit(&mut self, timeout: Duration) -> Option<ExitStatus> {
        match tokio::time::timeout(timeout, self.child.wait()).await {
            Ok(Ok(status)) => Some(ExitStatus {
                code: status.code(),
            }),
            // The child can no longer be waited on; treat it as gone
            Ok(Err(_)) => Some(ExitStatus { code: None }),
            Err(_) => None,
        }
    }

    #[cfg(unix)]
    fn terminate(&mut self) -> bool {
        use nix::sys::signal::{kill, Signal};
        use nix::unistd::Pid;

        match self.child.id() {
            Some(pid) => kill(Pid::from_raw(pid as i32), Signal::SIGTERM).is_ok(),
            None => false,
        }
    }

    #[cfg(not(unix))]
    fn terminate(&mut self) -> bool {
        self.child.start_kill().is_ok()
    }

    async fn kill(&mut self) {
        let _ = self.child.kill().await;
    }
}
