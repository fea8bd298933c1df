//! Periodic health probing of idle workers

use pitboss_core::{ErrorClassifier, ErrorContext, FailureSignal};
use pitboss_ipc::WorkerRequest;
use std::time::Duration;
use tokio::sync::{mpsc, oneshot};
use tokio::task::JoinHandle;
use tokio::time::{Instant, MissedTickBehavior};
use tracing::{debug, warn};

use crate::registry::WorkerRegistry;
use crate::scheduler::{Command, WorkerLease};

/// Pings every idle worker once per interval, holding at most one of them
/// at a time. A worker that does not answer within `probe_timeout` is
/// checked in unhealthy and replaced.
///
/// Busy workers are skipped; their calls already tell the pool whether they
/// are alive.
pub(crate) struct HealthMonitor {
    commands: mpsc::WeakUnboundedSender<Command>,
    registry: WorkerRegistry,
    interval: Duration,
    probe_timeout: Duration,
}

impl HealthMonitor {
    pub(crate) fn new(
        commands: mpsc::WeakUnboundedSender<Command>,
        registry: WorkerRegistry,
        interval: Duration,
        probe_timeout: Duration,
    ) -> Self {
        Self {
            commands,
            registry,
            interval,
            probe_timeout,
        }
    }

    pub(crate) fn spawn(self) -> JoinHandle<()> {
        tokio::spawn(self.run())
    }

    async fn run(self) {
        let mut ticker = tokio::time::interval_at(Instant::now() + self.interval, self.interval);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);

        loop {
            ticker.tick().await;
            if !self.sweep().await {
                break;
            }
        }
        debug!("Health monitor stopped");
    }

    /// Probe each idle worker once, one at a time so the rest stay
    /// available to callers. Returns false once the pool is gone.
    pub(crate) async fn sweep(&self) -> bool {
        let mut probed = 0;
        let mut failed = 0;

        for worker in self.registry.list() {
            let Some(commands) = self.commands.upgrade() else {
                return false;
            };
            let (reply, receiver) = oneshot::channel();
            let probe = Command::ProbeCheckout {
                worker_id: worker.id().to_string(),
                reply,
            };
            if commands.send(probe).is_err() {
                return false;
            }
            drop(commands);

            if let Ok(Some(lease)) = receiver.await {
                probed += 1;
                if !self.probe(lease).await {
                    failed += 1;
                }
            }
        }

        debug!(probed, failed, "Health sweep finished");
        true
    }

    async fn probe(&self, mut lease: WorkerLease) -> bool {
        let worker = lease.worker().clone();
        let outcome = tokio::time::timeout(self.probe_timeout, worker.request(WorkerRequest::ping())).await;

        let message = match outcome {
            Ok(Ok(_)) => return true,
            Ok(Err(signal)) => signal.to_string(),
            Err(_) => format!("no answer within {:?}", self.probe_timeout),
        };

        let signal = FailureSignal::HealthProbeFailed { message };
        let record = ErrorClassifier::record(
            signal.clone(),
            ErrorContext::new("health_check").with_worker(worker.id()),
        );
        warn!(
            worker_id = %worker.id(),
            category = %record.category,
            severity = %record.severity,
            "Health probe failed: {}",
            record.message()
        );
        lease.mark_unhealthy(signal);
        false
    }
}
