//! Concurrent worker startup

use futures::future::join_all;
use pitboss_core::{ErrorClassifier, ErrorContext, ErrorRecord, FailureSignal};
use pitboss_resilience::CircuitBreakerBank;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::mpsc;
use tokio::time::Instant;
use tracing::{info, warn};

use crate::launcher::WorkerLauncher;
use crate::worker::{WorkerExit, WorkerProcess};

/// A worker slot that failed to start
#[derive(Debug, Clone)]
pub struct InitFailure {
    pub slot: usize,
    pub worker_id: String,
    pub error: ErrorRecord,
}

/// Result of starting a batch of workers
#[derive(Debug)]
pub struct InitReport {
    pub requested: usize,
    pub started: Vec<(usize, Arc<WorkerProcess>)>,
    pub failures: Vec<InitFailure>,
    pub elapsed: Duration,
}

impl InitReport {
    pub fn is_complete(&self) -> bool {
        self.started.len() == self.requested
    }
}

/// Starts workers in parallel, each bounded by `init_timeout`
#[derive(Clone)]
pub struct ConcurrentPoolInitializer {
    launcher: Arc<dyn WorkerLauncher>,
    breakers: Arc<CircuitBreakerBank>,
    init_timeout: Duration,
    handshake_timeout: Duration,
}

impl ConcurrentPoolInitializer {
    pub fn new(
        launcher: Arc<dyn WorkerLauncher>,
        breakers: Arc<CircuitBreakerBank>,
        init_timeout: Duration,
        handshake_timeout: Duration,
    ) -> Self {
        Self {
            launcher,
            breakers,
            init_timeout,
            handshake_timeout,
        }
    }

    /// Start every `(slot, worker_id)` concurrently. Total time is close to
    /// the slowest single start.
    pub async fn start_all(
        &self,
        slots: Vec<(usize, String)>,
        exits: mpsc::UnboundedSender<WorkerExit>,
    ) -> InitReport {
        let requested = slots.len();
        let began = Instant::now();
        info!("Starting {} workers concurrently", requested);

        let handles: Vec<_> = slots
            .into_iter()
            .map(|(slot, worker_id)| {
                let initializer = self.clone();
                let exits = exits.clone();
                tokio::spawn(async move {
                    let outcome = initializer.start_one(worker_id.clone(), exits).await;
                    (slot, worker_id, outcome)
                })
            })
            .collect();

        let mut started = Vec::with_capacity(requested);
        let mut failures = Vec::new();
        for joined in join_all(handles).await {
            match joined {
                Ok((slot, _, Ok(worker))) => started.push((slot, worker)),
                Ok((slot, worker_id, Err(error))) => failures.push(InitFailure {
                    slot,
                    worker_id,
                    error,
                }),
                Err(e) => warn!("Worker start task failed: {}", e),
            }
        }
        started.sort_by_key(|(slot, _)| *slot);

        let elapsed = began.elapsed();
        if started.len() < requested {
            warn!(
                started = started.len(),
                requested,
                "Pool started with fewer workers than requested"
            );
            for failure in &failures {
                warn!(
                    worker_id = %failure.worker_id,
                    category = %failure.error.category,
                    "Worker failed to start: {}",
                    failure.error.message()
                );
            }
        } else {
            info!(?elapsed, "All {} workers started", requested);
        }

        InitReport {
            requested,
            started,
            failures,
            elapsed,
        }
    }

    /// Start one worker, reporting the outcome to the
    /// `worker_initialization` breaker
    pub async fn start_one(
        &self,
        worker_id: String,
        exits: mpsc::UnboundedSender<WorkerExit>,
    ) -> Result<Arc<WorkerProcess>, ErrorRecord> {
        let context = ErrorContext::new("start_worker").with_worker(worker_id.clone());

        let permit = match self.breakers.worker_initialization() {
            Some(breaker) => match breaker.try_acquire() {
                Ok(permit) => Some(permit),
                Err(rejection) => {
                    let signal = FailureSignal::CircuitOpen {
                        breaker: rejection.breaker.clone(),
                        retry_after_ms: rejection.retry_after.as_millis() as u64,
                    };
                    return Err(ErrorClassifier::record(signal, context)
                        .with_retry_after(Some(rejection.retry_after)));
                }
            },
            None => None,
        };

        let start = WorkerProcess::start(
            worker_id,
            self.launcher.as_ref(),
            self.handshake_timeout,
            exits,
        );
        let outcome = match tokio::time::timeout(self.init_timeout, start).await {
            Ok(result) => result,
            Err(_) => Err(FailureSignal::HandshakeTimeout {
                after_ms: self.init_timeout.as_millis() as u64,
            }),
        };

        match outcome {
            Ok(worker) => {
                if let Some(permit) = permit {
                    permit.success();
                }
                Ok(worker)
            }
            Err(signal) => {
                if let Some(permit) = permit {
                    permit.failure();
                }
                Err(ErrorClassifier::record(signal, context))
            }
        }
    }
}
