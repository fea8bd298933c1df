//! The public pool handle
//!
//! [`Pool`] ties the pieces together. A call is admitted by the circuit
//! breakers, waits for a worker from the coordinator, runs on a lease and is
//! handed to the recovery orchestrator if it fails.

use futures::future::join_all;
use futures::FutureExt;
use parking_lot::Mutex;
use pitboss_config::{CircuitBreakerSettings, PitbossConfig, RecoveryConfig};
use pitboss_core::{
    ClassifiedError, ErrorClassifier, ErrorContext, ErrorRecord, FailureSignal, RecoveryStrategy,
};
use pitboss_ipc::WorkerRequest;
use pitboss_logging::log_classified;
use pitboss_resilience::{
    AttemptFn, BreakerSnapshot, CircuitBreakerBank, CircuitBreakerConfig, RecoveryDisposition,
    RecoveryMetrics, RecoveryOperation, RecoveryOrchestrator, RecoveryStatus, RecoveryTuning,
    RetryPolicy, StrategySelector, POOL_CONNECTIONS, POOL_RESOURCES, WORKER_INITIALIZATION,
};
use serde::Serialize;
use serde_json::Value as JsonValue;
use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{mpsc, oneshot};
use tokio::task::AbortHandle;
use tokio::time::Instant;
use tracing::{debug, info, Instrument};

use crate::error::{CallResult, PoolError, PoolResult};
use crate::health::HealthMonitor;
use crate::initializer::ConcurrentPoolInitializer;
use crate::launcher::{CommandLauncher, WorkerLauncher};
use crate::registry::WorkerRegistry;
use crate::scheduler::{
    worker_id_for, CheckoutRequest, Command, Coordinator, SchedulerSnapshot, Target, WorkerLease,
};
use crate::telemetry;
use crate::worker::WorkerStats;

/// Per-call options
#[derive(Debug, Clone)]
pub struct ExecuteOptions {
    /// Deadline for one attempt, queueing included. Defaults to the pool's
    /// `request_timeout`.
    pub timeout: Option<Duration>,
    /// Attempt number reported in error context
    pub attempt: u32,
    pub user_facing: bool,
}

impl Default for ExecuteOptions {
    fn default() -> Self {
        Self {
            timeout: None,
            attempt: 1,
            user_facing: false,
        }
    }
}

impl ExecuteOptions {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = Some(timeout);
        self
    }

    pub fn with_attempt(mut self, attempt: u32) -> Self {
        self.attempt = attempt.max(1);
        self
    }

    pub fn user_facing(mut self, flag: bool) -> Self {
        self.user_facing = flag;
        self
    }
}

/// Point-in-time pool counters
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct PoolStats {
    pub workers: usize,
    pub available: usize,
    pub busy: usize,
    pub requests: u64,
    pub errors: u64,
    pub queued: usize,
    pub queue_timeouts: u64,
    pub sessions: usize,
    pub max_queued: usize,
    pub restarts: u64,
}

#[derive(Default)]
struct PoolCounters {
    requests: AtomicU64,
    errors: AtomicU64,
    queue_timeouts: AtomicU64,
}

/// One logical call, shared by its first attempt and any recovery
struct Call {
    target: Target,
    command: String,
    args: JsonValue,
    options: ExecuteOptions,
    timeout: Duration,
}

impl Call {
    fn operation(&self) -> &'static str {
        match self.target {
            Target::Any => "execute",
            Target::Session(_) => "execute_in_session",
        }
    }

    fn context(&self, attempt: u32) -> ErrorContext {
        let context = ErrorContext::new(self.operation())
            .with_attempt(attempt)
            .user_facing(self.options.user_facing)
            .with_metadata("command", &self.command);
        match self.target.session_id() {
            Some(session_id) => context.with_session(session_id),
            None => context,
        }
    }
}

struct PoolShared {
    config: PitbossConfig,
    commands: mpsc::UnboundedSender<Command>,
    registry: WorkerRegistry,
    breakers: Arc<CircuitBreakerBank>,
    recovery: RecoveryOrchestrator,
    counters: PoolCounters,
    background: Mutex<Vec<AbortHandle>>,
    shut_down: AtomicBool,
}

impl Drop for PoolShared {
    fn drop(&mut self) {
        for handle in self.background.lock().drain(..) {
            handle.abort();
        }
    }
}

/// Bounded pool of worker processes. Cheap to clone; all clones share the
/// same workers.
#[derive(Clone)]
pub struct Pool {
    shared: Arc<PoolShared>,
}

impl std::fmt::Debug for Pool {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Pool")
            .field("size", &self.shared.config.pool.size)
            .field("workers", &self.shared.registry.len())
            .finish()
    }
}

impl Pool {
    /// Start a pool of the configured worker program
    pub async fn start(config: PitbossConfig) -> PoolResult<Self> {
        let launcher = CommandLauncher::new(config.pool.worker.clone());
        Self::start_with_launcher(config, Arc::new(launcher)).await
    }

    /// Start a pool whose workers come from `launcher`.
    ///
    /// Workers start concurrently. The pool comes up as long as at least one
    /// of them does; failed slots are retried through the restart path.
    pub async fn start_with_launcher(
        config: PitbossConfig,
        launcher: Arc<dyn WorkerLauncher>,
    ) -> PoolResult<Self> {
        config.validate_all()?;

        let breakers = Arc::new(build_breakers(&config.circuit_breakers));
        let recovery = build_orchestrator(&config.recovery);
        let initializer = ConcurrentPoolInitializer::new(
            launcher,
            breakers.clone(),
            config.pool.init_timeout,
            config.pool.handshake_timeout,
        );

        let (exits_tx, exits_rx) = mpsc::unbounded_channel();
        let slots = (0..config.pool.size).map(|slot| (slot, worker_id_for(slot))).collect();
        let report = initializer.start_all(slots, exits_tx.clone()).await;

        if report.started.is_empty() {
            let errors: Vec<ErrorRecord> = report.failures.into_iter().map(|f| f.error).collect();
            return Err(PoolError::no_workers(config.pool.size, &errors));
        }

        let registry = WorkerRegistry::new();
        let (commands_tx, commands_rx) = mpsc::unbounded_channel();
        let mut coordinator = Coordinator::new(
            config.pool.clone(),
            &config.session,
            registry.clone(),
            initializer,
            commands_tx.downgrade(),
            exits_tx,
        );
        let started = report.started.len();
        for (slot, worker) in report.started {
            coordinator.adopt(slot, worker);
        }
        for failure in &report.failures {
            coordinator.schedule_restart(failure.slot);
        }
        tokio::spawn(coordinator.run(commands_rx, exits_rx));

        let mut background = Vec::new();
        if let Some(interval) = config.pool.health_check_interval {
            let monitor = HealthMonitor::new(
                commands_tx.downgrade(),
                registry.clone(),
                interval,
                config.pool.health_probe_timeout,
            );
            background.push(monitor.spawn().abort_handle());
        }

        info!(
            workers = started,
            size = config.pool.size,
            elapsed = ?report.elapsed,
            "Worker pool started"
        );

        Ok(Self {
            shared: Arc::new(PoolShared {
                config,
                commands: commands_tx,
                registry,
                breakers,
                recovery,
                counters: PoolCounters::default(),
                background: Mutex::new(background),
                shut_down: AtomicBool::new(false),
            }),
        })
    }

    /// Run `command` on any available worker
    pub async fn execute(
        &self,
        command: impl Into<String>,
        args: JsonValue,
        options: ExecuteOptions,
    ) -> CallResult {
        self.dispatch(Target::Any, command.into(), args, options).await
    }

    /// Run `command` on the worker bound to `session_id`, binding one first
    /// if the session is new
    pub async fn execute_in_session(
        &self,
        session_id: impl Into<String>,
        command: impl Into<String>,
        args: JsonValue,
        options: ExecuteOptions,
    ) -> CallResult {
        self.dispatch(Target::Session(session_id.into()), command.into(), args, options)
            .await
    }

    async fn dispatch(
        &self,
        target: Target,
        command: String,
        args: JsonValue,
        options: ExecuteOptions,
    ) -> CallResult {
        let call = Call {
            timeout: options.timeout.unwrap_or(self.shared.config.pool.request_timeout),
            target,
            command,
            args,
            options,
        };
        let span = telemetry::dispatch_span(&call.command, call.target.session_id());
        let shared = self.shared.clone();

        async move {
            let started = Instant::now();
            shared.counters.requests.fetch_add(1, Ordering::Relaxed);

            let first = call.options.attempt;
            let result = match shared.attempt(&call, first, None).await {
                Ok(value) => Ok(value),
                Err(record) => shared.recover(call, record).await,
            };

            if let Err(error) = &result {
                shared.counters.errors.fetch_add(1, Ordering::Relaxed);
                log_classified(error);
            }
            telemetry::record_outcome(&tracing::Span::current(), &result, started.elapsed());
            result
        }
        .instrument(span)
        .await
    }

    pub async fn get_stats(&self) -> PoolStats {
        let (reply, receiver) = oneshot::channel();
        let snapshot = match self.shared.commands.send(Command::Stats { reply }) {
            Ok(()) => receiver.await.unwrap_or_default(),
            Err(_) => SchedulerSnapshot::default(),
        };
        let counters = &self.shared.counters;

        PoolStats {
            workers: snapshot.workers,
            available: snapshot.available,
            busy: snapshot.busy,
            requests: counters.requests.load(Ordering::Relaxed),
            errors: counters.errors.load(Ordering::Relaxed),
            queued: snapshot.queued,
            queue_timeouts: counters.queue_timeouts.load(Ordering::Relaxed),
            sessions: snapshot.sessions,
            max_queued: snapshot.max_queued,
            restarts: snapshot.restarts,
        }
    }

    pub fn get_recovery_status(&self, recovery_id: u64) -> Option<RecoveryStatus> {
        self.shared.recovery.get_recovery_status(recovery_id)
    }

    /// Running recoveries first, then recently finished ones
    pub fn list_recoveries(&self) -> Vec<RecoveryStatus> {
        self.shared.recovery.list_recoveries()
    }

    /// Stop a running recovery. Its caller receives `recovery_cancelled`.
    pub fn cancel_recovery(&self, recovery_id: u64) -> bool {
        self.shared.recovery.cancel_recovery(recovery_id)
    }

    pub fn get_metrics(&self) -> RecoveryMetrics {
        self.shared.recovery.get_metrics()
    }

    pub fn breaker_states(&self) -> Vec<BreakerSnapshot> {
        self.shared.breakers.snapshots()
    }

    pub fn worker_ids(&self) -> Vec<String> {
        self.shared
            .registry
            .list()
            .iter()
            .map(|worker| worker.id().to_string())
            .collect()
    }

    pub fn worker_stats(&self) -> Vec<WorkerStats> {
        self.shared
            .registry
            .list()
            .iter()
            .map(|worker| worker.stats())
            .collect()
    }

    pub fn config(&self) -> &PitbossConfig {
        &self.shared.config
    }

    /// Stop accepting calls, cancel recoveries and stop every worker.
    ///
    /// Calls already running get `shutdown_grace` to finish. Calling this
    /// more than once is harmless.
    pub async fn shutdown(&self) -> PoolResult<()> {
        if self.shared.shut_down.swap(true, Ordering::SeqCst) {
            return Ok(());
        }

        for handle in self.shared.background.lock().drain(..) {
            handle.abort();
        }

        let (reply, receiver) = oneshot::channel();
        self.shared
            .commands
            .send(Command::Shutdown { reply })
            .map_err(|_| PoolError::CoordinatorGone)?;
        let workers = receiver.await.map_err(|_| PoolError::CoordinatorGone)?;

        let cancelled = self.shared.recovery.cancel_all();
        info!(
            workers = workers.len(),
            cancelled_recoveries = cancelled,
            "Shutting down worker pool"
        );

        let grace = self.shared.config.pool.shutdown_grace;
        join_all(workers.iter().map(|worker| worker.shutdown(grace))).await;

        info!("Worker pool stopped");
        Ok(())
    }
}

impl PoolShared {
    /// One pass through admission, checkout and the worker round trip
    async fn attempt(
        &self,
        call: &Call,
        attempt: u32,
        avoid: Option<String>,
    ) -> Result<JsonValue, ErrorRecord> {
        let context = call.context(attempt);

        let permits = self.breakers.admit_dispatch().map_err(|rejection| {
            debug!(breaker = %rejection.breaker, "Dispatch refused by open breaker");
            let signal = FailureSignal::CircuitOpen {
                breaker: rejection.breaker.clone(),
                retry_after_ms: rejection.retry_after.as_millis() as u64,
            };
            ErrorClassifier::record(signal, context.clone())
                .with_retry_after(Some(rejection.retry_after))
        })?;

        let deadline = Instant::now() + call.timeout;
        // Queue rejections drop the permits without touching the breakers
        let lease = match self.checkout(&call.target, avoid, deadline).await {
            Ok(lease) => lease,
            Err(signal) => return Err(ErrorClassifier::record(signal, context)),
        };

        let context = context.with_worker(lease.worker_id());
        let request = WorkerRequest::new(call.command.clone(), call.args.clone())
            .with_session(call.target.session_id().map(str::to_string));
        let hard_deadline = deadline + self.config.pool.abandoned_call_grace;

        // The lease travels with the request so an abandoned call keeps its
        // worker busy until the worker answers or is recycled
        let task = tokio::spawn(run_leased(lease, request, hard_deadline).in_current_span());
        let outcome = match tokio::time::timeout_at(deadline, task).await {
            Ok(Ok(result)) => result,
            Ok(Err(join_error)) => Err(FailureSignal::Unclassified {
                message: join_error.to_string(),
            }),
            Err(_) => Err(FailureSignal::ResponseTimeout {
                after_ms: call.timeout.as_millis() as u64,
            }),
        };

        match outcome {
            Ok(value) => {
                permits.success();
                Ok(value)
            }
            Err(signal) => {
                let record = ErrorClassifier::record(signal, context);
                permits.failure(record.category);
                Err(record)
            }
        }
    }

    async fn checkout(
        &self,
        target: &Target,
        avoid: Option<String>,
        deadline: Instant,
    ) -> Result<WorkerLease, FailureSignal> {
        let (reply, receiver) = oneshot::channel();
        let enqueued_at = Instant::now();
        self.commands
            .send(Command::Checkout(CheckoutRequest {
                target: target.clone(),
                avoid,
                reply,
            }))
            .map_err(|_| FailureSignal::ShuttingDown)?;

        match tokio::time::timeout_at(deadline, receiver).await {
            Ok(Ok(result)) => result,
            Ok(Err(_)) => Err(FailureSignal::ShuttingDown),
            Err(_) => {
                self.counters.queue_timeouts.fetch_add(1, Ordering::Relaxed);
                Err(FailureSignal::QueueTimeout {
                    waited_ms: enqueued_at.elapsed().as_millis() as u64,
                })
            }
        }
    }

    async fn recover(self: &Arc<Self>, call: Call, record: ErrorRecord) -> CallResult {
        if record.signal.is_synchronous() {
            let strategy = StrategySelector::synchronous_strategy(record.reason());
            return Err(ClassifiedError::from_record(&record, strategy));
        }

        let call = Arc::new(call);
        let retry: AttemptFn<JsonValue> = {
            let shared = self.clone();
            let call = call.clone();
            Arc::new(move |attempt| {
                let shared = shared.clone();
                let call = call.clone();
                async move { shared.attempt(&call, attempt, None).await }.boxed()
            })
        };
        let mut operation = RecoveryOperation::new(retry);

        // Session calls cannot move to another worker
        if call.target == Target::Any {
            let shared = self.clone();
            let call = call.clone();
            let failed_worker = record.context.worker_id.clone();
            let failover: AttemptFn<JsonValue> = Arc::new(move |attempt| {
                let shared = shared.clone();
                let call = call.clone();
                let avoid = failed_worker.clone();
                async move { shared.attempt(&call, attempt, avoid).await }.boxed()
            });
            operation = operation.with_failover(failover);
        }

        match self.recovery.initiate(record, operation) {
            RecoveryDisposition::Surfaced(mut error) => {
                if error.recovery_strategy == RecoveryStrategy::CircuitBreak
                    && error.retry_after.is_none()
                {
                    error.retry_after = self
                        .breakers
                        .breaker_for(error.category)
                        .and_then(|breaker| breaker.remaining_cooldown());
                }
                Err(error)
            }
            RecoveryDisposition::Pending(pending) => {
                debug!(recovery_id = pending.id, "Waiting on recovery");
                pending.wait().await
            }
        }
    }
}

async fn run_leased(
    mut lease: WorkerLease,
    request: WorkerRequest,
    hard_deadline: Instant,
) -> Result<JsonValue, FailureSignal> {
    let started = Instant::now();
    let outcome = tokio::time::timeout_at(hard_deadline, lease.worker().request(request)).await;
    match outcome {
        Ok(Ok(value)) => Ok(value),
        Ok(Err(signal)) => {
            if matches!(
                signal,
                FailureSignal::ProcessExited { .. }
                    | FailureSignal::ConnectionClosed
                    | FailureSignal::WriteFailed { .. }
            ) {
                lease.mark_unhealthy(signal.clone());
            }
            Err(signal)
        }
        Err(_) => {
            tracing::warn!(
                worker_id = %lease.worker_id(),
                "Worker still silent after abandoned-call grace, recycling"
            );
            let signal = FailureSignal::ResponseTimeout {
                after_ms: started.elapsed().as_millis() as u64,
            };
            lease.mark_unhealthy(signal.clone());
            Err(signal)
        }
    }
}

fn build_breakers(settings: &CircuitBreakerSettings) -> CircuitBreakerBank {
    let default = CircuitBreakerConfig {
        failure_threshold: settings.failure_threshold,
        cooldown: settings.cooldown,
    };
    let resolved: HashMap<String, CircuitBreakerConfig> =
        [POOL_CONNECTIONS, POOL_RESOURCES, WORKER_INITIALIZATION]
            .into_iter()
            .map(|name| {
                let (failure_threshold, cooldown) = settings.resolve(name);
                (
                    name.to_string(),
                    CircuitBreakerConfig {
                        failure_threshold,
                        cooldown,
                    },
                )
            })
            .collect();
    CircuitBreakerBank::new(default, &resolved)
}

fn build_orchestrator(config: &RecoveryConfig) -> RecoveryOrchestrator {
    let tuning = RecoveryTuning {
        max_concurrent_recoveries: config.max_concurrent_recoveries,
        history_limit: config.history_limit,
        immediate_retry: RetryPolicy::new(
            config.immediate_retry.max_attempts,
            &config.immediate_retry.delays,
            config.jitter,
        ),
        backoff_retry: RetryPolicy::new(
            config.backoff_retry.max_attempts,
            &config.backoff_retry.delays,
            config.jitter,
        ),
    };
    RecoveryOrchestrator::new(StrategySelector::new(config.strategy_overrides.clone()), tuning)
}
