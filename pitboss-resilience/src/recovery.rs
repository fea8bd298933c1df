//! Background recovery of failed calls
//!
//! [`RecoveryOrchestrator::initiate`] takes a classified failure and the
//! closures needed to redo the work. Terminal strategies surface immediately;
//! retries and failover run in a detached task that answers the original
//! caller exactly once through a oneshot reply slot. A recovery can be
//! cancelled at any time, in which case the caller receives
//! `recovery_cancelled` instead.

use chrono::{DateTime, Utc};
use futures::future::BoxFuture;
use log::{debug, info, warn};
use parking_lot::Mutex;
use pitboss_core::{
    ClassifiedError, ErrorClassifier, ErrorReason, ErrorRecord, FailureSignal, RecoveryStrategy,
};
use serde::Serialize;
use std::collections::{HashMap, VecDeque};
use std::sync::atomic::{AtomicU32, AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::oneshot;
use tokio::task::AbortHandle;
use tokio::time::Instant;

use crate::retry::{RetryError, RetryExecutor, RetryPolicy};
use crate::strategy::StrategySelector;

/// Future produced by one recovery attempt
pub type AttemptFuture<T> = BoxFuture<'static, Result<T, ErrorRecord>>;

/// Re-runnable unit of work. The argument is the attempt number to report in
/// the error context of a new failure.
pub type AttemptFn<T> = Arc<dyn Fn(u32) -> AttemptFuture<T> + Send + Sync>;

/// What a recovery may re-run
pub struct RecoveryOperation<T> {
    /// Re-invokes the original call
    pub retry: AttemptFn<T>,
    /// Alternate implementation used by failover
    pub failover: Option<AttemptFn<T>>,
}

impl<T> RecoveryOperation<T> {
    pub fn new(retry: AttemptFn<T>) -> Self {
        Self {
            retry,
            failover: None,
        }
    }

    pub fn with_failover(mut self, failover: AttemptFn<T>) -> Self {
        self.failover = Some(failover);
        self
    }
}

/// Outcome of [`RecoveryOrchestrator::initiate`]
pub enum RecoveryDisposition<T> {
    /// No recovery will run; report this error now
    Surfaced(ClassifiedError),
    /// A recovery task is running and will answer on the receiver
    Pending(PendingRecovery<T>),
}

/// Handle on a running recovery
pub struct PendingRecovery<T> {
    pub id: u64,
    pub receiver: oneshot::Receiver<Result<T, ClassifiedError>>,
}

impl<T> PendingRecovery<T> {
    /// Wait for the single reply. A dropped sender means the task vanished
    /// without answering, which is reported as a cancellation.
    pub async fn wait(self) -> Result<T, ClassifiedError> {
        let id = self.id;
        match self.receiver.await {
            Ok(outcome) => outcome,
            Err(_) => Err(cancelled_error(id, None)),
        }
    }
}

/// Lifecycle of a recovery
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum RecoveryState {
    Pending,
    Running,
    Succeeded,
    Failed,
    Cancelled,
}

impl RecoveryState {
    pub fn is_finished(&self) -> bool {
        matches!(
            self,
            RecoveryState::Succeeded | RecoveryState::Failed | RecoveryState::Cancelled
        )
    }
}

/// Externally visible view of one recovery
#[derive(Debug, Clone, Serialize)]
pub struct RecoveryStatus {
    pub id: u64,
    pub strategy: RecoveryStrategy,
    pub state: RecoveryState,
    pub error: ClassifiedError,
    pub started_at: DateTime<Utc>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub finished_at: Option<DateTime<Utc>>,
    /// Attempts made by the recovery itself
    pub attempts: u32,
    #[serde(with = "humantime_serde", skip_serializing_if = "Option::is_none")]
    pub duration: Option<Duration>,
}

/// Aggregate recovery counters
#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct RecoveryMetrics {
    pub initiated: u64,
    pub succeeded: u64,
    pub failed: u64,
    pub cancelled: u64,
    /// Refused because the concurrency cap was reached
    pub rejected: u64,
    /// Surfaced at once under a terminal strategy
    pub fail_fast: u64,
    pub active: usize,
    #[serde(with = "humantime_serde")]
    pub total_duration: Duration,
    #[serde(with = "humantime_serde")]
    pub average_duration: Duration,
    /// succeeded / (succeeded + failed); zero before anything finished
    pub success_rate: f64,
}

/// Tunables for the orchestrator
#[derive(Debug, Clone)]
pub struct RecoveryTuning {
    pub max_concurrent_recoveries: usize,
    pub history_limit: usize,
    pub immediate_retry: RetryPolicy,
    pub backoff_retry: RetryPolicy,
}

impl Default for RecoveryTuning {
    fn default() -> Self {
        Self {
            max_concurrent_recoveries: 10,
            history_limit: 100,
            immediate_retry: RetryPolicy::immediate(),
            backoff_retry: RetryPolicy::backoff(),
        }
    }
}

/// Runs recoveries as cancellable background tasks
#[derive(Clone)]
pub struct RecoveryOrchestrator {
    inner: Arc<OrchestratorInner>,
}

struct OrchestratorInner {
    selector: StrategySelector,
    tuning: RecoveryTuning,
    next_id: AtomicU64,
    table: Mutex<RecoveryTable>,
    metrics: Mutex<MetricsState>,
}

#[derive(Default)]
struct RecoveryTable {
    active: HashMap<u64, ActiveRecovery>,
    finished: VecDeque<RecoveryStatus>,
}

struct ActiveRecovery {
    status: RecoveryStatus,
    started: Instant,
    abort: Option<AbortHandle>,
    /// Delivers a cancellation to the original caller
    cancel_reply: Box<dyn FnOnce(ClassifiedError) + Send>,
}

#[derive(Default)]
struct MetricsState {
    initiated: u64,
    succeeded: u64,
    failed: u64,
    cancelled: u64,
    rejected: u64,
    fail_fast: u64,
    total_duration: Duration,
}

type ReplySlot<T> = Arc<Mutex<Option<oneshot::Sender<Result<T, ClassifiedError>>>>>;

impl RecoveryOrchestrator {
    pub fn new(selector: StrategySelector, tuning: RecoveryTuning) -> Self {
        Self {
            inner: Arc::new(OrchestratorInner {
                selector,
                tuning,
                next_id: AtomicU64::new(1),
                table: Mutex::new(RecoveryTable::default()),
                metrics: Mutex::new(MetricsState::default()),
            }),
        }
    }

    pub fn with_defaults() -> Self {
        Self::new(StrategySelector::default(), RecoveryTuning::default())
    }

    pub fn selector(&self) -> &StrategySelector {
        &self.inner.selector
    }

    /// Resolve a strategy for `record` and either surface the error or start
    /// a recovery task. Must be called from within a tokio runtime.
    pub fn initiate<T>(
        &self,
        record: ErrorRecord,
        operation: RecoveryOperation<T>,
    ) -> RecoveryDisposition<T>
    where
        T: Send + 'static,
    {
        let strategy = self.inner.selector.select(&record);
        let surfaced = ClassifiedError::from_record(&record, strategy);

        let runnable = match strategy {
            RecoveryStrategy::ImmediateRetry | RecoveryStrategy::BackoffRetry => true,
            RecoveryStrategy::Failover => operation.failover.is_some(),
            RecoveryStrategy::CircuitBreak | RecoveryStrategy::Abandon => false,
        };

        if !record.recoverable || !runnable {
            debug!(
                "Surfacing {} without recovery ({})",
                record.category, strategy
            );
            self.inner.metrics.lock().fail_fast += 1;
            return RecoveryDisposition::Surfaced(surfaced);
        }

        let mut table = self.inner.table.lock();
        let limit = self.inner.tuning.max_concurrent_recoveries;
        if table.active.len() >= limit {
            drop(table);
            self.inner.metrics.lock().rejected += 1;
            warn!("Recovery capacity of {} reached, rejecting", limit);

            let rejected = ErrorClassifier::record(
                FailureSignal::RecoveryCapacityExceeded { limit },
                record.context.clone(),
            );
            return RecoveryDisposition::Surfaced(ClassifiedError::from_record(
                &rejected,
                RecoveryStrategy::Abandon,
            ));
        }

        let id = self.inner.next_id.fetch_add(1, Ordering::Relaxed);
        let (sender, receiver) = oneshot::channel();
        let reply: ReplySlot<T> = Arc::new(Mutex::new(Some(sender)));

        let cancel_slot = reply.clone();
        table.active.insert(
            id,
            ActiveRecovery {
                status: RecoveryStatus {
                    id,
                    strategy,
                    state: RecoveryState::Pending,
                    error: surfaced,
                    started_at: Utc::now(),
                    finished_at: None,
                    attempts: 0,
                    duration: None,
                },
                started: Instant::now(),
                abort: None,
                cancel_reply: Box::new(move |error| {
                    if let Some(sender) = cancel_slot.lock().take() {
                        let _ = sender.send(Err(error));
                    }
                }),
            },
        );

        // The entry exists before the task can look for it
        let inner = self.inner.clone();
        let handle = tokio::spawn(async move {
            inner.run(id, strategy, record, operation, reply).await;
        });
        if let Some(entry) = table.active.get_mut(&id) {
            entry.abort = Some(handle.abort_handle());
        }
        drop(table);

        self.inner.metrics.lock().initiated += 1;
        info!("Recovery {} started with strategy {}", id, strategy);

        RecoveryDisposition::Pending(PendingRecovery { id, receiver })
    }

    pub fn get_recovery_status(&self, id: u64) -> Option<RecoveryStatus> {
        let table = self.inner.table.lock();
        table
            .active
            .get(&id)
            .map(|entry| entry.status.clone())
            .or_else(|| table.finished.iter().find(|s| s.id == id).cloned())
    }

    /// Active recoveries followed by the retained finished ones
    pub fn list_recoveries(&self) -> Vec<RecoveryStatus> {
        let table = self.inner.table.lock();
        let mut active: Vec<_> = table.active.values().map(|e| e.status.clone()).collect();
        active.sort_by_key(|s| s.id);
        active.extend(table.finished.iter().cloned());
        active
    }

    /// Abort a running recovery. Returns false when it already finished or
    /// never existed.
    pub fn cancel_recovery(&self, id: u64) -> bool {
        let entry = {
            let mut table = self.inner.table.lock();
            let Some(mut entry) = table.active.remove(&id) else {
                return false;
            };
            if let Some(abort) = entry.abort.take() {
                abort.abort();
            }
            let elapsed = entry.started.elapsed();
            entry.status.state = RecoveryState::Cancelled;
            entry.status.finished_at = Some(Utc::now());
            entry.status.duration = Some(elapsed);
            self.inner.push_history(&mut table, entry.status.clone());
            entry
        };

        {
            let mut metrics = self.inner.metrics.lock();
            metrics.cancelled += 1;
            metrics.total_duration += entry.status.duration.unwrap_or_default();
        }

        info!("Recovery {} cancelled", id);
        let error = cancelled_error(id, Some(&entry.status.error));
        (entry.cancel_reply)(error);
        true
    }

    /// Cancel every running recovery; returns how many were cancelled
    pub fn cancel_all(&self) -> usize {
        let ids: Vec<u64> = self.inner.table.lock().active.keys().copied().collect();
        ids.into_iter()
            .filter(|id| self.cancel_recovery(*id))
            .count()
    }

    pub fn active_count(&self) -> usize {
        self.inner.table.lock().active.len()
    }

    pub fn get_metrics(&self) -> RecoveryMetrics {
        let active = self.active_count();
        let metrics = self.inner.metrics.lock();
        let finished = metrics.succeeded + metrics.failed + metrics.cancelled;
        let settled = metrics.succeeded + metrics.failed;

        RecoveryMetrics {
            initiated: metrics.initiated,
            succeeded: metrics.succeeded,
            failed: metrics.failed,
            cancelled: metrics.cancelled,
            rejected: metrics.rejected,
            fail_fast: metrics.fail_fast,
            active,
            total_duration: metrics.total_duration,
            average_duration: if finished == 0 {
                Duration::ZERO
            } else {
                metrics.total_duration / finished as u32
            },
            success_rate: if settled == 0 {
                0.0
            } else {
                metrics.succeeded as f64 / settled as f64
            },
        }
    }
}

impl OrchestratorInner {
    async fn run<T>(
        &self,
        id: u64,
        strategy: RecoveryStrategy,
        record: ErrorRecord,
        operation: RecoveryOperation<T>,
        reply: ReplySlot<T>,
    ) where
        T: Send + 'static,
    {
        self.update(id, |status| status.state = RecoveryState::Running);

        let base_attempt = record.context.attempt;
        let attempts = AtomicU32::new(0);

        let outcome = match strategy {
            RecoveryStrategy::Failover => match &operation.failover {
                Some(failover) => {
                    attempts.store(1, Ordering::Relaxed);
                    self.update(id, |status| status.attempts = 1);
                    failover(base_attempt + 1).await.map_err(|last| {
                        ClassifiedError::from_record(&last, self.selector.select(&last))
                            .with_attempts(2)
                    })
                }
                None => Err(ClassifiedError::from_record(&record, strategy)),
            },
            _ => {
                let policy = match strategy {
                    RecoveryStrategy::ImmediateRetry => self.tuning.immediate_retry.clone(),
                    _ => self.tuning.backoff_retry.clone(),
                };
                let executor = RetryExecutor::new(policy);

                let result = executor
                    .execute_with_context(|retry| {
                        attempts.store(retry, Ordering::Relaxed);
                        self.update(id, |status| status.attempts = retry);
                        (operation.retry)(base_attempt + retry)
                    })
                    .await;

                result.map_err(|err| self.surface_retry_failure(strategy, err))
            }
        };

        self.finish(id, outcome, attempts.load(Ordering::Relaxed), &reply);
    }

    fn surface_retry_failure(
        &self,
        strategy: RecoveryStrategy,
        err: RetryError<ErrorRecord>,
    ) -> ClassifiedError {
        let attempts = err.attempts() + 1;
        match err {
            RetryError::MaxAttemptsExceeded { last_error, .. } => {
                ClassifiedError::from_record(&last_error, strategy)
                    .with_reason(ErrorReason::RetriesExhausted)
                    .with_attempts(attempts)
            }
            RetryError::NonRetryableError { error, .. } => ClassifiedError::from_record(
                &error,
                StrategySelector::synchronous_strategy(error.reason()),
            )
            .with_attempts(attempts),
        }
    }

    fn finish<T>(
        &self,
        id: u64,
        outcome: Result<T, ClassifiedError>,
        attempts: u32,
        reply: &ReplySlot<T>,
    ) {
        let succeeded = outcome.is_ok();
        let duration = {
            let mut table = self.table.lock();
            // A cancellation that got here first already answered the caller
            let Some(mut entry) = table.active.remove(&id) else {
                return;
            };
            let elapsed = entry.started.elapsed();
            entry.status.state = if succeeded {
                RecoveryState::Succeeded
            } else {
                RecoveryState::Failed
            };
            entry.status.attempts = attempts;
            entry.status.finished_at = Some(Utc::now());
            entry.status.duration = Some(elapsed);
            if let Err(error) = &outcome {
                entry.status.error = error.clone();
            }
            self.push_history(&mut table, entry.status);
            elapsed
        };

        {
            let mut metrics = self.metrics.lock();
            if succeeded {
                metrics.succeeded += 1;
            } else {
                metrics.failed += 1;
            }
            metrics.total_duration += duration;
        }

        if succeeded {
            info!("Recovery {} succeeded after {} attempts", id, attempts);
        } else {
            warn!("Recovery {} failed after {} attempts", id, attempts);
        }

        if let Some(sender) = reply.lock().take() {
            if sender.send(outcome).is_err() {
                debug!("Recovery {} finished after its caller went away", id);
            }
        }
    }

    fn update(&self, id: u64, change: impl FnOnce(&mut RecoveryStatus)) {
        if let Some(entry) = self.table.lock().active.get_mut(&id) {
            change(&mut entry.status);
        }
    }

    fn push_history(&self, table: &mut RecoveryTable, status: RecoveryStatus) {
        if self.tuning.history_limit == 0 {
            return;
        }
        while table.finished.len() >= self.tuning.history_limit {
            table.finished.pop_front();
        }
        table.finished.push_back(status);
    }
}

fn cancelled_error(id: u64, original: Option<&ClassifiedError>) -> ClassifiedError {
    let context = original.map(|e| e.context.clone()).unwrap_or_default();
    let record = ErrorClassifier::record(FailureSignal::RecoveryCancelled { recovery_id: id }, context);
    let error = ClassifiedError::from_record(&record, RecoveryStrategy::Abandon);
    match original {
        Some(original) => error.with_attempts(original.attempts),
        None => error,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use futures::FutureExt;
    use pitboss_core::{ErrorCategory, ErrorContext, Severity};

    fn record(signal: FailureSignal) -> ErrorRecord {
        ErrorClassifier::record(signal, ErrorContext::new("execute").with_worker("worker-0"))
    }

    fn connection_failure() -> ErrorRecord {
        record(FailureSignal::ProcessExited { code: Some(9) })
    }

    /// Fails `failures` times with `signal`, then succeeds with the attempt number
    fn flaky(failures: u32, signal: FailureSignal) -> (AttemptFn<u32>, Arc<AtomicU32>) {
        let calls = Arc::new(AtomicU32::new(0));
        let counter = calls.clone();
        let op: AttemptFn<u32> = Arc::new(move |attempt| {
            let n = counter.fetch_add(1, Ordering::SeqCst) + 1;
            let signal = signal.clone();
            async move {
                if n <= failures {
                    let ctx = ErrorContext::new("execute").with_attempt(attempt);
                    Err(ErrorClassifier::record(signal, ctx))
                } else {
                    Ok(attempt)
                }
            }
            .boxed()
        });
        (op, calls)
    }

    fn pending<T>(disposition: RecoveryDisposition<T>) -> PendingRecovery<T> {
        match disposition {
            RecoveryDisposition::Pending(pending) => pending,
            RecoveryDisposition::Surfaced(error) => panic!("surfaced: {}", error),
        }
    }

    fn surfaced<T>(disposition: RecoveryDisposition<T>) -> ClassifiedError {
        match disposition {
            RecoveryDisposition::Surfaced(error) => error,
            RecoveryDisposition::Pending(p) => panic!("recovery {} started", p.id),
        }
    }

    #[tokio::test(start_paused = true)]
    async fn test_backoff_retry_recovers() {
        let orchestrator = RecoveryOrchestrator::with_defaults();
        let (op, calls) = flaky(2, FailureSignal::ConnectionClosed);

        let started = Instant::now();
        let recovery = pending(orchestrator.initiate(connection_failure(), RecoveryOperation::new(op)));
        let id = recovery.id;

        assert_eq!(recovery.wait().await.unwrap(), 4);
        assert_eq!(calls.load(Ordering::SeqCst), 3);
        assert_eq!(started.elapsed(), Duration::from_secs(1 + 2 + 4));

        let status = orchestrator.get_recovery_status(id).unwrap();
        assert_eq!(status.state, RecoveryState::Succeeded);
        assert_eq!(status.strategy, RecoveryStrategy::BackoffRetry);
        assert_eq!(status.attempts, 3);
    }

    #[tokio::test(start_paused = true)]
    async fn test_backoff_retry_exhausts_after_five() {
        let orchestrator = RecoveryOrchestrator::with_defaults();
        let (op, calls) = flaky(u32::MAX, FailureSignal::ConnectionClosed);

        let recovery = pending(orchestrator.initiate(connection_failure(), RecoveryOperation::new(op)));
        let error = recovery.wait().await.unwrap_err();

        assert_eq!(calls.load(Ordering::SeqCst), 5);
        assert_eq!(error.reason, ErrorReason::RetriesExhausted);
        assert_eq!(error.category, ErrorCategory::Connection);
        assert_eq!(error.recovery_strategy, RecoveryStrategy::BackoffRetry);
        assert_eq!(error.attempts, 6);

        let metrics = orchestrator.get_metrics();
        assert_eq!(metrics.failed, 1);
        assert_eq!(metrics.success_rate, 0.0);
        assert_eq!(metrics.total_duration, Duration::from_secs(31));
    }

    #[tokio::test(start_paused = true)]
    async fn test_non_retryable_failure_stops_retrying() {
        let orchestrator = RecoveryOrchestrator::with_defaults();
        let (op, calls) = flaky(
            u32::MAX,
            FailureSignal::CircuitOpen {
                breaker: "pool_connections".to_string(),
                retry_after_ms: 100,
            },
        );

        let recovery = pending(orchestrator.initiate(connection_failure(), RecoveryOperation::new(op)));
        let error = recovery.wait().await.unwrap_err();

        assert_eq!(calls.load(Ordering::SeqCst), 1);
        assert!(error.is_circuit_open());
        assert_eq!(error.recovery_strategy, RecoveryStrategy::CircuitBreak);
    }

    #[tokio::test]
    async fn test_terminal_strategies_surface_immediately() {
        let orchestrator = RecoveryOrchestrator::with_defaults();
        let (op, calls) = flaky(0, FailureSignal::ConnectionClosed);

        let critical_resource = record(FailureSignal::ResourceExhausted {
            message: "fd limit".to_string(),
        });
        let error = surfaced(orchestrator.initiate(critical_resource, RecoveryOperation::new(op.clone())));
        assert_eq!(error.recovery_strategy, RecoveryStrategy::CircuitBreak);
        assert_eq!(error.severity, Severity::Critical);

        let system = record(FailureSignal::Unclassified {
            message: "weird".to_string(),
        });
        let error = surfaced(orchestrator.initiate(system, RecoveryOperation::new(op)));
        assert_eq!(error.recovery_strategy, RecoveryStrategy::Abandon);

        assert_eq!(calls.load(Ordering::SeqCst), 0);
        assert_eq!(orchestrator.get_metrics().fail_fast, 2);
        assert_eq!(orchestrator.get_metrics().initiated, 0);
    }

    #[tokio::test]
    async fn test_failover_uses_alternate_once() {
        let orchestrator = RecoveryOrchestrator::with_defaults();
        let worker_error = record(FailureSignal::WorkerReported {
            error_type: "RuntimeError".to_string(),
            message: "boom".to_string(),
        });

        let (retry, retry_calls) = flaky(0, FailureSignal::ConnectionClosed);
        let without_alternate = surfaced(
            orchestrator.initiate(worker_error.clone(), RecoveryOperation::new(retry.clone())),
        );
        assert_eq!(without_alternate.recovery_strategy, RecoveryStrategy::Failover);

        let (alternate, alternate_calls) = flaky(0, FailureSignal::ConnectionClosed);
        let recovery = pending(orchestrator.initiate(
            worker_error,
            RecoveryOperation::new(retry).with_failover(alternate),
        ));

        assert_eq!(recovery.wait().await.unwrap(), 2);
        assert_eq!(alternate_calls.load(Ordering::SeqCst), 1);
        assert_eq!(retry_calls.load(Ordering::SeqCst), 0);
    }

    #[tokio::test(start_paused = true)]
    async fn test_capacity_cap_rejects() {
        let orchestrator = RecoveryOrchestrator::new(
            StrategySelector::default(),
            RecoveryTuning {
                max_concurrent_recoveries: 1,
                ..Default::default()
            },
        );
        let (op, _) = flaky(u32::MAX, FailureSignal::ConnectionClosed);

        let first = pending(orchestrator.initiate(connection_failure(), RecoveryOperation::new(op.clone())));
        let error = surfaced(orchestrator.initiate(connection_failure(), RecoveryOperation::new(op)));

        assert_eq!(error.reason, ErrorReason::RecoveryCapacityExceeded);
        assert_eq!(orchestrator.get_metrics().rejected, 1);
        assert_eq!(orchestrator.active_count(), 1);

        assert!(orchestrator.cancel_recovery(first.id));
        assert_eq!(orchestrator.active_count(), 0);
    }

    #[tokio::test(start_paused = true)]
    async fn test_cancel_replies_exactly_once() {
        let orchestrator = RecoveryOrchestrator::with_defaults();
        let (op, calls) = flaky(u32::MAX, FailureSignal::ConnectionClosed);

        let recovery = pending(orchestrator.initiate(connection_failure(), RecoveryOperation::new(op)));
        let id = recovery.id;

        // let the first retry run and the task park on the next delay
        tokio::time::sleep(Duration::from_millis(1500)).await;
        assert_eq!(calls.load(Ordering::SeqCst), 1);
        assert_eq!(
            orchestrator.get_recovery_status(id).unwrap().state,
            RecoveryState::Running
        );

        assert!(orchestrator.cancel_recovery(id));
        assert!(!orchestrator.cancel_recovery(id));

        let error = recovery.wait().await.unwrap_err();
        assert_eq!(error.reason, ErrorReason::RecoveryCancelled);

        tokio::time::sleep(Duration::from_secs(60)).await;
        assert_eq!(calls.load(Ordering::SeqCst), 1);

        let metrics = orchestrator.get_metrics();
        assert_eq!(metrics.cancelled, 1);
        assert_eq!(metrics.failed, 0);
        assert_eq!(
            orchestrator.get_recovery_status(id).unwrap().state,
            RecoveryState::Cancelled
        );
    }

    #[tokio::test(start_paused = true)]
    async fn test_metrics_and_history() {
        let orchestrator = RecoveryOrchestrator::new(
            StrategySelector::default(),
            RecoveryTuning {
                history_limit: 2,
                ..Default::default()
            },
        );

        let session_error = record(FailureSignal::SessionWorkerUnavailable {
            session_id: "s1".to_string(),
            worker_id: "worker-0".to_string(),
        });
        // not recoverable: surfaced even though the table says immediate_retry
        let (op, _) = flaky(0, FailureSignal::ConnectionClosed);
        let error = surfaced(orchestrator.initiate(session_error, RecoveryOperation::new(op)));
        assert!(error.is_session_worker_unavailable());

        let protocol = record(FailureSignal::ProtocolViolation {
            message: "bad frame".to_string(),
        });
        let mut ids = Vec::new();
        for failures in [0, 1, 3] {
            let (op, _) = flaky(failures, FailureSignal::ConnectionClosed);
            let recovery = pending(orchestrator.initiate(protocol.clone(), RecoveryOperation::new(op)));
            ids.push(recovery.id);
            let _ = recovery.wait().await;
        }

        let metrics = orchestrator.get_metrics();
        assert_eq!(metrics.initiated, 3);
        assert_eq!(metrics.succeeded, 2);
        assert_eq!(metrics.failed, 1);
        assert_eq!(metrics.fail_fast, 1);
        assert!((metrics.success_rate - 2.0 / 3.0).abs() < f64::EPSILON);
        // 0ms, 0+100ms, 0+100+200ms
        assert_eq!(metrics.total_duration, Duration::from_millis(400));

        let history = orchestrator.list_recoveries();
        assert_eq!(history.len(), 2);
        assert!(orchestrator.get_recovery_status(ids[0]).is_none());
        assert_eq!(history[1].id, ids[2]);
        assert_eq!(history[1].state, RecoveryState::Failed);
    }

    #[tokio::test(start_paused = true)]
    async fn test_cancel_all() {
        let orchestrator = RecoveryOrchestrator::with_defaults();
        let mut recoveries = Vec::new();
        for _ in 0..3 {
            let (op, _) = flaky(u32::MAX, FailureSignal::ConnectionClosed);
            recoveries.push(pending(
                orchestrator.initiate(connection_failure(), RecoveryOperation::new(op)),
            ));
        }

        assert_eq!(orchestrator.cancel_all(), 3);
        for recovery in recoveries {
            assert_eq!(
                recovery.wait().await.unwrap_err().reason,
                ErrorReason::RecoveryCancelled
            );
        }
    }
}
