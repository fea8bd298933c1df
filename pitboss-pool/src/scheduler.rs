//! The pool coordinator
//!
//! A single task owns every piece of mutable scheduling state: worker slots,
//! the idle list, the wait queue and the session table. Everything else talks
//! to it through [`Command`]s, so checkouts and checkins are strictly ordered
//! and a freed worker is handed to the next eligible waiter before anyone
//! else can see it idle.

use pitboss_config::{PoolConfig, SessionConfig};
use pitboss_core::{ErrorClassifier, ErrorContext, ErrorRecord, FailureSignal};
use pitboss_resilience::{BackoffCalculator, BackoffStrategy};
use serde::Serialize;
use std::collections::{HashMap, HashSet, VecDeque};
use std::sync::Arc;
use tokio::sync::{mpsc, oneshot};
use tokio::time::{Instant, MissedTickBehavior};
use tracing::{debug, info, warn};

use crate::initializer::ConcurrentPoolInitializer;
use crate::registry::WorkerRegistry;
use crate::session::SessionAffinityTable;
use crate::worker::{WorkerExit, WorkerProcess, WorkerStatus};

pub(crate) fn worker_id_for(seq: usize) -> String {
    format!("worker_{}", seq)
}

/// Which workers may serve a request
#[derive(Debug, Clone, PartialEq, Eq)]
pub(crate) enum Target {
    Any,
    Session(String),
}

impl Target {
    pub(crate) fn session_id(&self) -> Option<&str> {
        match self {
            Target::Any => None,
            Target::Session(session_id) => Some(session_id),
        }
    }
}

pub(crate) enum CheckinOutcome {
    Healthy,
    Unhealthy(FailureSignal),
}

pub(crate) struct CheckoutRequest {
    pub target: Target,
    /// Worker to pass over when another one is idle
    pub avoid: Option<String>,
    pub reply: oneshot::Sender<Result<WorkerLease, FailureSignal>>,
}

pub(crate) enum Command {
    Checkout(CheckoutRequest),
    Checkin {
        worker_id: String,
        outcome: CheckinOutcome,
    },
    /// Check out `worker_id` for a health probe if it is idle
    ProbeCheckout {
        worker_id: String,
        reply: oneshot::Sender<Option<WorkerLease>>,
    },
    WorkerStarted {
        slot: usize,
        worker: Arc<WorkerProcess>,
    },
    WorkerStartFailed {
        slot: usize,
        error: ErrorRecord,
    },
    Stats {
        reply: oneshot::Sender<SchedulerSnapshot>,
    },
    Shutdown {
        reply: oneshot::Sender<Vec<Arc<WorkerProcess>>>,
    },
}

/// Exclusive use of one worker. Dropping the lease checks the worker back
/// in, whatever happened to the call.
pub struct WorkerLease {
    worker: Arc<WorkerProcess>,
    commands: mpsc::UnboundedSender<Command>,
    unhealthy: Option<FailureSignal>,
}

impl WorkerLease {
    pub fn worker(&self) -> &Arc<WorkerProcess> {
        &self.worker
    }

    pub fn worker_id(&self) -> &str {
        self.worker.id()
    }

    /// Have the coordinator retire the worker at checkin
    pub fn mark_unhealthy(&mut self, reason: FailureSignal) {
        self.unhealthy = Some(reason);
    }
}

impl std::fmt::Debug for WorkerLease {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("WorkerLease")
            .field("worker_id", &self.worker.id())
            .field("unhealthy", &self.unhealthy)
            .finish()
    }
}

impl Drop for WorkerLease {
    fn drop(&mut self) {
        let outcome = match self.unhealthy.take() {
            Some(reason) => CheckinOutcome::Unhealthy(reason),
            None => CheckinOutcome::Healthy,
        };
        let _ = self.commands.send(Command::Checkin {
            worker_id: self.worker.id().to_string(),
            outcome,
        });
    }
}

/// Scheduling counters owned by the coordinator
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub(crate) struct SchedulerSnapshot {
    pub workers: usize,
    pub available: usize,
    pub busy: usize,
    pub queued: usize,
    pub max_queued: usize,
    pub sessions: usize,
    pub restarts: u64,
}

struct Waiter {
    target: Target,
    enqueued_at: Instant,
    reply: oneshot::Sender<Result<WorkerLease, FailureSignal>>,
}

struct WorkerSlot {
    slot: usize,
    worker: Arc<WorkerProcess>,
    status: WorkerStatus,
    /// Session whose call holds the worker
    session: Option<String>,
}

pub(crate) struct Coordinator {
    config: PoolConfig,
    sweep_interval: std::time::Duration,
    registry: WorkerRegistry,
    initializer: ConcurrentPoolInitializer,
    commands: mpsc::WeakUnboundedSender<Command>,
    exits: mpsc::UnboundedSender<WorkerExit>,
    workers: HashMap<String, WorkerSlot>,
    idle: VecDeque<String>,
    queue: VecDeque<Waiter>,
    sessions: SessionAffinityTable,
    restart_budget: HashMap<usize, u32>,
    restart_backoff: BackoffCalculator,
    restarts: u64,
    max_queued: usize,
    next_seq: usize,
    shutting_down: bool,
}

impl Coordinator {
    pub(crate) fn new(
        config: PoolConfig,
        session: &SessionConfig,
        registry: WorkerRegistry,
        initializer: ConcurrentPoolInitializer,
        commands: mpsc::WeakUnboundedSender<Command>,
        exits: mpsc::UnboundedSender<WorkerExit>,
    ) -> Self {
        let restart_backoff = BackoffCalculator::new(
            BackoffStrategy::Exponential { base: 2.0 },
            config.restart_delay,
            config.restart_delay.saturating_mul(32),
            false,
        );

        Self {
            next_seq: config.size,
            config,
            sweep_interval: session.sweep_interval,
            registry,
            initializer,
            commands,
            exits,
            workers: HashMap::new(),
            idle: VecDeque::new(),
            queue: VecDeque::new(),
            sessions: SessionAffinityTable::new(session.ttl),
            restart_budget: HashMap::new(),
            restart_backoff,
            restarts: 0,
            max_queued: 0,
            shutting_down: false,
        }
    }

    /// Take ownership of a worker started before the coordinator runs
    pub(crate) fn adopt(&mut self, slot: usize, worker: Arc<WorkerProcess>) {
        let worker_id = worker.id().to_string();
        self.registry.register(worker.clone());
        self.workers.insert(
            worker_id.clone(),
            WorkerSlot {
                slot,
                worker,
                status: WorkerStatus::Idle,
                session: None,
            },
        );
        self.idle.push_back(worker_id);
    }

    pub(crate) async fn run(
        mut self,
        mut commands: mpsc::UnboundedReceiver<Command>,
        mut exits: mpsc::UnboundedReceiver<WorkerExit>,
    ) {
        let mut sweep = tokio::time::interval_at(
            Instant::now() + self.sweep_interval,
            self.sweep_interval,
        );
        sweep.set_missed_tick_behavior(MissedTickBehavior::Delay);

        loop {
            tokio::select! {
                command = commands.recv() => match command {
                    Some(command) => self.handle(command),
                    None => break,
                },
                Some(exit) = exits.recv() => self.handle_exit(exit),
                _ = sweep.tick() => {
                    let expired = self.sessions.sweep(Instant::now());
                    if expired > 0 {
                        debug!(expired, "Swept expired session bindings");
                    }
                }
            }
        }

        debug!("Pool coordinator stopped");
    }

    pub(crate) fn handle(&mut self, command: Command) {
        match command {
            Command::Checkout(request) => self.checkout(request),
            Command::Checkin { worker_id, outcome } => self.checkin(worker_id, outcome),
            Command::ProbeCheckout { worker_id, reply } => {
                let lease = if self.shutting_down
                    || self.live_status(&worker_id) != Some(WorkerStatus::Idle)
                {
                    None
                } else {
                    self.idle.retain(|id| id != &worker_id);
                    self.take(&worker_id, None)
                };
                let _ = reply.send(lease);
            }
            Command::WorkerStarted { slot, worker } => self.worker_started(slot, worker),
            Command::WorkerStartFailed { slot, error } => {
                warn!(
                    slot,
                    category = %error.category,
                    "Replacement worker failed to start: {}",
                    error.message()
                );
                if !self.shutting_down {
                    self.schedule_restart(slot);
                }
            }
            Command::Stats { reply } => {
                let _ = reply.send(self.snapshot());
            }
            Command::Shutdown { reply } => {
                let workers = if self.shutting_down {
                    Vec::new()
                } else {
                    self.begin_shutdown()
                };
                let _ = reply.send(workers);
            }
        }
    }

    fn handle_exit(&mut self, exit: WorkerExit) {
        if self.workers.contains_key(&exit.worker_id) {
            self.retire(&exit.worker_id, FailureSignal::ProcessExited { code: exit.code });
        }
    }

    fn checkout(&mut self, request: CheckoutRequest) {
        if self.shutting_down {
            let _ = request.reply.send(Err(FailureSignal::ShuttingDown));
            return;
        }

        let now = Instant::now();
        let session_id = request.target.session_id().map(str::to_string);

        if let Some(session_id) = &session_id {
            let bound = self
                .sessions
                .lookup(session_id, now)
                .map(|binding| binding.worker_id.clone());

            if let Some(worker_id) = bound {
                match self.live_status(&worker_id) {
                    Some(WorkerStatus::Idle) => {
                        self.idle.retain(|id| id != &worker_id);
                        self.lease(&worker_id, Some(session_id.clone()), request.reply);
                    }
                    Some(_) => self.enqueue(request, now),
                    None => {
                        // Reported once; the caller's next call binds afresh
                        self.sessions.remove(session_id);
                        info!(
                            session_id = %session_id,
                            worker_id = %worker_id,
                            "Session worker is no longer available"
                        );
                        let _ = request
                            .reply
                            .send(Err(FailureSignal::SessionWorkerUnavailable {
                                session_id: session_id.clone(),
                                worker_id,
                            }));
                    }
                }
                return;
            }
        }

        match self.pop_idle(request.avoid.as_deref()) {
            Some(worker_id) => {
                if let Some(session_id) = &session_id {
                    self.sessions.bind(session_id, &worker_id, now);
                    debug!(session_id = %session_id, worker_id = %worker_id, "Session bound");
                }
                self.lease(&worker_id, session_id, request.reply);
            }
            None => self.enqueue(request, now),
        }
    }

    fn enqueue(&mut self, request: CheckoutRequest, now: Instant) {
        self.queue.retain(|waiter| !waiter.reply.is_closed());

        if self.queue.len() >= self.config.queue_depth {
            debug!(depth = self.config.queue_depth, "Wait queue full");
            let _ = request.reply.send(Err(FailureSignal::QueueFull {
                depth: self.config.queue_depth,
            }));
            return;
        }

        self.queue.push_back(Waiter {
            target: request.target,
            enqueued_at: now,
            reply: request.reply,
        });
        self.max_queued = self.max_queued.max(self.queue.len());
    }

    fn checkin(&mut self, worker_id: String, outcome: CheckinOutcome) {
        let Some(slot) = self.workers.get_mut(&worker_id) else {
            debug!(worker_id = %worker_id, "Checkin for a retired worker");
            return;
        };
        if slot.status != WorkerStatus::Busy {
            return;
        }
        if let Some(session_id) = slot.session.take() {
            self.sessions.end_use(&session_id, Instant::now());
        }

        if !slot.worker.is_alive() {
            let signal = slot.worker.exit_signal();
            self.retire(&worker_id, signal);
            return;
        }

        match outcome {
            CheckinOutcome::Unhealthy(reason) => {
                slot.status = WorkerStatus::Unhealthy;
                self.retire(&worker_id, reason);
            }
            CheckinOutcome::Healthy => {
                slot.status = WorkerStatus::Idle;
                self.release(worker_id);
            }
        }
    }

    /// Hand a freshly idle worker to the first waiter that can use it
    fn release(&mut self, worker_id: String) {
        let now = Instant::now();
        self.queue.retain(|waiter| !waiter.reply.is_closed());

        let sessions = &self.sessions;
        let position = self.queue.iter().position(|waiter| match &waiter.target {
            Target::Any => true,
            Target::Session(session_id) => sessions
                .bound_worker(session_id, now)
                .map_or(true, |bound| bound == worker_id),
        });

        match position.and_then(|index| self.queue.remove(index)) {
            Some(waiter) => {
                let session_id = waiter.target.session_id().map(str::to_string);
                if let Some(session_id) = &session_id {
                    if self.sessions.bound_worker(session_id, now).is_none() {
                        self.sessions.bind(session_id, &worker_id, now);
                    }
                }
                debug!(
                    worker_id = %worker_id,
                    waited = ?now.saturating_duration_since(waiter.enqueued_at),
                    "Worker handed to queued caller"
                );
                self.lease(&worker_id, session_id, waiter.reply);
            }
            None => self.idle.push_back(worker_id),
        }
    }

    fn pop_idle(&mut self, avoid: Option<&str>) -> Option<String> {
        loop {
            let index = match avoid {
                Some(avoid) => self.idle.iter().position(|id| id != avoid).unwrap_or(0),
                None => 0,
            };
            let worker_id = self.idle.remove(index)?;

            match self.live_status(&worker_id) {
                Some(WorkerStatus::Idle) => return Some(worker_id),
                // Retired by live_status, or somehow not idle
                _ => continue,
            }
        }
    }

    /// Status of a worker that is still running. A dead worker found here is
    /// retired on the spot.
    fn live_status(&mut self, worker_id: &str) -> Option<WorkerStatus> {
        let slot = self.workers.get(worker_id)?;
        if slot.worker.is_alive() {
            return Some(slot.status);
        }
        let signal = slot.worker.exit_signal();
        self.retire(worker_id, signal);
        None
    }

    fn take(&mut self, worker_id: &str, session_id: Option<String>) -> Option<WorkerLease> {
        let commands = self.commands.upgrade()?;
        let slot = self.workers.get_mut(worker_id)?;
        slot.status = WorkerStatus::Busy;
        if let Some(session_id) = &session_id {
            self.sessions.begin_use(session_id, Instant::now());
        }
        slot.session = session_id;
        Some(WorkerLease {
            worker: slot.worker.clone(),
            commands,
            unhealthy: None,
        })
    }

    fn lease(
        &mut self,
        worker_id: &str,
        session_id: Option<String>,
        reply: oneshot::Sender<Result<WorkerLease, FailureSignal>>,
    ) {
        let lease = self.take(worker_id, session_id).ok_or(FailureSignal::ShuttingDown);
        // A caller that already gave up drops the lease, which checks it back in
        let _ = reply.send(lease);
    }

    /// Remove a worker for good and schedule its replacement
    fn retire(&mut self, worker_id: &str, reason: FailureSignal) {
        let Some(slot) = self.workers.remove(worker_id) else {
            return;
        };
        self.idle.retain(|id| id != worker_id);
        self.registry.deregister(worker_id);
        if let Some(session_id) = &slot.session {
            self.sessions.end_use(session_id, Instant::now());
        }

        let record = ErrorClassifier::record(
            reason,
            ErrorContext::new("supervise").with_worker(worker_id),
        );
        if self.shutting_down {
            debug!(worker_id, "Worker stopped during shutdown: {}", record.message());
        } else {
            warn!(
                worker_id,
                category = %record.category,
                severity = %record.severity,
                "Worker retired: {}",
                record.message()
            );
        }

        let pinned: HashSet<String> = self.sessions.sessions_for(worker_id).into_iter().collect();
        if !pinned.is_empty() {
            let (stranded, kept): (VecDeque<Waiter>, VecDeque<Waiter>) =
                std::mem::take(&mut self.queue)
                    .into_iter()
                    .partition(|waiter| {
                        matches!(&waiter.target, Target::Session(s) if pinned.contains(s))
                    });
            self.queue = kept;

            for waiter in stranded {
                if let Target::Session(session_id) = waiter.target {
                    self.sessions.remove(&session_id);
                    let _ = waiter
                        .reply
                        .send(Err(FailureSignal::SessionWorkerUnavailable {
                            session_id,
                            worker_id: worker_id.to_string(),
                        }));
                }
            }
        }

        let worker = slot.worker;
        tokio::spawn(async move { worker.kill().await });

        if !self.shutting_down {
            self.schedule_restart(slot.slot);
        }
    }

    pub(crate) fn schedule_restart(&mut self, slot: usize) {
        if !self.config.restart_on_crash {
            return;
        }

        let used = self.restart_budget.entry(slot).or_insert(0);
        if *used >= self.config.max_restart_attempts {
            warn!(slot, "Restart budget exhausted, slot stays empty");
            return;
        }
        *used += 1;
        let attempt = *used;

        let Some(commands) = self.commands.upgrade() else {
            return;
        };

        let delay = self.restart_backoff.calculate_delay(attempt);
        let worker_id = worker_id_for(self.next_seq);
        self.next_seq += 1;
        info!(slot, worker_id = %worker_id, ?delay, attempt, "Scheduling replacement worker");

        let initializer = self.initializer.clone();
        let exits = self.exits.clone();
        tokio::spawn(async move {
            tokio::time::sleep(delay).await;
            let command = match initializer.start_one(worker_id, exits).await {
                Ok(worker) => Command::WorkerStarted { slot, worker },
                Err(error) => Command::WorkerStartFailed { slot, error },
            };
            let _ = commands.send(command);
        });
    }

    fn worker_started(&mut self, slot: usize, worker: Arc<WorkerProcess>) {
        if self.shutting_down {
            let grace = self.config.shutdown_grace;
            tokio::spawn(async move { worker.shutdown(grace).await });
            return;
        }

        if !worker.is_alive() {
            self.schedule_restart(slot);
            return;
        }

        info!(slot, worker_id = %worker.id(), "Replacement worker joined the pool");
        self.restarts += 1;
        let worker_id = worker.id().to_string();
        self.registry.register(worker.clone());
        self.workers.insert(
            worker_id.clone(),
            WorkerSlot {
                slot,
                worker,
                status: WorkerStatus::Idle,
                session: None,
            },
        );
        self.release(worker_id);
    }

    fn begin_shutdown(&mut self) -> Vec<Arc<WorkerProcess>> {
        self.shutting_down = true;
        for waiter in self.queue.drain(..) {
            let _ = waiter.reply.send(Err(FailureSignal::ShuttingDown));
        }
        self.idle.clear();

        let mut workers: Vec<_> = self.workers.values().map(|slot| slot.worker.clone()).collect();
        workers.sort_by(|a, b| a.id().cmp(b.id()));
        workers
    }

    pub(crate) fn snapshot(&self) -> SchedulerSnapshot {
        let count = |status: WorkerStatus| {
            self.workers
                .values()
                .filter(|slot| slot.status == status)
                .count()
        };

        SchedulerSnapshot {
            workers: self.workers.len(),
            available: count(WorkerStatus::Idle),
            busy: count(WorkerStatus::Busy),
            queued: self
                .queue
                .iter()
                .filter(|waiter| !waiter.reply.is_closed())
                .count(),
            max_queued: self.max_queued,
            sessions: self.sessions.len(),
            restarts: self.restarts,
        }
    }
}
