//! Circuit breaker pattern implementation
//!
//! A breaker counts consecutive failures. Once `failure_threshold` is reached
//! it opens and rejects every admission until `cooldown` has elapsed. It then
//! admits exactly one probe: a successful probe closes the breaker, a failed
//! one reopens it and restarts the cooldown.

use chrono::{DateTime, Utc};
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use std::time::Duration;
use tokio::time::Instant;

/// Circuit breaker state
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CircuitState {
    /// Circuit is closed, requests pass through normally
    Closed,
    /// Circuit is open, requests are blocked
    Open,
    /// Cooldown elapsed, a single probe is allowed through
    HalfOpen,
}

impl std::fmt::Display for CircuitState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            CircuitState::Closed => write!(f, "closed"),
            CircuitState::Open => write!(f, "open"),
            CircuitState::HalfOpen => write!(f, "half_open"),
        }
    }
}

/// Circuit breaker configuration
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CircuitBreakerConfig {
    /// Consecutive failures before opening the circuit
    pub failure_threshold: u32,

    /// Time to wait before transitioning from open to half-open
    #[serde(with = "humantime_serde")]
    pub cooldown: Duration,
}

impl Default for CircuitBreakerConfig {
    fn default() -> Self {
        Self {
            failure_threshold: 5,
            cooldown: Duration::from_secs(30),
        }
    }
}

/// Admission refused by an open breaker
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BreakerRejection {
    pub breaker: String,
    /// Time until the breaker will admit a probe; zero when a probe is
    /// already in flight
    pub retry_after: Duration,
}

/// Point-in-time view of a breaker
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct BreakerSnapshot {
    pub name: String,
    pub state: CircuitState,
    pub failure_count: u32,
    pub opened_at: Option<DateTime<Utc>>,
    pub total_successes: u64,
    pub total_failures: u64,
    pub total_rejected: u64,
}

/// Thread-safe circuit breaker
#[derive(Clone)]
pub struct CircuitBreaker {
    name: Arc<str>,
    config: Arc<CircuitBreakerConfig>,
    state: Arc<Mutex<BreakerState>>,
}

struct BreakerState {
    state: CircuitState,
    consecutive_failures: u32,
    opened_at: Option<Instant>,
    opened_at_wall: Option<DateTime<Utc>>,
    probe_in_flight: bool,
    total_successes: u64,
    total_failures: u64,
    total_rejected: u64,
}

impl CircuitBreaker {
    /// Create a named breaker with the given configuration
    pub fn new(name: impl Into<String>, config: CircuitBreakerConfig) -> Self {
        Self {
            name: Arc::from(name.into()),
            config: Arc::new(config),
            state: Arc::new(Mutex::new(BreakerState {
                state: CircuitState::Closed,
                consecutive_failures: 0,
                opened_at: None,
                opened_at_wall: None,
                probe_in_flight: false,
                total_successes: 0,
                total_failures: 0,
                total_rejected: 0,
            })),
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn config(&self) -> &CircuitBreakerConfig {
        &self.config
    }

    /// Get the current state
    pub fn state(&self) -> CircuitState {
        let mut state = self.state.lock();
        self.update_state(&mut state);
        state.state
    }

    /// Ask for admission. In half-open only the first caller gets a (probe)
    /// permit; everybody else is rejected until the probe settles.
    pub fn try_acquire(&self) -> Result<BreakerPermit, BreakerRejection> {
        let mut state = self.state.lock();
        self.update_state(&mut state);

        match state.state {
            CircuitState::Closed => Ok(BreakerPermit::new(self.clone(), false)),
            CircuitState::HalfOpen if !state.probe_in_flight => {
                state.probe_in_flight = true;
                log::debug!("Circuit breaker {} admitting probe", self.name);
                Ok(BreakerPermit::new(self.clone(), true))
            }
            CircuitState::HalfOpen => {
                state.total_rejected += 1;
                Err(self.rejection(Duration::ZERO))
            }
            CircuitState::Open => {
                state.total_rejected += 1;
                let elapsed = state.opened_at.map(|t| t.elapsed()).unwrap_or_default();
                Err(self.rejection(self.config.cooldown.saturating_sub(elapsed)))
            }
        }
    }

    /// Time left before an open breaker admits its probe
    pub fn remaining_cooldown(&self) -> Option<Duration> {
        let mut state = self.state.lock();
        self.update_state(&mut state);
        match (state.state, state.opened_at) {
            (CircuitState::Open, Some(opened_at)) => {
                Some(self.config.cooldown.saturating_sub(opened_at.elapsed()))
            }
            _ => None,
        }
    }

    pub fn snapshot(&self) -> BreakerSnapshot {
        let mut state = self.state.lock();
        self.update_state(&mut state);
        BreakerSnapshot {
            name: self.name.to_string(),
            state: state.state,
            failure_count: state.consecutive_failures,
            opened_at: state.opened_at_wall,
            total_successes: state.total_successes,
            total_failures: state.total_failures,
            total_rejected: state.total_rejected,
        }
    }

    // Internal methods

    fn rejection(&self, retry_after: Duration) -> BreakerRejection {
        BreakerRejection {
            breaker: self.name.to_string(),
            retry_after,
        }
    }

    fn settle(&self, probe: bool, success: bool) {
        let mut state = self.state.lock();
        self.update_state(&mut state);

        if probe {
            state.probe_in_flight = false;
        }

        if success {
            state.total_successes += 1;
            match state.state {
                CircuitState::Closed => state.consecutive_failures = 0,
                CircuitState::HalfOpen if probe => self.transition_to_closed(&mut state),
                // A call admitted before the breaker opened cannot close it
                CircuitState::HalfOpen | CircuitState::Open => {}
            }
        } else {
            state.total_failures += 1;
            match state.state {
                CircuitState::Closed => {
                    state.consecutive_failures += 1;
                    if state.consecutive_failures >= self.config.failure_threshold {
                        self.transition_to_open(&mut state);
                    }
                }
                CircuitState::HalfOpen if probe => {
                    state.consecutive_failures += 1;
                    self.transition_to_open(&mut state);
                }
                CircuitState::HalfOpen | CircuitState::Open => {}
            }
        }
    }

    fn release_probe(&self) {
        let mut state = self.state.lock();
        state.probe_in_flight = false;
    }

    fn update_state(&self, state: &mut BreakerState) {
        if state.state == CircuitState::Open {
            if let Some(opened_at) = state.opened_at {
                if opened_at.elapsed() >= self.config.cooldown {
                    state.state = CircuitState::HalfOpen;
                    state.probe_in_flight = false;
                    log::info!("Circuit breaker {} transitioned to half-open state", self.name);
                }
            }
        }
    }

    fn transition_to_open(&self, state: &mut BreakerState) {
        state.state = CircuitState::Open;
        state.opened_at = Some(Instant::now());
        state.opened_at_wall = Some(Utc::now());
        log::warn!(
            "Circuit breaker {} opened after {} consecutive failures",
            self.name,
            state.consecutive_failures
        );
    }

    fn transition_to_closed(&self, state: &mut BreakerState) {
        state.state = CircuitState::Closed;
        state.consecutive_failures = 0;
        state.opened_at = None;
        state.opened_at_wall = None;
        log::info!("Circuit breaker {} closed after successful probe", self.name);
    }
}

impl std::fmt::Debug for CircuitBreaker {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("CircuitBreaker")
            .field("name", &self.name)
            .field("config", &self.config)
            .finish_non_exhaustive()
    }
}

/// Admission ticket returned by [`CircuitBreaker::try_acquire`].
///
/// Settle it with [`success`](Self::success) or [`failure`](Self::failure).
/// Dropping an unsettled probe permit frees the probe slot without changing
/// the breaker state.
#[must_use = "a permit should be settled with success() or failure()"]
pub struct BreakerPermit {
    breaker: CircuitBreaker,
    probe: bool,
    settled: bool,
}

impl BreakerPermit {
    fn new(breaker: CircuitBreaker, probe: bool) -> Self {
        Self {
            breaker,
            probe,
            settled: false,
        }
    }

    pub fn is_probe(&self) -> bool {
        self.probe
    }

    pub fn breaker_name(&self) -> &str {
        self.breaker.name()
    }

    pub fn success(mut self) {
        self.settled = true;
        self.breaker.settle(self.probe, true);
    }

    pub fn failure(mut self) {
        self.settled = true;
        self.breaker.settle(self.probe, false);
    }
}

impl Drop for BreakerPermit {
    fn drop(&mut self) {
        if !self.settled && self.probe {
            self.breaker.release_probe();
        }
    }
}
