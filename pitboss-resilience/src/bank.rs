//! Named breakers guarding the pool's failure classes

use pitboss_core::ErrorCategory;
use std::collections::HashMap;

use crate::circuit_breaker::{
    BreakerPermit, BreakerRejection, BreakerSnapshot, CircuitBreaker, CircuitBreakerConfig,
};

/// Trips on repeated `connection_error`s
pub const POOL_CONNECTIONS: &str = "pool_connections";
/// Trips on repeated `resource_error`s
pub const POOL_RESOURCES: &str = "pool_resources";
/// Trips on repeated worker start failures
pub const WORKER_INITIALIZATION: &str = "worker_initialization";

const BREAKER_NAMES: [&str; 3] = [POOL_CONNECTIONS, POOL_RESOURCES, WORKER_INITIALIZATION];

/// Fixed set of independent breakers, one per guarded failure class
#[derive(Debug, Clone)]
pub struct CircuitBreakerBank {
    breakers: HashMap<&'static str, CircuitBreaker>,
}

impl CircuitBreakerBank {
    /// Build the bank; `overrides` replaces the default configuration for the
    /// named breakers.
    pub fn new(
        default_config: CircuitBreakerConfig,
        overrides: &HashMap<String, CircuitBreakerConfig>,
    ) -> Self {
        let breakers = BREAKER_NAMES
            .iter()
            .map(|&name| {
                let config = overrides
                    .get(name)
                    .cloned()
                    .unwrap_or_else(|| default_config.clone());
                (name, CircuitBreaker::new(name, config))
            })
            .collect();

        Self { breakers }
    }

    pub fn with_defaults() -> Self {
        Self::new(CircuitBreakerConfig::default(), &HashMap::new())
    }

    pub fn get(&self, name: &str) -> Option<&CircuitBreaker> {
        self.breakers.get(name)
    }

    /// Breaker whose failure count a failure of `category` feeds
    pub fn breaker_for(&self, category: ErrorCategory) -> Option<&CircuitBreaker> {
        let name = match category {
            ErrorCategory::Connection => POOL_CONNECTIONS,
            ErrorCategory::Resource => POOL_RESOURCES,
            ErrorCategory::Initialization => WORKER_INITIALIZATION,
            _ => return None,
        };
        self.breakers.get(name)
    }

    pub fn worker_initialization(&self) -> Option<&CircuitBreaker> {
        self.breakers.get(WORKER_INITIALIZATION)
    }

    /// Admission check made before a request is allowed near a worker
    pub fn admit_dispatch(&self) -> Result<DispatchPermits, BreakerRejection> {
        let mut permits = Vec::with_capacity(2);
        for name in [POOL_CONNECTIONS, POOL_RESOURCES] {
            if let Some(breaker) = self.breakers.get(name) {
                permits.push((name, breaker.try_acquire()?));
            }
        }
        Ok(DispatchPermits { permits })
    }

    /// Snapshots ordered by breaker name
    pub fn snapshots(&self) -> Vec<BreakerSnapshot> {
        let mut snapshots: Vec<_> = self.breakers.values().map(|b| b.snapshot()).collect();
        snapshots.sort_by(|a, b| a.name.cmp(&b.name));
        snapshots
    }
}

/// Permits held by one dispatched call
pub struct DispatchPermits {
    permits: Vec<(&'static str, BreakerPermit)>,
}

impl DispatchPermits {
    /// The call succeeded: every guarded class saw a success
    pub fn success(self) {
        for (_, permit) in self.permits {
            permit.success();
        }
    }

    /// The call failed with `category`. Only the breaker guarding that class
    /// counts a failure; the others are released untouched.
    pub fn failure(self, category: ErrorCategory) {
        let target = match category {
            ErrorCategory::Connection => Some(POOL_CONNECTIONS),
            ErrorCategory::Resource => Some(POOL_RESOURCES),
            _ => None,
        };

        for (name, permit) in self.permits {
            if Some(name) == target {
                permit.failure();
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::circuit_breaker::CircuitState;
    use std::time::Duration;

    fn bank(threshold: u32) -> CircuitBreakerBank {
        let mut overrides = HashMap::new();
        overrides.insert(
            WORKER_INITIALIZATION.to_string(),
            CircuitBreakerConfig {
                failure_threshold: 1,
                cooldown: Duration::from_secs(5),
            },
        );
        CircuitBreakerBank::new(
            CircuitBreakerConfig {
                failure_threshold: threshold,
                cooldown: Duration::from_secs(10),
            },
            &overrides,
        )
    }

    #[tokio::test(start_paused = true)]
    async fn test_breakers_are_independent() {
        let bank = bank(2);

        for _ in 0..2 {
            bank.admit_dispatch().unwrap().failure(ErrorCategory::Resource);
        }

        assert_eq!(bank.get(POOL_RESOURCES).unwrap().state(), CircuitState::Open);
        assert_eq!(bank.get(POOL_CONNECTIONS).unwrap().state(), CircuitState::Closed);

        let rejection = bank.admit_dispatch().err().unwrap();
        assert_eq!(rejection.breaker, POOL_RESOURCES);
    }

    #[tokio::test(start_paused = true)]
    async fn test_unguarded_failures_do_not_count() {
        let bank = bank(1);
        bank.admit_dispatch().unwrap().failure(ErrorCategory::Worker);
        bank.admit_dispatch().unwrap().failure(ErrorCategory::Timeout);
        assert!(bank.admit_dispatch().is_ok());
    }

    #[tokio::test(start_paused = true)]
    async fn test_rejected_dispatch_releases_probe() {
        let bank = bank(1);
        bank.admit_dispatch().unwrap().failure(ErrorCategory::Connection);
        bank.admit_dispatch().err().unwrap();

        tokio::time::advance(Duration::from_secs(10)).await;
        let permits = bank.admit_dispatch().unwrap();
        permits.success();
        assert_eq!(bank.get(POOL_CONNECTIONS).unwrap().state(), CircuitState::Closed);
    }

    #[test]
    fn test_category_mapping_and_overrides() {
        let bank = bank(5);
        assert_eq!(
            bank.breaker_for(ErrorCategory::Connection).unwrap().name(),
            POOL_CONNECTIONS
        );
        assert_eq!(
            bank.breaker_for(ErrorCategory::Initialization).unwrap().name(),
            WORKER_INITIALIZATION
        );
        assert!(bank.breaker_for(ErrorCategory::Session).is_none());
        assert_eq!(
            bank.worker_initialization().unwrap().config().failure_threshold,
            1
        );

        let names: Vec<_> = bank.snapshots().into_iter().map(|s| s.name).collect();
        assert_eq!(names, vec![POOL_CONNECTIONS, POOL_RESOURCES, WORKER_INITIALIZATION]);
    }
}
