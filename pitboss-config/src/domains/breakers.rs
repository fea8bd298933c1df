//! Circuit breaker configuration

use crate::error::ConfigResult;
use crate::validation::{validate_duration, validate_enum_choice, validate_positive, Validatable};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::time::Duration;

/// Names of the breakers the pool maintains
pub const BREAKER_NAMES: [&str; 3] = ["pool_connections", "pool_resources", "worker_initialization"];

/// Circuit breaker thresholds, shared by every breaker unless overridden
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct CircuitBreakerSettings {
    /// Consecutive failures that open a breaker
    pub failure_threshold: u32,

    /// Time an open breaker waits before admitting a probe
    #[serde(with = "humantime_serde")]
    pub cooldown: Duration,

    /// Per-breaker replacements keyed by breaker name
    pub overrides: HashMap<String, BreakerOverride>,
}

/// Partial settings for one named breaker
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct BreakerOverride {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub failure_threshold: Option<u32>,

    #[serde(with = "humantime_serde", skip_serializing_if = "Option::is_none")]
    pub cooldown: Option<Duration>,
}

impl CircuitBreakerSettings {
    /// Effective `(failure_threshold, cooldown)` for a breaker
    pub fn resolve(&self, name: &str) -> (u32, Duration) {
        let entry = self
            .overrides
            .iter()
            .find(|(key, _)| key.eq_ignore_ascii_case(name))
            .map(|(_, value)| value);

        match entry {
            Some(o) => (
                o.failure_threshold.unwrap_or(self.failure_threshold),
                o.cooldown.unwrap_or(self.cooldown),
            ),
            None => (self.failure_threshold, self.cooldown),
        }
    }
}

impl Default for CircuitBreakerSettings {
    fn default() -> Self {
        Self {
            failure_threshold: 5,
            cooldown: Duration::from_secs(30),
            overrides: HashMap::new(),
        }
    }
}

impl Validatable for CircuitBreakerSettings {
    fn validate(&self) -> ConfigResult<()> {
        validate_positive(self.failure_threshold, "failure_threshold", self.domain_name())?;
        validate_duration(self.cooldown, "cooldown", self.domain_name())?;

        for (name, entry) in &self.overrides {
            validate_enum_choice(name, &BREAKER_NAMES, "override name", self.domain_name())?;
            if let Some(threshold) = entry.failure_threshold {
                validate_positive(threshold, "failure_threshold", self.domain_name())?;
            }
            if let Some(cooldown) = entry.cooldown {
                validate_duration(cooldown, "cooldown", self.domain_name())?;
            }
        }

        Ok(())
    }

    fn domain_name(&self) -> &'static str {
        "circuit_breakers"
    }
}
