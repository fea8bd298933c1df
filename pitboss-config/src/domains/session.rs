//! Session affinity configuration

use crate::error::ConfigResult;
use crate::validation::{validate_duration, Validatable};
use serde::{Deserialize, Serialize};
use std::time::Duration;

/// Session affinity configuration
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct SessionConfig {
    /// Idle time after which a session binding is forgotten
    #[serde(with = "humantime_serde")]
    pub ttl: Duration,

    /// Interval of the background sweep for expired bindings
    #[serde(with = "humantime_serde")]
    pub sweep_interval: Duration,
}

impl Default for SessionConfig {
    fn default() -> Self {
        Self {
            ttl: Duration::from_secs(3600),
            sweep_interval: Duration::from_secs(60),
        }
    }
}

impl Validatable for SessionConfig {
    fn validate(&self) -> ConfigResult<()> {
        validate_duration(self.ttl, "ttl", self.domain_name())?;
        validate_duration(self.sweep_interval, "sweep_interval", self.domain_name())
    }

    fn domain_name(&self) -> &'static str {
        "session"
    }
}
