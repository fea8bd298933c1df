//! Domain-specific configuration modules

pub mod breakers;
pub mod logging;
pub mod pool;
pub mod recovery;
pub mod session;
pub mod utils;

use crate::error::ConfigResult;
use crate::validation::Validatable;
use serde::{Deserialize, Serialize};

/// Main Pitboss configuration combining all domains
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, Default)]
#[serde(default)]
pub struct PitbossConfig {
    /// Worker processes, queueing and timeouts
    pub pool: pool::PoolConfig,

    /// Session affinity
    pub session: session::SessionConfig,

    /// Recovery strategies and their retry tables
    pub recovery: recovery::RecoveryConfig,

    /// Circuit breaker thresholds
    pub circuit_breakers: breakers::CircuitBreakerSettings,

    /// Logging configuration
    pub logging: logging::LoggingConfig,
}

impl PitbossConfig {
    /// Validate all domain configurations
    pub fn validate_all(&self) -> ConfigResult<()> {
        self.pool.validate()?;
        self.session.validate()?;
        self.recovery.validate()?;
        self.circuit_breakers.validate()?;
        self.logging.validate()?;
        Ok(())
    }

    /// Generate a sample configuration file
    pub fn generate_sample() -> String {
        let config = PitbossConfig::default();
        serde_yaml::to_string(&config)
            .unwrap_or_else(|_| "# Failed to generate sample config".to_string())
    }
}
