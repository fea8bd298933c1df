//! Recovery orchestration configuration

use crate::error::ConfigResult;
use crate::validation::{validate_positive, Validatable};
use pitboss_core::StrategyOverride;
use serde::{Deserialize, Serialize};
use std::time::Duration;

/// Recovery orchestration configuration
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct RecoveryConfig {
    /// Recoveries allowed to run at once; further ones are rejected
    pub max_concurrent_recoveries: usize,

    /// Finished recoveries kept for status queries
    pub history_limit: usize,

    pub immediate_retry: RetryTableConfig,

    pub backoff_retry: RetryTableConfig,

    /// Add +/-20% jitter to retry delays
    #[serde(default = "crate::domains::utils::default_false")]
    pub jitter: bool,

    /// Consulted before the built-in strategy table, first match wins
    pub strategy_overrides: Vec<StrategyOverride>,
}

/// Attempt budget and delay sequence of one retrying strategy
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RetryTableConfig {
    pub max_attempts: u32,

    /// Delay before retry k; retries past the end reuse the last entry
    #[serde(with = "crate::domains::utils::serde_duration_list")]
    pub delays: Vec<Duration>,
}

impl RetryTableConfig {
    pub fn immediate() -> Self {
        Self {
            max_attempts: 3,
            delays: vec![
                Duration::ZERO,
                Duration::from_millis(100),
                Duration::from_millis(200),
            ],
        }
    }

    pub fn backoff() -> Self {
        Self {
            max_attempts: 5,
            delays: [1, 2, 4, 8, 16].into_iter().map(Duration::from_secs).collect(),
        }
    }

    fn validate_in(&self, field: &str, domain: &str) -> ConfigResult<()> {
        validate_positive(self.max_attempts, &format!("{}.max_attempts", field), domain)?;
        if self.delays.is_empty() {
            return Err(crate::ConfigError::DomainError {
                domain: domain.to_string(),
                message: format!("{}.delays cannot be empty", field),
            });
        }
        Ok(())
    }
}

impl Default for RecoveryConfig {
    fn default() -> Self {
        Self {
            max_concurrent_recoveries: 10,
            history_limit: 100,
            immediate_retry: RetryTableConfig::immediate(),
            backoff_retry: RetryTableConfig::backoff(),
            jitter: false,
            strategy_overrides: Vec::new(),
        }
    }
}

impl Validatable for RecoveryConfig {
    fn validate(&self) -> ConfigResult<()> {
        validate_positive(
            self.max_concurrent_recoveries,
            "max_concurrent_recoveries",
            self.domain_name(),
        )?;
        self.immediate_retry
            .validate_in("immediate_retry", self.domain_name())?;
        self.backoff_retry
            .validate_in("backoff_retry", self.domain_name())?;
        Ok(())
    }

    fn domain_name(&self) -> &'static str {
        "recovery"
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use pitboss_core::{ErrorCategory, RecoveryStrategy, Severity};

    #[test]
    fn test_recovery_defaults_match_tables() {
        let config = RecoveryConfig::default();
        assert_eq!(config.immediate_retry.max_attempts, 3);
        assert_eq!(config.immediate_retry.delays[2], Duration::from_millis(200));
        assert_eq!(config.backoff_retry.delays.last(), Some(&Duration::from_secs(16)));
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_recovery_yaml() {
        let yaml = r#"
max_concurrent_recoveries: 3
backoff_retry:
  max_attempts: 2
  delays: [250ms, 1s]
strategy_overrides:
  - category: worker_error
    severity: critical
    strategy: abandon
"#;
        let config: RecoveryConfig = serde_yaml::from_str(yaml).unwrap();
        assert_eq!(config.max_concurrent_recoveries, 3);
        assert_eq!(
            config.backoff_retry.delays,
            vec![Duration::from_millis(250), Duration::from_secs(1)]
        );
        assert_eq!(config.immediate_retry, RetryTableConfig::immediate());
        assert_eq!(config.strategy_overrides.len(), 1);
        assert_eq!(config.strategy_overrides[0].category, ErrorCategory::Worker);
        assert_eq!(config.strategy_overrides[0].severity, Some(Severity::Critical));
        assert_eq!(config.strategy_overrides[0].strategy, RecoveryStrategy::Abandon);
    }

    #[test]
    fn test_empty_delays_rejected() {
        let mut config = RecoveryConfig::default();
        config.immediate_retry.delays.clear();
        let err = config.validate().unwrap_err();
        assert!(err.to_string().contains("immediate_retry.delays"));
    }
}
