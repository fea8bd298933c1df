//! Category x severity -> recovery strategy table

use pitboss_core::{
    ErrorCategory, ErrorReason, ErrorRecord, RecoveryStrategy, Severity, StrategyOverride,
};

/// Resolves the recovery strategy for a classified failure.
///
/// Configured overrides are consulted first, in order. The built-in table
/// follows; the first matching row wins:
///
/// | condition                                   | strategy          |
/// |---------------------------------------------|-------------------|
/// | critical and attempt > 2                    | `abandon`         |
/// | `system_error`                              | `abandon`         |
/// | critical `resource_error` / `initialization_error` | `circuit_break` |
/// | `resource_error` / `worker_error`           | `failover`        |
/// | `connection_error` / `timeout_error` / `health_check_error` | `backoff_retry` |
/// | `communication_error` / `session_error`     | `immediate_retry` |
/// | `initialization_error` (non-critical)       | `backoff_retry`   |
#[derive(Debug, Clone, Default)]
pub struct StrategySelector {
    overrides: Vec<StrategyOverride>,
}

impl StrategySelector {
    pub fn new(overrides: Vec<StrategyOverride>) -> Self {
        Self { overrides }
    }

    pub fn select(&self, record: &ErrorRecord) -> RecoveryStrategy {
        self.select_for(record.category, record.severity, record.context.attempt)
    }

    pub fn select_for(
        &self,
        category: ErrorCategory,
        severity: Severity,
        attempt: u32,
    ) -> RecoveryStrategy {
        if let Some(rule) = self
            .overrides
            .iter()
            .find(|rule| rule.matches(category, severity))
        {
            return rule.strategy;
        }

        Self::default_strategy(category, severity, attempt)
    }

    fn default_strategy(category: ErrorCategory, severity: Severity, attempt: u32) -> RecoveryStrategy {
        use ErrorCategory::*;

        let critical = severity == Severity::Critical;

        match category {
            _ if critical && attempt > 2 => RecoveryStrategy::Abandon,
            System => RecoveryStrategy::Abandon,
            Resource | Initialization if critical => RecoveryStrategy::CircuitBreak,
            Resource | Worker => RecoveryStrategy::Failover,
            Connection | Timeout | HealthCheck => RecoveryStrategy::BackoffRetry,
            Communication | Session => RecoveryStrategy::ImmediateRetry,
            Initialization => RecoveryStrategy::BackoffRetry,
        }
    }

    /// Strategy reported on errors that are surfaced without any recovery
    pub fn synchronous_strategy(reason: ErrorReason) -> RecoveryStrategy {
        match reason {
            ErrorReason::CircuitOpen => RecoveryStrategy::CircuitBreak,
            _ => RecoveryStrategy::Abandon,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use ErrorCategory::*;
    use RecoveryStrategy::*;
    use Severity::*;

    #[test]
    fn test_default_table() {
        let selector = StrategySelector::default();
        let cases = [
            (Resource, Critical, 1, CircuitBreak),
            (Initialization, Critical, 1, CircuitBreak),
            (Resource, Major, 1, Failover),
            (Worker, Major, 1, Failover),
            (Connection, Major, 1, BackoffRetry),
            (Timeout, Major, 2, BackoffRetry),
            (HealthCheck, Minor, 1, BackoffRetry),
            (Communication, Major, 1, ImmediateRetry),
            (Session, Minor, 1, ImmediateRetry),
            (Initialization, Major, 1, BackoffRetry),
            (System, Major, 1, Abandon),
            (System, Minor, 1, Abandon),
        ];

        for (category, severity, attempt, expected) in cases {
            assert_eq!(
                selector.select_for(category, severity, attempt),
                expected,
                "{} {} attempt {}",
                category,
                severity,
                attempt
            );
        }
    }

    #[test]
    fn test_late_critical_attempts_abandon() {
        let selector = StrategySelector::default();
        assert_eq!(selector.select_for(Connection, Critical, 2), BackoffRetry);
        assert_eq!(selector.select_for(Connection, Critical, 3), Abandon);
        assert_eq!(selector.select_for(Resource, Critical, 3), Abandon);
        assert_eq!(selector.select_for(Connection, Major, 9), BackoffRetry);
    }

    #[test]
    fn test_overrides_take_precedence() {
        let selector = StrategySelector::new(vec![
            StrategyOverride {
                category: Worker,
                severity: Some(Critical),
                strategy: Abandon,
            },
            StrategyOverride {
                category: Timeout,
                severity: None,
                strategy: ImmediateRetry,
            },
        ]);

        assert_eq!(selector.select_for(Worker, Critical, 1), Abandon);
        assert_eq!(selector.select_for(Worker, Major, 1), Failover);
        assert_eq!(selector.select_for(Timeout, Critical, 5), ImmediateRetry);
    }

    #[test]
    fn test_synchronous_strategy() {
        assert_eq!(
            StrategySelector::synchronous_strategy(ErrorReason::CircuitOpen),
            CircuitBreak
        );
        assert_eq!(
            StrategySelector::synchronous_strategy(ErrorReason::QueueFull),
            Abandon
        );
    }
}
