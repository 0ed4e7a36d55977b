//! Reconnect backoff.

use crate::config::EngineConfig;
use std::time::Duration;

/// Exponential reconnect policy: the base delay doubles per attempt up to a cap.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ReconnectPolicy {
    /// Delay before the first attempt
    pub base: Duration,
    /// Upper bound on any single delay
    pub cap: Duration,
    /// Attempts before the engine gives up (0 = unlimited)
    pub max_attempts: u32,
}

impl Default for ReconnectPolicy {
    fn default() -> Self {
        Self {
            base: Duration::from_millis(500),
            cap: Duration::from_secs(30),
            max_attempts: 8,
        }
    }
}

impl ReconnectPolicy {
    pub fn from_config(config: &EngineConfig) -> Self {
        Self {
            base: Duration::from_millis(config.reconnect_base_ms),
            cap: Duration::from_millis(config.reconnect_cap_ms),
            max_attempts: config.reconnect_max_attempts,
        }
    }

    /// Delay before 1-based `attempt`.
    #[must_use]
    pub fn delay_for_attempt(&self, attempt: u32) -> Duration {
        let exponent = attempt.saturating_sub(1).min(31);
        self.base
            .checked_mul(1u32 << exponent)
            .unwrap_or(self.cap)
            .min(self.cap)
    }

    /// Whether 1-based `attempt` may still run.
    #[must_use]
    pub fn should_retry(&self, attempt: u32) -> bool {
        self.max_attempts == 0 || attempt <= self.max_attempts
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_delay_doubles_then_caps() {
        let policy = ReconnectPolicy {
            base: Duration::from_secs(1),
            cap: Duration::from_secs(10),
            max_attempts: 0,
        };
        assert_eq!(policy.delay_for_attempt(1), Duration::from_secs(1));
        assert_eq!(policy.delay_for_attempt(2), Duration::from_secs(2));
        assert_eq!(policy.delay_for_attempt(3), Duration::from_secs(4));
        assert_eq!(policy.delay_for_attempt(4), Duration::from_secs(8));
        assert_eq!(policy.delay_for_attempt(5), Duration::from_secs(10));
        assert_eq!(policy.delay_for_attempt(60), Duration::from_secs(10));
    }

    #[test]
    fn test_should_retry() {
        let policy = ReconnectPolicy {
            max_attempts: 3,
            ..Default::default()
        };
        assert!(policy.should_retry(1));
        assert!(policy.should_retry(3));
        assert!(!policy.should_retry(4));

        let unlimited = ReconnectPolicy {
            max_attempts: 0,
            ..Default::default()
        };
        assert!(unlimited.should_retry(10_000));
    }
}
