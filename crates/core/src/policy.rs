//! Submission behavior and retry/backoff policy.

use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::error::QueueError;

/// How the submitting caller observes an operation.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Behavior {
    /// Caller is resolved immediately with the virtual response; later
    /// outcomes surface only through the Event Hub and fallback handlers.
    Silent,
    /// Caller waits for the real result (or final failure).
    Queued,
}

impl Behavior {
    pub fn as_str(&self) -> &'static str {
        match self {
            Behavior::Silent => "silent",
            Behavior::Queued => "queued",
        }
    }
}

impl Default for Behavior {
    fn default() -> Self {
        Self::Queued
    }
}

/// Backoff strategy for retries.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum BackoffStrategy {
    /// Fixed delay between retries
    Fixed,
    /// Exponential backoff: base * multiplier^(attempt - 1)
    Exponential,
}

impl Default for BackoffStrategy {
    fn default() -> Self {
        Self::Exponential
    }
}

/// Delay policy between attempts.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Backoff {
    pub strategy: BackoffStrategy,
    pub base_delay: Duration,
    /// Ignored by `Fixed`.
    pub multiplier: f64,
}

impl Default for Backoff {
    fn default() -> Self {
        Self {
            strategy: BackoffStrategy::Exponential,
            base_delay: Duration::from_secs(1),
            multiplier: 2.0,
        }
    }
}

/// Retry policy configuration.
///
/// `max_attempts` counts every send, the first one included.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RetryPolicy {
    pub max_attempts: u32,
    pub backoff: Backoff,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_attempts: 3,
            backoff: Backoff::default(),
        }
    }
}

impl RetryPolicy {
    /// A single attempt, no retries.
    pub fn no_retry() -> Self {
        Self {
            max_attempts: 1,
            ..Default::default()
        }
    }

    /// Create a policy with fixed delays.
    pub fn fixed(max_attempts: u32, delay: Duration) -> Self {
        Self {
            max_attempts,
            backoff: Backoff {
                strategy: BackoffStrategy::Fixed,
                base_delay: delay,
                multiplier: 1.0,
            },
        }
    }

    /// Create a policy with exponential backoff.
    pub fn exponential(max_attempts: u32, base_delay: Duration, multiplier: f64) -> Self {
        Self {
            max_attempts,
            backoff: Backoff {
                strategy: BackoffStrategy::Exponential,
                base_delay,
                multiplier,
            },
        }
    }

    pub fn validate(&self) -> Result<(), QueueError> {
        if self.max_attempts == 0 {
            return Err(QueueError::invalid_config("max_attempts must be at least 1"));
        }
        let m = self.backoff.multiplier;
        if self.backoff.strategy == BackoffStrategy::Exponential && !(m.is_finite() && m > 0.0) {
            return Err(QueueError::invalid_config(format!(
                "backoff multiplier must be a positive finite number, got {m}"
            )));
        }
        Ok(())
    }

    /// Delay before the next attempt, given how many attempts have failed so far.
    pub fn delay_for_attempt(&self, attempt_count: u32) -> Duration {
        if attempt_count == 0 {
            return Duration::ZERO;
        }

        let base = self.backoff.base_delay;
        match self.backoff.strategy {
            BackoffStrategy::Fixed => base,
            BackoffStrategy::Exponential => {
                let exp = self.backoff.multiplier.powi((attempt_count - 1) as i32);
                Duration::try_from_secs_f64(base.as_secs_f64() * exp).unwrap_or(Duration::MAX)
            }
        }
    }

    /// Check if another attempt is allowed.
    pub fn should_retry(&self, attempt_count: u32) -> bool {
        attempt_count < self.max_attempts
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;

    #[test]
    fn exponential_backoff_calculates_correctly() {
        let policy = RetryPolicy::exponential(3, Duration::from_secs(1), 2.0);

        assert_eq!(policy.delay_for_attempt(1), Duration::from_secs(1));
        assert_eq!(policy.delay_for_attempt(2), Duration::from_secs(2));
        assert!(policy.should_retry(2));
        assert!(!policy.should_retry(3));
    }

    #[test]
    fn fixed_backoff_is_constant() {
        let policy = RetryPolicy::fixed(3, Duration::from_millis(500));

        assert_eq!(policy.delay_for_attempt(1), Duration::from_millis(500));
        assert_eq!(policy.delay_for_attempt(2), Duration::from_millis(500));
        assert_eq!(policy.delay_for_attempt(3), Duration::from_millis(500));
    }

    #[test]
    fn zero_attempts_is_invalid() {
        let policy = RetryPolicy {
            max_attempts: 0,
            ..Default::default()
        };
        assert!(matches!(policy.validate(), Err(QueueError::InvalidConfig(_))));
    }

    #[test]
    fn nan_multiplier_is_invalid() {
        let policy = RetryPolicy::exponential(2, Duration::from_secs(1), f64::NAN);
        assert!(policy.validate().is_err());
    }

    #[test]
    fn huge_exponent_saturates() {
        let policy = RetryPolicy::exponential(u32::MAX, Duration::from_secs(1), 10.0);
        assert_eq!(policy.delay_for_attempt(400), Duration::MAX);
    }

    proptest! {
        #[test]
        fn exponential_delays_never_decrease(base_ms in 1u64..5_000, mult in 1.0f64..4.0, n in 1u32..20) {
            let policy = RetryPolicy::exponential(32, Duration::from_millis(base_ms), mult);
            prop_assert!(policy.delay_for_attempt(n + 1) >= policy.delay_for_attempt(n));
        }
    }
}
