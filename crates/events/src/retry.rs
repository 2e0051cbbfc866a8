//! Retry policy and backoff computation.

use std::time::Duration;

use serde::{Deserialize, Serialize};

/// Backoff strategy for retries.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum BackoffStrategy {
    /// Same delay before every retry
    Fixed,
    /// `base * 2^retry_count`
    #[default]
    Exponential,
}

/// Retry policy configuration.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RetryPolicy {
    /// Maximum number of retries after the first attempt (0 = no retries)
    pub max_attempts: u32,
    /// Delay before the first retry
    pub base_delay: Duration,
    /// Upper bound for any single delay
    pub max_delay: Duration,
    /// Backoff strategy
    pub strategy: BackoffStrategy,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_attempts: 3,
            base_delay: Duration::from_secs(1),
            max_delay: Duration::from_secs(300),
            strategy: BackoffStrategy::Exponential,
        }
    }
}

impl RetryPolicy {
    /// Create a policy with no retries.
    pub fn no_retry() -> Self {
        Self {
            max_attempts: 0,
            ..Default::default()
        }
    }

    /// Create a policy with fixed delays.
    pub fn fixed(max_attempts: u32, delay: Duration) -> Self {
        Self {
            max_attempts,
            base_delay: delay,
            max_delay: delay,
            strategy: BackoffStrategy::Fixed,
        }
    }

    /// Create a policy with exponential backoff.
    pub fn exponential(max_attempts: u32, base_delay: Duration, max_delay: Duration) -> Self {
        Self {
            max_attempts,
            base_delay,
            max_delay,
            strategy: BackoffStrategy::Exponential,
        }
    }

    /// Delay to wait before the retry that follows `retry_count` earlier retries.
    ///
    /// `retry_count` is zero-based: the first retry waits `base_delay`, the second
    /// `2 * base_delay` and so on, never exceeding `max_delay`.
    pub fn delay_for_retry(&self, retry_count: u32) -> Duration {
        let base_ms = self.base_delay.as_millis();
        let max_ms = self.max_delay.as_millis().max(base_ms);

        let delay_ms = match self.strategy {
            BackoffStrategy::Fixed => base_ms,
            BackoffStrategy::Exponential => base_ms
                .saturating_mul(2u128.saturating_pow(retry_count))
                .min(max_ms),
        };

        Duration::from_millis(u64::try_from(delay_ms).unwrap_or(u64::MAX))
    }

    /// Check if another retry is allowed after `retry_count` retries.
    pub fn should_retry(&self, retry_count: u32) -> bool {
        retry_count < self.max_attempts
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;

    #[test]
    fn exponential_backoff_doubles_from_base() {
        let policy =
            RetryPolicy::exponential(3, Duration::from_millis(1000), Duration::from_secs(60));

        assert_eq!(policy.delay_for_retry(0), Duration::from_millis(1000));
        assert_eq!(policy.delay_for_retry(1), Duration::from_millis(2000));
        assert_eq!(policy.delay_for_retry(2), Duration::from_millis(4000));
    }

    #[test]
    fn exponential_backoff_is_capped() {
        let policy =
            RetryPolicy::exponential(20, Duration::from_millis(100), Duration::from_millis(1500));

        assert_eq!(policy.delay_for_retry(3), Duration::from_millis(800));
        assert_eq!(policy.delay_for_retry(4), Duration::from_millis(1500));
        assert_eq!(policy.delay_for_retry(200), Duration::from_millis(1500));
    }

    #[test]
    fn fixed_backoff_is_constant() {
        let policy = RetryPolicy::fixed(3, Duration::from_millis(500));

        assert_eq!(policy.delay_for_retry(0), Duration::from_millis(500));
        assert_eq!(policy.delay_for_retry(1), Duration::from_millis(500));
        assert_eq!(policy.delay_for_retry(7), Duration::from_millis(500));
    }

    #[test]
    fn should_retry_respects_max_attempts() {
        let policy = RetryPolicy {
            max_attempts: 3,
            ..Default::default()
        };

        assert!(policy.should_retry(0));
        assert!(policy.should_retry(2));
        assert!(!policy.should_retry(3));
        assert!(!RetryPolicy::no_retry().should_retry(0));
    }

    proptest! {
        #![proptest_config(ProptestConfig {
            cases: 256,
            ..ProptestConfig::default()
        })]

        /// Property: exponential delays strictly increase until they hit the cap,
        /// and never exceed it.
        #[test]
        fn exponential_backoff_is_monotonic_and_bounded(
            base_ms in 1u64..10_000,
            max_ms in 1u64..3_600_000,
            retry_count in 0u32..64,
        ) {
            let policy = RetryPolicy::exponential(
                u32::MAX,
                Duration::from_millis(base_ms),
                Duration::from_millis(max_ms),
            );
            let cap = Duration::from_millis(max_ms.max(base_ms));

            let current = policy.delay_for_retry(retry_count);
            let next = policy.delay_for_retry(retry_count + 1);

            prop_assert!(current <= cap);
            prop_assert!(next <= cap);
            if next < cap {
                prop_assert!(current < next);
            } else {
                prop_assert!(current <= next);
            }
        }
    }
}
