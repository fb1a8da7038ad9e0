//! Retry policy for failed transformations.
//!
//! A worker consults the stage's policy after each failed attempt; once
//! attempts are exhausted (or the error is not retryable) the task is
//! dropped and the fault reported.

use rand::Rng;
use serde::{Deserialize, Serialize};
use std::time::Duration;

/// Backoff strategy for retry delays.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
pub enum BackoffStrategy {
    /// delay = base * 2^(attempt - 1)
    #[default]
    Exponential,
    /// delay = base * attempt
    Linear,
    /// delay = base (constant)
    Constant,
}

/// Jitter applied on top of the computed backoff delay.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
pub enum JitterStrategy {
    /// No jitter.
    #[default]
    None,
    /// Random from 0 to delay.
    Full,
}

/// Configuration for per-task retry behavior.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RetryPolicy {
    /// Maximum attempts per task, including the first. 1 means no retries.
    pub max_attempts: usize,
    /// Base delay between attempts in milliseconds.
    pub base_delay_ms: u64,
    /// Maximum delay cap in milliseconds.
    pub max_delay_ms: u64,
    /// Backoff strategy.
    pub backoff: BackoffStrategy,
    /// Jitter strategy.
    pub jitter: JitterStrategy,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_attempts: 1,
            base_delay_ms: 50,
            max_delay_ms: 5000,
            backoff: BackoffStrategy::Exponential,
            jitter: JitterStrategy::None,
        }
    }
}

impl RetryPolicy {
    /// Creates the default policy (no retries).
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Sets the maximum attempts per task.
    #[must_use]
    pub fn with_max_attempts(mut self, attempts: usize) -> Self {
        self.max_attempts = attempts.max(1);
        self
    }

    /// Sets the base delay.
    #[must_use]
    pub fn with_base_delay_ms(mut self, delay: u64) -> Self {
        self.base_delay_ms = delay;
        self
    }

    /// Sets the maximum delay cap.
    #[must_use]
    pub fn with_max_delay_ms(mut self, delay: u64) -> Self {
        self.max_delay_ms = delay;
        self
    }

    /// Sets the backoff strategy.
    #[must_use]
    pub fn with_backoff(mut self, strategy: BackoffStrategy) -> Self {
        self.backoff = strategy;
        self
    }

    /// Sets the jitter strategy.
    #[must_use]
    pub fn with_jitter(mut self, strategy: JitterStrategy) -> Self {
        self.jitter = strategy;
        self
    }

    /// Returns true if another attempt is allowed after `attempt` failures.
    #[must_use]
    pub fn allows_retry(&self, attempt: usize) -> bool {
        attempt < self.max_attempts.max(1)
    }

    /// Calculates the delay to wait before the attempt after `attempt`
    /// failed attempts (1-indexed).
    #[must_use]
    pub fn delay_for(&self, attempt: usize) -> Duration {
        let base = self.base_delay_ms;
        let max = self.max_delay_ms;
        let attempt = attempt.max(1);

        let delay = match self.backoff {
            BackoffStrategy::Exponential => {
                let exp = u32::try_from(attempt - 1).unwrap_or(u32::MAX);
                base.saturating_mul(2u64.saturating_pow(exp)).min(max)
            }
            BackoffStrategy::Linear => base.saturating_mul(attempt as u64).min(max),
            BackoffStrategy::Constant => base.min(max),
        };

        let jittered = match self.jitter {
            JitterStrategy::None => delay,
            JitterStrategy::Full => {
                if delay == 0 {
                    0
                } else {
                    rand::thread_rng().gen_range(0..=delay)
                }
            }
        };

        Duration::from_millis(jittered)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_is_no_retry() {
        let policy = RetryPolicy::default();
        assert_eq!(policy.max_attempts, 1);
        assert!(!policy.allows_retry(1));
    }

    #[test]
    fn test_allows_retry_bounded() {
        let policy = RetryPolicy::new().with_max_attempts(3);
        assert!(policy.allows_retry(1));
        assert!(policy.allows_retry(2));
        assert!(!policy.allows_retry(3));
    }

    #[test]
    fn test_exponential_backoff() {
        let policy = RetryPolicy::new()
            .with_max_attempts(5)
            .with_base_delay_ms(100)
            .with_max_delay_ms(350);

        assert_eq!(policy.delay_for(1), Duration::from_millis(100));
        assert_eq!(policy.delay_for(2), Duration::from_millis(200));
        // Capped.
        assert_eq!(policy.delay_for(3), Duration::from_millis(350));
    }

    #[test]
    fn test_linear_backoff() {
        let policy = RetryPolicy::new()
            .with_backoff(BackoffStrategy::Linear)
            .with_base_delay_ms(10)
            .with_max_delay_ms(1000);

        assert_eq!(policy.delay_for(1), Duration::from_millis(10));
        assert_eq!(policy.delay_for(3), Duration::from_millis(30));
    }

    #[test]
    fn test_constant_backoff() {
        let policy = RetryPolicy::new()
            .with_backoff(BackoffStrategy::Constant)
            .with_base_delay_ms(25);

        assert_eq!(policy.delay_for(1), Duration::from_millis(25));
        assert_eq!(policy.delay_for(9), Duration::from_millis(25));
    }

    #[test]
    fn test_full_jitter_bounded_by_delay() {
        let policy = RetryPolicy::new()
            .with_backoff(BackoffStrategy::Constant)
            .with_base_delay_ms(50)
            .with_jitter(JitterStrategy::Full);

        for _ in 0..20 {
            assert!(policy.delay_for(1) <= Duration::from_millis(50));
        }
    }

    #[test]
    fn test_zero_attempts_clamped() {
        let policy = RetryPolicy::new().with_max_attempts(0);
        assert_eq!(policy.max_attempts, 1);
    }
}
