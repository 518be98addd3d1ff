//! Retry policy applied by the engine to failed activity attempts.

use crate::error::ActivityError;
use serde::{Deserialize, Serialize};
use std::time::Duration;

/// Bounded exponential backoff.
///
/// Attempts are 1-based: attempt 1 is the first execution. The delay before
/// attempt `n + 1` is `initial_interval * backoff_coefficient^(n - 1)`,
/// capped at `maximum_interval`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RetryPolicy {
    pub initial_interval: Duration,
    pub backoff_coefficient: f64,
    pub maximum_interval: Duration,
    /// Total attempts allowed, including the first. `0` means unlimited.
    pub maximum_attempts: u32,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            initial_interval: Duration::from_secs(1),
            backoff_coefficient: 2.0,
            maximum_interval: Duration::from_secs(60),
            maximum_attempts: 3,
        }
    }
}

impl RetryPolicy {
    /// A policy that never runs an activity twice.
    pub fn no_retry() -> Self {
        Self {
            maximum_attempts: 1,
            ..Self::default()
        }
    }

    #[must_use]
    pub fn with_maximum_attempts(mut self, attempts: u32) -> Self {
        self.maximum_attempts = attempts;
        self
    }

    #[must_use]
    pub fn with_initial_interval(mut self, interval: Duration) -> Self {
        self.initial_interval = interval;
        self
    }

    /// Whether `attempt` (the one that just failed with `error`) may be
    /// followed by another.
    pub fn should_retry(&self, error: &ActivityError, attempt: u32) -> bool {
        error.is_retryable() && (self.maximum_attempts == 0 || attempt < self.maximum_attempts)
    }

    /// Delay before the attempt following `attempt`.
    pub fn backoff(&self, attempt: u32) -> Duration {
        let exponent = attempt.saturating_sub(1).min(32) as i32;
        let factor = self.backoff_coefficient.max(1.0).powi(exponent);
        let delay = self.initial_interval.as_secs_f64() * factor;
        if !delay.is_finite() || delay >= self.maximum_interval.as_secs_f64() {
            self.maximum_interval
        } else {
            Duration::from_secs_f64(delay)
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn backoff_grows_and_caps() {
        let policy = RetryPolicy {
            initial_interval: Duration::from_secs(1),
            backoff_coefficient: 2.0,
            maximum_interval: Duration::from_secs(5),
            maximum_attempts: 10,
        };
        assert_eq!(policy.backoff(1), Duration::from_secs(1));
        assert_eq!(policy.backoff(2), Duration::from_secs(2));
        assert_eq!(policy.backoff(3), Duration::from_secs(4));
        assert_eq!(policy.backoff(4), Duration::from_secs(5));
        assert_eq!(policy.backoff(40), Duration::from_secs(5));
    }

    #[test]
    fn attempts_are_bounded() {
        let policy = RetryPolicy::default();
        let transient = ActivityError::Download("HTTP 503".into());
        assert!(policy.should_retry(&transient, 1));
        assert!(policy.should_retry(&transient, 2));
        assert!(!policy.should_retry(&transient, 3));
    }

    #[test]
    fn non_retryable_kinds_stop_immediately() {
        let policy = RetryPolicy::default().with_maximum_attempts(0);
        assert!(!policy.should_retry(&ActivityError::Validation("empty".into()), 1));
        assert!(policy.should_retry(&ActivityError::Timeout("10s".into()), 100));
    }

    #[test]
    fn no_retry_allows_a_single_attempt() {
        let policy = RetryPolicy::no_retry();
        assert!(!policy.should_retry(&ActivityError::Computation("fault".into()), 1));
    }
}
