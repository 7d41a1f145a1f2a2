//! Retry policy for commit attempts.
//!
//! ```
//! use std::time::Duration;
//! use tiered_assets::commit::{ExponentialBackoff, RetryPolicy};
//! use tiered_assets::StoreError;
//!
//! let policy = ExponentialBackoff {
//!     initial_delay: Duration::from_millis(100),
//!     max_delay: Duration::from_millis(350),
//!     factor: 2.0,
//!     max_attempts: 4,
//! };
//!
//! assert_eq!(policy.backoff(1), Duration::from_millis(100));
//! assert_eq!(policy.backoff(2), Duration::from_millis(200));
//! assert_eq!(policy.backoff(3), Duration::from_millis(350));
//! assert!(policy.should_retry(&StoreError::Timeout, 3));
//! assert!(!policy.should_retry(&StoreError::Timeout, 4));
//! assert!(!policy.should_retry(&StoreError::NotFound("x".into()), 1));
//! ```

use std::time::Duration;

use crate::error::StoreError;
use crate::settings::StoreSettings;

/// Decides whether and when a failed commit is attempted again
pub trait RetryPolicy: Send + Sync {
    /// `attempt` is the number of attempts made so far, starting at 1
    fn should_retry(&self, error: &StoreError, attempt: u32) -> bool;

    /// Delay before the attempt following `attempt`
    fn backoff(&self, attempt: u32) -> Duration;
}

/// Exponential backoff over retryable error kinds
#[derive(Debug, Clone)]
pub struct ExponentialBackoff {
    pub initial_delay: Duration,
    pub max_delay: Duration,
    pub factor: f64,
    /// Total attempts, including the first
    pub max_attempts: u32,
}

impl ExponentialBackoff {
    pub fn from_settings(settings: &StoreSettings) -> Self {
        Self {
            initial_delay: Duration::from_millis(settings.retry_initial_backoff_ms),
            max_delay: Duration::from_millis(settings.retry_max_backoff_ms),
            factor: settings.retry_backoff_factor,
            max_attempts: settings.max_retries,
        }
    }

    /// Fast retry for tests (minimal delays)
    #[cfg(test)]
    pub fn test(max_attempts: u32) -> Self {
        Self {
            initial_delay: Duration::from_millis(1),
            max_delay: Duration::from_millis(10),
            factor: 2.0,
            max_attempts,
        }
    }
}

impl RetryPolicy for ExponentialBackoff {
    fn should_retry(&self, error: &StoreError, attempt: u32) -> bool {
        error.is_retryable() && attempt < self.max_attempts
    }

    fn backoff(&self, attempt: u32) -> Duration {
        let mut delay = self.initial_delay;
        for _ in 1..attempt {
            delay = delay.mul_f64(self.factor).min(self.max_delay);
            if delay == self.max_delay {
                break;
            }
        }
        delay.min(self.max_delay)
    }
}
