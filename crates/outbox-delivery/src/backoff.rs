//! Exponential backoff for failed deliveries.
//!
//! The wait before attempt `n + 1` is `base * 2^n` where `n` is the number of
//! failures so far. A message is exhausted once its failure count reaches the
//! queue's retry limit.

use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::error::{DeliveryError, Result};

/// Exponents above this saturate; `2^32` base intervals is already longer
/// than any sensible schedule.
const MAX_EXPONENT: u32 = 32;

/// Backoff decision for a failed delivery.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Backoff {
    /// Try again after `wait_for`, recording `retries` failures.
    Retry {
        /// Failure count to persist.
        retries: u32,
        /// Delay before the next attempt.
        wait_for: Duration,
    },
    /// Retry limit reached.
    Exhausted,
}

/// Exponential backoff policy.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct BackoffPolicy {
    /// Delay before the first retry.
    pub base_delay: Duration,
}

impl Default for BackoffPolicy {
    fn default() -> Self {
        Self { base_delay: Duration::from_millis(100) }
    }
}

impl BackoffPolicy {
    /// Creates a policy with the given base delay.
    pub fn new(base_delay: Duration) -> Self {
        Self { base_delay }
    }

    /// Computes the decision after a failure.
    ///
    /// `retries` is the failure count before this attempt. `max_retries` of
    /// `None` means unbounded.
    ///
    /// # Errors
    ///
    /// Returns `DeliveryError::ConfigurationError` if `max_retries` is zero.
    pub fn compute(&self, retries: u32, max_retries: Option<u32>) -> Result<Backoff> {
        let max_retries = max_retries.unwrap_or(u32::MAX);
        if max_retries < 1 {
            return Err(DeliveryError::configuration(
                "backoff requires max_retries greater or equal to one",
            ));
        }

        if retries >= max_retries {
            return Ok(Backoff::Exhausted);
        }

        Ok(Backoff::Retry { retries: retries + 1, wait_for: self.delay_for(retries) })
    }

    /// Delay after `retries` failures, saturating instead of overflowing.
    pub fn delay_for(&self, retries: u32) -> Duration {
        let factor = 2u32.saturating_pow(retries.min(MAX_EXPONENT));
        self.base_delay.checked_mul(factor).unwrap_or(Duration::MAX)
    }
}

/// Converts a stored retry limit into the policy's input.
///
/// Stored limits are signed; anything below one is passed through as zero
/// so [`BackoffPolicy::compute`] reports it.
pub fn max_retries_from_stored(value: i32) -> Option<u32> {
    Some(u32::try_from(value).unwrap_or(0))
}

#[cfg(test)]
mod tests {
    use super::*;

    fn policy() -> BackoffPolicy {
        BackoffPolicy::default()
    }

    #[test]
    fn first_failure_waits_base_delay() {
        assert_eq!(
            policy().compute(0, Some(5)).unwrap(),
            Backoff::Retry { retries: 1, wait_for: Duration::from_millis(100) }
        );
    }

    #[test]
    fn last_allowed_retry_doubles_each_time() {
        assert_eq!(
            policy().compute(4, Some(5)).unwrap(),
            Backoff::Retry { retries: 5, wait_for: Duration::from_millis(1600) }
        );
    }

    #[test]
    fn reaching_limit_exhausts() {
        assert_eq!(policy().compute(5, Some(5)).unwrap(), Backoff::Exhausted);
        assert_eq!(policy().compute(9, Some(5)).unwrap(), Backoff::Exhausted);
    }

    #[test]
    fn single_retry_limit_exhausts_after_one_failure() {
        assert!(matches!(policy().compute(0, Some(1)).unwrap(), Backoff::Retry { retries: 1, .. }));
        assert_eq!(policy().compute(1, Some(1)).unwrap(), Backoff::Exhausted);
    }

    #[test]
    fn zero_limit_is_configuration_error() {
        let err = policy().compute(0, Some(0)).unwrap_err();
        assert!(matches!(err, DeliveryError::ConfigurationError { .. }));
    }

    #[test]
    fn unbounded_limit_never_exhausts() {
        assert!(matches!(policy().compute(1_000, None).unwrap(), Backoff::Retry { .. }));
    }

    #[test]
    fn huge_retry_counts_saturate() {
        assert_eq!(policy().delay_for(200), policy().delay_for(MAX_EXPONENT));
        assert!(policy().delay_for(u32::MAX) > Duration::from_secs(86_400));
    }

    #[test]
    fn stored_limits_convert() {
        assert_eq!(max_retries_from_stored(10), Some(10));
        assert_eq!(max_retries_from_stored(-3), Some(0));
    }
}
