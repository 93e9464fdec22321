//! Retry policy implementation

use std::time::Duration;

use rand::Rng;
use serde::{Deserialize, Serialize};

/// Retry configuration attached to an error handler
///
/// Applies per activity execution, not per instance: each node tracks its
/// own attempt counter, reset when the token moves on.
///
/// # Example
///
/// ```
/// use clinicflow_engine::RetryPolicy;
/// use std::time::Duration;
///
/// let policy = RetryPolicy::exponential(2)
///     .with_initial_delay(Duration::from_millis(100))
///     .with_max_delay(Duration::from_secs(10));
///
/// assert_eq!(policy.delay_for_retry(0), Duration::from_millis(100));
/// assert_eq!(policy.delay_for_retry(1), Duration::from_millis(200));
/// ```
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct RetryPolicy {
    /// Retries after the first attempt
    pub max_retries: u32,

    /// Delay before the first retry
    #[serde(rename = "initialDelayMs", with = "duration_millis")]
    pub initial_delay: Duration,

    /// Upper bound for any single delay
    #[serde(
        rename = "maxDelayMs",
        with = "duration_millis",
        default = "default_max_delay"
    )]
    pub max_delay: Duration,

    #[serde(default = "default_multiplier")]
    pub backoff_multiplier: f64,

    /// Jitter factor (0.0-1.0)
    ///
    /// A value of 0.1 means ±10% randomness.
    #[serde(default)]
    pub jitter: f64,

    /// Error codes that are never retried
    #[serde(default)]
    pub non_retryable_codes: Vec<String>,
}

fn default_max_delay() -> Duration {
    Duration::from_secs(60)
}

fn default_multiplier() -> f64 {
    2.0
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self::exponential(3)
    }
}

impl RetryPolicy {
    /// Exponential backoff starting at one second, capped at one minute
    pub fn exponential(max_retries: u32) -> Self {
        Self {
            max_retries,
            initial_delay: Duration::from_secs(1),
            max_delay: default_max_delay(),
            backoff_multiplier: default_multiplier(),
            jitter: 0.0,
            non_retryable_codes: vec![],
        }
    }

    /// Create a policy that never retries
    pub fn no_retry() -> Self {
        Self {
            max_retries: 0,
            initial_delay: Duration::ZERO,
            max_delay: Duration::ZERO,
            backoff_multiplier: 1.0,
            jitter: 0.0,
            non_retryable_codes: vec![],
        }
    }

    /// Create a policy with fixed intervals (no backoff)
    pub fn fixed(delay: Duration, max_retries: u32) -> Self {
        Self {
            max_retries,
            initial_delay: delay,
            max_delay: delay,
            backoff_multiplier: 1.0,
            jitter: 0.0,
            non_retryable_codes: vec![],
        }
    }

    pub fn with_initial_delay(mut self, delay: Duration) -> Self {
        self.initial_delay = delay;
        self
    }

    pub fn with_max_delay(mut self, delay: Duration) -> Self {
        self.max_delay = delay;
        self
    }

    pub fn with_backoff_multiplier(mut self, multiplier: f64) -> Self {
        self.backoff_multiplier = multiplier;
        self
    }

    /// Set the jitter factor (0.0-1.0)
    pub fn with_jitter(mut self, jitter: f64) -> Self {
        self.jitter = jitter.clamp(0.0, 1.0);
        self
    }

    pub fn with_non_retryable_code(mut self, code: impl Into<String>) -> Self {
        self.non_retryable_codes.push(code.into());
        self
    }

    /// Delay before retry number `retry` (0-based)
    ///
    /// `min(initial * multiplier^retry, max)`, then jittered when configured.
    pub fn delay_for_retry(&self, retry: u32) -> Duration {
        let exponent = i32::try_from(retry).unwrap_or(i32::MAX);
        let base = self.initial_delay.as_millis() as f64 * self.backoff_multiplier.powi(exponent);
        let capped = base.min(self.max_delay.as_millis() as f64);

        let jittered = if self.jitter > 0.0 && capped > 0.0 {
            let mut rng = rand::thread_rng();
            let jitter_range = capped * self.jitter;
            let jitter_offset = rng.gen_range(-jitter_range..jitter_range);
            (capped + jitter_offset).max(0.0)
        } else {
            capped
        };

        if jittered.is_finite() {
            Duration::from_millis(jittered.round() as u64)
        } else {
            self.max_delay
        }
    }

    /// Check if an error code may be retried at all
    pub fn should_retry(&self, code: &str) -> bool {
        !self.non_retryable_codes.iter().any(|c| c == code)
    }

    /// Check if another retry is allowed after `retries_so_far`
    pub fn has_retries_remaining(&self, retries_so_far: u32) -> bool {
        retries_so_far < self.max_retries
    }
}

/// Serde support for Duration as milliseconds
pub(crate) mod duration_millis {
    use serde::{Deserialize, Deserializer, Serialize, Serializer};
    use std::time::Duration;

    pub fn serialize<S>(duration: &Duration, serializer: S) -> Result<S::Ok, S::Error>
    where
        S: Serializer,
    {
        u64::try_from(duration.as_millis())
            .unwrap_or(u64::MAX)
            .serialize(serializer)
    }

    pub fn deserialize<'de, D>(deserializer: D) -> Result<Duration, D::Error>
    where
        D: Deserializer<'de>,
    {
        let millis = u64::deserialize(deserializer)?;
        Ok(Duration::from_millis(millis))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_backoff_sequence() {
        let policy = RetryPolicy::exponential(2).with_initial_delay(Duration::from_millis(100));

        assert_eq!(policy.delay_for_retry(0), Duration::from_millis(100));
        assert_eq!(policy.delay_for_retry(1), Duration::from_millis(200));
        assert_eq!(policy.delay_for_retry(2), Duration::from_millis(400));
    }

    #[test]
    fn test_delay_capped_at_max() {
        let policy = RetryPolicy::exponential(10)
            .with_initial_delay(Duration::from_secs(1))
            .with_max_delay(Duration::from_secs(5));

        assert_eq!(policy.delay_for_retry(8), Duration::from_secs(5));
    }

    #[test]
    fn test_no_retry() {
        let policy = RetryPolicy::no_retry();
        assert!(!policy.has_retries_remaining(0));
    }

    #[test]
    fn test_retries_remaining() {
        let policy = RetryPolicy::exponential(2);
        assert!(policy.has_retries_remaining(0));
        assert!(policy.has_retries_remaining(1));
        assert!(!policy.has_retries_remaining(2));
    }

    #[test]
    fn test_fixed_interval() {
        let policy = RetryPolicy::fixed(Duration::from_secs(5), 3);
        assert_eq!(policy.delay_for_retry(0), Duration::from_secs(5));
        assert_eq!(policy.delay_for_retry(2), Duration::from_secs(5));
    }

    #[test]
    fn test_jitter_stays_in_range() {
        let policy = RetryPolicy::fixed(Duration::from_secs(10), 3).with_jitter(0.1);

        for _ in 0..100 {
            let delay = policy.delay_for_retry(0);
            assert!(delay >= Duration::from_secs(9));
            assert!(delay <= Duration::from_secs(11));
        }
    }

    #[test]
    fn test_non_retryable_codes() {
        let policy = RetryPolicy::exponential(3).with_non_retryable_code("InvalidInput");

        assert!(policy.should_retry("Timeout"));
        assert!(!policy.should_retry("InvalidInput"));
    }

    #[test]
    fn test_deserialize_definition_shape() {
        let policy: RetryPolicy = serde_json::from_value(serde_json::json!({
            "maxRetries": 2,
            "initialDelayMs": 100,
            "backoffMultiplier": 2
        }))
        .unwrap();

        assert_eq!(policy.max_retries, 2);
        assert_eq!(policy.initial_delay, Duration::from_millis(100));
        assert_eq!(policy.max_delay, Duration::from_secs(60));
        assert_eq!(policy.backoff_multiplier, 2.0);
    }
}
