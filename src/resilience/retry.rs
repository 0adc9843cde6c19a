use std::time::Duration;

use rand::Rng;

use crate::config::ProviderConfig;
use crate::error::Error;

/// Retry tuning for one class of operation. `retry_timeouts = false` makes
/// deadline expiry terminal, for non-idempotent writes.
#[derive(Debug, Clone)]
pub struct RetryPolicy {
    pub max_attempts: u32,
    pub base_delay: Duration,
    pub max_delay: Duration,
    pub timeout: Duration,
    pub retry_timeouts: bool,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_attempts: 3,
            base_delay: Duration::from_millis(100),
            max_delay: Duration::from_millis(1000),
            timeout: Duration::from_secs(30),
            retry_timeouts: true,
        }
    }
}

impl RetryPolicy {
    pub fn from_config(config: &ProviderConfig) -> Self {
        Self {
            max_attempts: config.retry_attempts,
            base_delay: Duration::from_millis(config.retry_base_delay_ms),
            max_delay: Duration::from_millis(config.retry_max_delay_ms),
            timeout: config.request_timeout(),
            retry_timeouts: true,
        }
    }

    /// Write operations are not known to be idempotent, so an abandoned
    /// call must not be replayed.
    pub fn for_writes(config: &ProviderConfig) -> Self {
        Self {
            retry_timeouts: false,
            ..Self::from_config(config)
        }
    }

    /// Exponential backoff before jitter: `min(max_delay, base * 2^attempt)`.
    pub fn backoff_delay(&self, attempt: u32) -> Duration {
        let factor = 2u32.checked_pow(attempt).unwrap_or(u32::MAX);
        self.base_delay.saturating_mul(factor).min(self.max_delay)
    }

    /// Backoff with ±20% random jitter to spread concurrent retriers.
    pub fn jittered_delay(&self, attempt: u32) -> Duration {
        let base = self.backoff_delay(attempt);
        let factor = rand::thread_rng().gen_range(0.8..=1.2);
        base.mul_f64(factor)
    }

    pub fn should_retry(&self, error: &Error) -> bool {
        if error.is_timeout() {
            return self.retry_timeouts;
        }
        error.is_transient()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn policy() -> RetryPolicy {
        RetryPolicy {
            base_delay: Duration::from_millis(100),
            max_delay: Duration::from_millis(1000),
            ..Default::default()
        }
    }

    #[test]
    fn test_backoff_sequence() {
        let policy = policy();
        let delays: Vec<u64> = (0..7)
            .map(|attempt| policy.backoff_delay(attempt).as_millis() as u64)
            .collect();
        assert_eq!(delays, vec![100, 200, 400, 800, 1000, 1000, 1000]);
    }

    #[test]
    fn test_backoff_survives_large_attempt_numbers() {
        let policy = policy();
        assert_eq!(policy.backoff_delay(40), Duration::from_millis(1000));
    }

    #[test]
    fn test_jitter_stays_within_bounds() {
        let policy = policy();
        for _ in 0..100 {
            let jittered = policy.jittered_delay(2); // base 400ms
            assert!(jittered >= Duration::from_millis(320));
            assert!(jittered <= Duration::from_millis(480));
        }
    }

    #[test]
    fn test_timeouts_retryable_by_default() {
        let policy = policy();
        assert!(policy.should_retry(&Error::Timeout("deadline".into())));
        assert!(policy.should_retry(&Error::Http("HTTP 502".into())));
        assert!(!policy.should_retry(&Error::InvalidRequest("bad".into())));
        assert!(!policy.should_retry(&Error::NotFound("row".into())));
    }

    #[test]
    fn test_write_policy_does_not_retry_timeouts() {
        let config = crate::config::ProviderConfig::new(crate::config::ProviderKind::Memory);
        let policy = RetryPolicy::for_writes(&config);
        assert!(!policy.should_retry(&Error::Timeout("deadline".into())));
        assert!(policy.should_retry(&Error::Http("HTTP 502".into())));
    }
}
