//! Reconnection backoff schedule.
//!
//! Pure attempt accounting; the client loop drives the actual restore
//! sequence (open, upgrade, re-auth, re-subscribe).

use ketch_core::ClientConfig;
use tokio::time::Duration;

/// Exponential backoff with a cap and a bounded attempt budget.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct BackoffSchedule {
    base_ms: u64,
    max_ms: u64,
    retry_count: u32,
}

impl BackoffSchedule {
    pub fn new(base_ms: u64, max_ms: u64, retry_count: u32) -> Self {
        Self {
            base_ms,
            max_ms,
            retry_count,
        }
    }

    pub fn from_config(config: &ClientConfig) -> Self {
        Self::new(config.retry_delay_ms, config.max_backoff_ms, config.retry_count)
    }

    /// Delay before attempt `k` (0-based), or `None` when the budget is
    /// exhausted.
    ///
    /// `delay(k) = min(base * 2^k, max)`.
    pub fn delay(&self, attempt: u32) -> Option<Duration> {
        if attempt >= self.retry_count {
            return None;
        }
        let exponent = attempt.min(20);
        let delay = self.base_ms.saturating_mul(1u64 << exponent).min(self.max_ms);
        Some(Duration::from_millis(delay))
    }

    /// Attempt budget.
    pub fn retry_count(&self) -> u32 {
        self.retry_count
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_schedule() {
        let schedule = BackoffSchedule::new(1000, 30000, 3);
        assert_eq!(schedule.delay(0), Some(Duration::from_millis(1000)));
        assert_eq!(schedule.delay(1), Some(Duration::from_millis(2000)));
        assert_eq!(schedule.delay(2), Some(Duration::from_millis(4000)));
        assert_eq!(schedule.delay(3), None);
    }

    #[test]
    fn test_cap_saturates() {
        let schedule = BackoffSchedule::new(1000, 5000, 10);
        assert_eq!(schedule.delay(2), Some(Duration::from_millis(4000)));
        assert_eq!(schedule.delay(3), Some(Duration::from_millis(5000)));
        assert_eq!(schedule.delay(9), Some(Duration::from_millis(5000)));
    }

    #[test]
    fn test_monotonically_non_decreasing() {
        let schedule = BackoffSchedule::new(250, 60000, 16);
        let mut previous = Duration::ZERO;
        for attempt in 0..16 {
            let delay = schedule.delay(attempt).unwrap();
            assert!(delay >= previous, "attempt {attempt} regressed");
            previous = delay;
        }
    }

    #[test]
    fn test_zero_retry_count_exhausts_immediately() {
        let schedule = BackoffSchedule::new(1000, 30000, 0);
        assert_eq!(schedule.delay(0), None);
    }

    #[test]
    fn test_huge_attempt_does_not_overflow() {
        let schedule = BackoffSchedule::new(u64::MAX / 2, u64::MAX, 200);
        assert_eq!(schedule.delay(100), Some(Duration::from_millis(u64::MAX)));
    }

    #[test]
    fn test_from_config() {
        let config = ClientConfig {
            url: "wss://example.test".to_string(),
            retry_delay_ms: 500,
            max_backoff_ms: 8000,
            retry_count: 5,
            ..Default::default()
        };
        let schedule = BackoffSchedule::from_config(&config);
        assert_eq!(schedule.delay(0), Some(Duration::from_millis(500)));
        assert_eq!(schedule.delay(4), Some(Duration::from_millis(8000)));
        assert_eq!(schedule.delay(5), None);
    }
}
