//! Retry Backoff - Exponential with priority scaling and jitter
//!
//! Base delay doubles per attempt, scaled by the alarm's priority
//! (priority >= 8 -> 0.5x, priority <= 3 -> 1.5x, else 1x), jittered within
//! +/-20%, capped at `max_delay`. Breaker rejections are never retried here;
//! the breaker's own timer is the backoff.

use rand::Rng;
use std::time::Duration;

use fw_config::ChannelConfig;

#[derive(Debug, Clone)]
pub struct RetryPolicy {
    pub max_retries: u32,
    pub base_delay: Duration,
    pub max_delay: Duration,
}

impl RetryPolicy {
    pub fn new(max_retries: u32, base_delay: Duration, max_delay: Duration) -> Self {
        Self {
            max_retries,
            base_delay,
            max_delay,
        }
    }

    pub fn from_channel_config(config: &ChannelConfig) -> Self {
        Self {
            max_retries: config.max_retries,
            base_delay: Duration::from_millis(config.retry_base_delay_ms),
            max_delay: Duration::from_millis(config.retry_max_delay_ms),
        }
    }

    /// Urgency scaling: urgent alarms back off faster, low-priority ones
    /// slower.
    pub fn priority_factor(priority: u8) -> f64 {
        if priority >= 8 {
            0.5
        } else if priority <= 3 {
            1.5
        } else {
            1.0
        }
    }

    /// Delay before retry number `attempt` (1-based), jittered and capped.
    pub fn delay_for(&self, attempt: u32, priority: u8) -> Duration {
        let exponent = attempt.saturating_sub(1).min(16);
        let exponential = self.base_delay.as_millis() as f64 * 2f64.powi(exponent as i32);
        let scaled = exponential * Self::priority_factor(priority);
        let jittered = scaled * rand::rng().random_range(0.8..1.2);
        Duration::from_millis(jittered as u64).min(self.max_delay)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn policy() -> RetryPolicy {
        RetryPolicy::new(3, Duration::from_millis(1_000), Duration::from_secs(60))
    }

    #[test]
    fn priority_factors() {
        assert_eq!(RetryPolicy::priority_factor(10), 0.5);
        assert_eq!(RetryPolicy::priority_factor(8), 0.5);
        assert_eq!(RetryPolicy::priority_factor(5), 1.0);
        assert_eq!(RetryPolicy::priority_factor(3), 1.5);
        assert_eq!(RetryPolicy::priority_factor(0), 1.5);
    }

    #[test]
    fn delay_scales_with_priority_within_jitter() {
        let policy = policy();
        for _ in 0..50 {
            let urgent = policy.delay_for(1, 9).as_millis() as f64;
            let normal = policy.delay_for(1, 5).as_millis() as f64;
            let low = policy.delay_for(1, 2).as_millis() as f64;

            // 0.5x scaled, +/-20% jitter
            assert!((400.0..=600.0).contains(&urgent), "urgent = {}", urgent);
            assert!((800.0..=1200.0).contains(&normal), "normal = {}", normal);
            assert!((1200.0..=1800.0).contains(&low), "low = {}", low);
        }
    }

    #[test]
    fn delay_doubles_per_attempt() {
        let policy = policy();
        for _ in 0..50 {
            let second = policy.delay_for(2, 5).as_millis() as f64;
            let third = policy.delay_for(3, 5).as_millis() as f64;
            assert!((1600.0..=2400.0).contains(&second), "second = {}", second);
            assert!((3200.0..=4800.0).contains(&third), "third = {}", third);
        }
    }

    #[test]
    fn delay_is_capped() {
        let policy = RetryPolicy::new(10, Duration::from_secs(10), Duration::from_secs(15));
        for attempt in 1..=10 {
            assert!(policy.delay_for(attempt, 5) <= Duration::from_secs(15));
        }
    }
}
