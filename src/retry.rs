//! Exponential backoff for retryable account failures.

use std::time::Duration;

use crate::config::RetryConfig;

#[derive(Debug, Clone, PartialEq)]
pub struct RetryPolicy {
    /// Retries allowed after the first attempt.
    pub max_attempts: u32,
    pub initial_delay: Duration,
    pub max_delay: Duration,
    pub multiplier: f64,
}

impl From<&RetryConfig> for RetryPolicy {
    fn from(config: &RetryConfig) -> Self {
        RetryPolicy {
            max_attempts: config.max_attempts,
            initial_delay: Duration::from_secs_f64(config.initial_delay_seconds.max(0.0)),
            max_delay: Duration::from_secs_f64(config.max_delay_seconds.max(0.0)),
            multiplier: config.backoff_multiplier.max(1.0),
        }
    }
}

impl RetryPolicy {
    /// Delay before retry number `retry` (zero-based):
    /// `min(initial * multiplier^retry, max)`.
    pub fn delay_for(&self, retry: u32) -> Duration {
        let factor = self.multiplier.powi(retry.min(i32::MAX as u32) as i32);
        let secs = self.initial_delay.as_secs_f64() * factor;
        if !secs.is_finite() || secs >= self.max_delay.as_secs_f64() {
            self.max_delay
        } else {
            Duration::from_secs_f64(secs)
        }
    }

    /// Delay before the next retry, or `None` once retries are exhausted.
    pub fn next_delay(&self, retries_done: u32) -> Option<Duration> {
        (retries_done < self.max_attempts).then(|| self.delay_for(retries_done))
    }

    /// Every delay the policy would produce, in order.
    pub fn schedule(&self) -> Vec<Duration> {
        (0..self.max_attempts).map(|retry| self.delay_for(retry)).collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn policy(max_attempts: u32, initial: f64, max: f64, multiplier: f64) -> RetryPolicy {
        RetryPolicy::from(&RetryConfig {
            max_attempts,
            initial_delay_seconds: initial,
            max_delay_seconds: max,
            backoff_multiplier: multiplier,
        })
    }

    #[test]
    fn test_capped_schedule() {
        let delays: Vec<u64> = policy(4, 1.0, 5.0, 2.0)
            .schedule()
            .into_iter()
            .map(|d| d.as_secs())
            .collect();
        assert_eq!(delays, vec![1, 2, 4, 5]);
    }

    #[test]
    fn test_delays_non_decreasing_and_capped() {
        let p = policy(40, 0.5, 60.0, 1.7);
        let schedule = p.schedule();
        for pair in schedule.windows(2) {
            assert!(pair[0] <= pair[1]);
        }
        assert!(schedule.iter().all(|d| *d <= Duration::from_secs(60)));
        assert_eq!(p.delay_for(1000), Duration::from_secs(60));
    }

    #[test]
    fn test_exhaustion() {
        let p = policy(2, 1.0, 10.0, 2.0);
        assert_eq!(p.next_delay(0), Some(Duration::from_secs(1)));
        assert_eq!(p.next_delay(1), Some(Duration::from_secs(2)));
        assert_eq!(p.next_delay(2), None);
        assert_eq!(policy(0, 1.0, 10.0, 2.0).next_delay(0), None);
    }
}
