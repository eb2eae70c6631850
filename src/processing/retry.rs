//! Retry schedule for failed event processing.
//!
//! Uses `backon` for exponential backoff. `Retry` results carry their own
//! processor-chosen timeout; retryable `Failed` results get a delay
//! computed here from the attempt count.

use std::time::Duration;

use backon::{BackoffBuilder, ExponentialBuilder};

/// Exponential backoff schedule for processing retries.
#[derive(Debug, Clone)]
pub struct RetryPolicy {
    min_delay: Duration,
    max_delay: Duration,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            min_delay: Duration::from_secs(1),
            max_delay: Duration::from_secs(60),
        }
    }
}

impl RetryPolicy {
    pub fn new(min_delay: Duration, max_delay: Duration) -> Self {
        Self {
            min_delay,
            max_delay,
        }
    }

    /// Delay before the next attempt, given how many attempts have
    /// already been made. Attempt counts start at 1.
    pub fn delay_for_attempt(&self, attempts: u32) -> Duration {
        let mut backoff = ExponentialBuilder::default()
            .with_min_delay(self.min_delay)
            .with_max_delay(self.max_delay)
            .without_max_times()
            .build();
        backoff
            .nth(attempts.saturating_sub(1) as usize)
            .unwrap_or(self.max_delay)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_delays_grow_exponentially() {
        let policy = RetryPolicy::new(Duration::from_millis(100), Duration::from_secs(10));
        let delays: Vec<_> = (1..=4).map(|n| policy.delay_for_attempt(n)).collect();

        assert_eq!(delays[0], Duration::from_millis(100));
        // backon applies its growth factor in floating point, so later
        // delays can drift by fractions of a microsecond; assert the
        // doubling shape rather than exact values.
        for pair in delays.windows(2) {
            let ratio = pair[1].as_secs_f64() / pair[0].as_secs_f64();
            assert!((ratio - 2.0).abs() < 0.01, "growth ratio was {ratio}");
        }
    }

    #[test]
    fn test_delay_is_capped() {
        let policy = RetryPolicy::new(Duration::from_secs(1), Duration::from_secs(8));
        assert_eq!(policy.delay_for_attempt(30), Duration::from_secs(8));
    }
}
