//! Retry policy
//!
//! Bounded retry with exponential backoff and jitter for transport-level
//! failures. Protocol errors are never retried.

use std::time::Duration;

use rand::Rng;

/// Retry policy configuration
#[derive(Debug, Clone)]
pub struct RetryPolicy {
    /// Maximum attempts per operation (first try included)
    pub max_attempts: u32,
    /// Backoff before the second attempt
    pub initial_backoff: Duration,
    /// Backoff cap
    pub max_backoff: Duration,
    /// Whether to add jitter to backoff delays
    pub jitter: bool,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_attempts: 3,
            initial_backoff: Duration::from_millis(100),
            max_backoff: Duration::from_secs(2),
            jitter: true,
        }
    }
}

impl RetryPolicy {
    pub fn new(max_attempts: u32, initial_backoff: Duration, max_backoff: Duration) -> Self {
        Self {
            max_attempts,
            initial_backoff,
            max_backoff,
            jitter: true,
        }
    }

    /// Backoff before attempt `attempt` (1-based; attempt 1 has no delay).
    ///
    /// Doubles per failed attempt, capped at `max_backoff`, with ±25% jitter
    /// when enabled.
    pub fn backoff_for(&self, attempt: u32) -> Duration {
        if attempt <= 1 {
            return Duration::ZERO;
        }

        let exponent = attempt.saturating_sub(2).min(16);
        let mut delay = self.initial_backoff.saturating_mul(1 << exponent);
        if delay > self.max_backoff {
            delay = self.max_backoff;
        }

        if self.jitter {
            let jitter_range = delay.as_millis() as f64 * 0.25;
            if jitter_range >= 1.0 {
                let jitter = rand::thread_rng().gen_range(-jitter_range..jitter_range);
                let delay_ms = (delay.as_millis() as f64 + jitter).max(0.0);
                delay = Duration::from_millis(delay_ms as u64);
            }
        }

        delay
    }
}

// ============================================================================
// Tests
// ============================================================================

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_exponential_backoff() {
        let policy = RetryPolicy {
            max_attempts: 5,
            initial_backoff: Duration::from_millis(100),
            max_backoff: Duration::from_secs(2),
            jitter: false,
        };

        // First attempt runs immediately
        assert_eq!(policy.backoff_for(1), Duration::ZERO);
        assert_eq!(policy.backoff_for(2), Duration::from_millis(100));
        assert_eq!(policy.backoff_for(3), Duration::from_millis(200));
        assert_eq!(policy.backoff_for(4), Duration::from_millis(400));
    }

    #[test]
    fn test_backoff_cap() {
        let policy = RetryPolicy {
            max_attempts: 10,
            initial_backoff: Duration::from_millis(100),
            max_backoff: Duration::from_secs(2),
            jitter: false,
        };

        assert_eq!(policy.backoff_for(10), Duration::from_secs(2));
    }

    #[test]
    fn test_jitter_stays_within_bounds() {
        let policy = RetryPolicy::default();

        for _ in 0..100 {
            let delay = policy.backoff_for(3);
            // 200 ms nominal, ±25%
            assert!(delay >= Duration::from_millis(150));
            assert!(delay <= Duration::from_millis(250));
        }
    }
}
