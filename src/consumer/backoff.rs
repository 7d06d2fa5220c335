//! Retry pacing for transient queue-client failures.
//!
//! Dequeue, ack, and nack can all fail transiently (network blips,
//! throttling). Nothing is lost when they do, because unacknowledged
//! messages are redelivered by the queue, so the right response is to slow
//! down and try again rather than to surface the error.

use std::time::Duration;

/// Default delay before the first retry.
const DEFAULT_INITIAL_DELAY_MS: u64 = 100;

/// Default ceiling on the backoff delay.
const DEFAULT_MAX_DELAY_SECS: u64 = 30;

/// Default attempt budget for acknowledgment retries.
const DEFAULT_MAX_ATTEMPTS: u32 = 5;

/// Exponential backoff configuration.
///
/// The delay for attempt `n` (zero-based) is `initial_delay * 2^n`, capped
/// at `max_delay`. Listeners retry transient dequeue errors indefinitely;
/// the ack dispatcher gives up after `max_attempts` and relies on the
/// queue's redelivery to self-heal.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RetryConfig {
    /// Delay before the first retry.
    pub initial_delay: Duration,

    /// Upper bound on any single delay.
    pub max_delay: Duration,

    /// Attempt budget for operations that are safe to abandon.
    pub max_attempts: u32,
}

impl Default for RetryConfig {
    fn default() -> Self {
        RetryConfig {
            initial_delay: Duration::from_millis(DEFAULT_INITIAL_DELAY_MS),
            max_delay: Duration::from_secs(DEFAULT_MAX_DELAY_SECS),
            max_attempts: DEFAULT_MAX_ATTEMPTS,
        }
    }
}

impl RetryConfig {
    /// Returns the delay to sleep before retrying after `attempt` failures.
    pub fn delay_for(&self, attempt: u32) -> Duration {
        let factor = 2u32.saturating_pow(attempt);
        self.initial_delay
            .saturating_mul(factor)
            .min(self.max_delay)
    }
}

/// Tracks consecutive failures of one operation and produces the next delay.
///
/// Reset on the first success so an isolated blip does not leave the loop
/// permanently slowed down.
#[derive(Debug, Default)]
pub struct Backoff {
    attempt: u32,
}

impl Backoff {
    pub fn new() -> Self {
        Backoff::default()
    }

    /// Records a failure and returns how long to wait before retrying.
    pub fn next_delay(&mut self, config: &RetryConfig) -> Duration {
        let delay = config.delay_for(self.attempt);
        self.attempt = self.attempt.saturating_add(1);
        delay
    }

    /// Records a success, restoring the initial delay for future failures.
    pub fn reset(&mut self) {
        self.attempt = 0;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;

    #[test]
    fn delays_double_until_the_cap() {
        let config = RetryConfig {
            initial_delay: Duration::from_millis(100),
            max_delay: Duration::from_millis(500),
            max_attempts: 5,
        };

        assert_eq!(config.delay_for(0), Duration::from_millis(100));
        assert_eq!(config.delay_for(1), Duration::from_millis(200));
        assert_eq!(config.delay_for(2), Duration::from_millis(400));
        assert_eq!(config.delay_for(3), Duration::from_millis(500));
        assert_eq!(config.delay_for(10), Duration::from_millis(500));
    }

    #[test]
    fn backoff_advances_and_resets() {
        let config = RetryConfig::default();
        let mut backoff = Backoff::new();

        let first = backoff.next_delay(&config);
        let second = backoff.next_delay(&config);
        assert!(second > first);

        backoff.reset();
        assert_eq!(backoff.next_delay(&config), first);
    }

    proptest! {
        /// Delays never decrease with the attempt number and never exceed
        /// the cap.
        #[test]
        fn prop_delay_is_monotonic_and_capped(attempt in 0u32..64) {
            let config = RetryConfig::default();
            let delay = config.delay_for(attempt);
            prop_assert!(delay <= config.max_delay);
            prop_assert!(delay >= config.initial_delay.min(config.max_delay));
            prop_assert!(config.delay_for(attempt + 1) >= delay);
        }
    }
}
