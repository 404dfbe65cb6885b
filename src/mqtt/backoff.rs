use std::time::Duration;

use super::config::ReconnectConfig;

/// Doubling reconnect delay bounded by `[min, max]`
///
/// The first failure waits `min`. Each further consecutive failure doubles the
/// wait until `max` is reached. [`ReconnectBackoff::reset`] after a successful
/// connection starts over at `min`.
#[derive(Debug, Clone)]
pub struct ReconnectBackoff {
    min: Duration,
    max: Duration,
    current: Duration,
    failures: u32,
}

impl ReconnectBackoff {
    pub fn new(min: Duration, max: Duration) -> Self {
        let max = max.max(min);
        Self {
            min,
            max,
            current: min,
            failures: 0,
        }
    }

    /// Registers one more failure and returns how long to wait before retrying
    pub fn next_delay(&mut self) -> Duration {
        let delay = self.current;
        self.failures = self.failures.saturating_add(1);
        self.current = self.current.saturating_mul(2).min(self.max);
        delay
    }

    pub fn reset(&mut self) {
        self.current = self.min;
        self.failures = 0;
    }

    /// Consecutive failures since the last reset
    pub fn failures(&self) -> u32 {
        self.failures
    }
}

impl From<&ReconnectConfig> for ReconnectBackoff {
    fn from(config: &ReconnectConfig) -> Self {
        Self::new(
            Duration::from_secs(config.min_delay_secs),
            Duration::from_secs(config.max_delay_secs),
        )
    }
}

impl Default for ReconnectBackoff {
    fn default() -> Self {
        Self::from(&ReconnectConfig::default())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn delays_double_up_to_the_cap() {
        let mut backoff = ReconnectBackoff::default();
        let delays: Vec<u64> = (0..10).map(|_| backoff.next_delay().as_secs()).collect();
        assert_eq!(delays, vec![1, 2, 4, 8, 16, 32, 64, 120, 120, 120]);
        assert_eq!(backoff.failures(), 10);
    }

    #[test]
    fn delays_are_monotonic_and_bounded() {
        let mut backoff = ReconnectBackoff::default();
        let mut previous = Duration::ZERO;
        for _ in 0..200 {
            let delay = backoff.next_delay();
            assert!(delay >= previous);
            assert!(delay >= Duration::from_secs(1));
            assert!(delay <= Duration::from_secs(120));
            previous = delay;
        }
    }

    #[test]
    fn reset_returns_to_minimum() {
        let mut backoff = ReconnectBackoff::default();
        for _ in 0..5 {
            backoff.next_delay();
        }
        backoff.reset();
        assert_eq!(backoff.failures(), 0);
        assert_eq!(backoff.next_delay(), Duration::from_secs(1));
        assert_eq!(backoff.next_delay(), Duration::from_secs(2));
    }

    #[test]
    fn inverted_bounds_collapse_to_min() {
        let mut backoff = ReconnectBackoff::new(Duration::from_secs(10), Duration::from_secs(3));
        assert_eq!(backoff.next_delay(), Duration::from_secs(10));
        assert_eq!(backoff.next_delay(), Duration::from_secs(10));
    }
}
