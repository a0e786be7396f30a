//! Exponential backoff for transport reconnection

use std::time::Duration;

use rand::Rng;

use crate::config::BackoffConfig;

/// Retry delays grow exponentially with the retry counter and are capped at
/// `max_delay_ms`. Once the sum of scheduled delays would pass
/// `give_up_after_ms`, no further delay is handed out.
#[derive(Debug, Clone)]
pub struct ReconnectBackoff {
    config: BackoffConfig,
    retry_counter: u32,
    elapsed_ms: u64,
}

impl ReconnectBackoff {
    pub fn new() -> Self {
        Self::with_config(BackoffConfig::default())
    }

    pub fn with_config(config: BackoffConfig) -> Self {
        Self {
            config,
            retry_counter: 1,
            elapsed_ms: 0,
        }
    }

    /// Delay for a given retry counter, before jitter
    pub fn delay_for(&self, retry_counter: u32) -> Duration {
        let exponent = retry_counter.saturating_sub(1).min(64) as i32;
        let base_delay = self.config.initial_delay_ms as f64 * self.config.multiplier.max(1.0).powi(exponent);
        let capped_delay = base_delay.min(self.config.max_delay_ms as f64);
        Duration::from_millis(capped_delay.max(0.0) as u64)
    }

    /// Get the next delay, or `None` once the cumulative budget is spent
    pub fn next_delay(&mut self) -> Option<Duration> {
        let capped_delay = self.delay_for(self.retry_counter).as_millis() as f64;

        // Apply jitter only if jitter_factor > 0
        let jitter_range = capped_delay * self.config.jitter_factor;
        let final_delay = if jitter_range > 0.0 {
            let jitter = rand::rng().random_range(-jitter_range..jitter_range);
            (capped_delay + jitter).max(1.0) as u64
        } else {
            capped_delay as u64
        };

        if self.elapsed_ms.saturating_add(final_delay) > self.config.give_up_after_ms {
            return None;
        }

        self.elapsed_ms += final_delay;
        self.retry_counter += 1;

        Some(Duration::from_millis(final_delay))
    }

    /// Back to the floor after a successful connection
    pub fn reset(&mut self) {
        self.retry_counter = 1;
        self.elapsed_ms = 0;
    }

    pub fn retry_counter(&self) -> u32 {
        self.retry_counter
    }
}

impl Default for ReconnectBackoff {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn config(initial: u64, max: u64, give_up: u64) -> BackoffConfig {
        BackoffConfig {
            initial_delay_ms: initial,
            max_delay_ms: max,
            multiplier: 2.0,
            jitter_factor: 0.0,
            give_up_after_ms: give_up,
        }
    }

    #[test]
    fn test_delays_double_from_initial() {
        let mut backoff = ReconnectBackoff::with_config(config(1000, 60_000, 3_600_000));

        assert_eq!(backoff.next_delay(), Some(Duration::from_secs(1)));
        assert_eq!(backoff.next_delay(), Some(Duration::from_secs(2)));
        assert_eq!(backoff.next_delay(), Some(Duration::from_secs(4)));
        assert_eq!(backoff.retry_counter(), 4);
    }

    #[test]
    fn test_delays_are_monotonic_and_capped() {
        let backoff = ReconnectBackoff::with_config(config(1000, 30_000, 3_600_000));

        let mut previous = Duration::ZERO;
        for counter in 1..200 {
            let delay = backoff.delay_for(counter);
            assert!(delay >= previous);
            assert!(delay <= Duration::from_secs(30));
            previous = delay;
        }
    }

    #[test]
    fn test_gives_up_after_cumulative_budget() {
        let mut backoff = ReconnectBackoff::with_config(config(1000, 1000, 3500));

        assert!(backoff.next_delay().is_some());
        assert!(backoff.next_delay().is_some());
        assert!(backoff.next_delay().is_some());
        assert!(backoff.next_delay().is_none());
        // stays given up
        assert!(backoff.next_delay().is_none());
    }

    #[test]
    fn test_default_budget_is_one_hour() {
        let mut backoff = ReconnectBackoff::new();
        let mut total = Duration::ZERO;
        while let Some(delay) = backoff.next_delay() {
            total += delay;
        }
        assert!(total <= Duration::from_secs(3600));
        assert!(total > Duration::from_secs(3500));
    }

    #[test]
    fn test_reset() {
        let mut backoff = ReconnectBackoff::with_config(config(100, 10_000, 3_600_000));
        backoff.next_delay();
        backoff.next_delay();

        backoff.reset();
        assert_eq!(backoff.retry_counter(), 1);
        assert_eq!(backoff.next_delay(), Some(Duration::from_millis(100)));
    }

    #[test]
    fn test_jitter_stays_within_range() {
        let mut backoff = ReconnectBackoff::with_config(BackoffConfig {
            jitter_factor: 0.1,
            ..config(1000, 60_000, 3_600_000)
        });
        let delay = backoff.next_delay().unwrap();
        assert!(delay >= Duration::from_millis(900));
        assert!(delay <= Duration::from_millis(1100));
    }
}
