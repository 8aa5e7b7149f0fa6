//! Reconnect backoff.

use crate::config::RetryConfig;
use rand::Rng;
use std::time::Duration;

/// Tracks consecutive connection failures of one channel.
#[derive(Debug, Clone)]
pub struct ReconnectBackoff {
    retry: RetryConfig,
    failures: u32,
}

impl ReconnectBackoff {
    /// Creates a backoff with no failures recorded.
    pub fn new(retry: RetryConfig) -> Self {
        Self { retry, failures: 0 }
    }

    /// Records a failure and returns the delay before the next attempt.
    pub fn record_failure(&mut self) -> Duration {
        self.record_failure_with(&mut rand::thread_rng())
    }

    /// Records a failure using the supplied RNG for jitter.
    pub fn record_failure_with<R: Rng + ?Sized>(&mut self, rng: &mut R) -> Duration {
        self.failures = self.failures.saturating_add(1);
        self.retry.delay_for_attempt_with(self.failures, rng)
    }

    /// Clears the failure count after a successful connect.
    pub fn reset(&mut self) {
        self.failures = 0;
    }

    /// Returns the consecutive failure count.
    pub fn failures(&self) -> u32 {
        self.failures
    }

    /// Returns true once the failure count reached the attempt limit.
    pub fn is_exhausted(&self) -> bool {
        !self.retry.allows_retry(self.failures)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rand::rngs::StdRng;
    use rand::SeedableRng;

    #[test]
    fn fourth_delay_exceeds_first_and_is_capped() {
        let retry = RetryConfig::new(3)
            .with_initial_delay(Duration::from_secs(1))
            .with_max_delay(Duration::from_secs(30))
            .with_max_jitter(Duration::from_secs(1));
        for seed in 0..20 {
            let mut rng = StdRng::seed_from_u64(seed);
            let mut backoff = ReconnectBackoff::new(retry.clone());
            let delays: Vec<Duration> = (0..4)
                .map(|_| backoff.record_failure_with(&mut rng))
                .collect();
            assert!(delays[3] > delays[0]);
            assert!(delays.iter().all(|d| *d <= Duration::from_secs(30)));
        }
    }

    #[test]
    fn exhaustion_and_reset() {
        let mut backoff = ReconnectBackoff::new(RetryConfig::new(3));
        backoff.record_failure();
        backoff.record_failure();
        assert!(!backoff.is_exhausted());
        backoff.record_failure();
        assert!(backoff.is_exhausted());
        backoff.reset();
        assert_eq!(backoff.failures(), 0);
    }

    #[test]
    fn long_outages_stay_capped() {
        let retry = RetryConfig::new(100)
            .with_max_delay(Duration::from_secs(30))
            .with_max_jitter(Duration::from_secs(1));
        let mut backoff = ReconnectBackoff::new(retry);
        let mut rng = StdRng::seed_from_u64(1);
        for _ in 0..50 {
            assert!(backoff.record_failure_with(&mut rng) <= Duration::from_secs(30));
        }
    }
}
