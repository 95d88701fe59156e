//! Reconnection backoff — exponential growth with jitter.

use std::time::Duration;

use crate::config::BackoffConfig;

/// Produces the retry delay sequence for reconnection attempts.
///
/// Each call to [`next_delay`](Self::next_delay) returns
/// `min(cap, base * 2^n) * (1 ± jitter)` and advances the attempt
/// counter; [`reset`](Self::reset) rewinds it after a successful
/// handshake. The pre-jitter sequence is monotonically non-decreasing.
#[derive(Debug)]
pub struct ExponentialBackoff {
    base: Duration,
    cap: Duration,
    jitter: f64,
    attempt: u32,
}

impl ExponentialBackoff {
    pub fn new(config: &BackoffConfig) -> Self {
        Self {
            base: config.base,
            cap: config.cap,
            jitter: config.jitter.clamp(0.0, 1.0),
            attempt: 0,
        }
    }

    pub fn next_delay(&mut self) -> Duration {
        // 2^exp saturates well below u32::MAX shifts
        let exp = self.attempt.min(16);
        let raw = self
            .base
            .saturating_mul(1u32 << exp)
            .min(self.cap);

        self.attempt = self.attempt.saturating_add(1);

        if self.jitter == 0.0 {
            return raw;
        }
        let factor = 1.0 + self.jitter * (2.0 * rand::random::<f64>() - 1.0);
        raw.mul_f64(factor)
    }

    pub fn reset(&mut self) {
        self.attempt = 0;
    }

    pub fn attempt(&self) -> u32 {
        self.attempt
    }
}

impl Default for ExponentialBackoff {
    fn default() -> Self {
        Self::new(&BackoffConfig::default())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn no_jitter() -> ExponentialBackoff {
        ExponentialBackoff::new(&BackoffConfig {
            base: Duration::from_secs(1),
            cap: Duration::from_secs(30),
            jitter: 0.0,
        })
    }

    #[test]
    fn test_doubles_until_cap() {
        let mut backoff = no_jitter();
        assert_eq!(backoff.next_delay(), Duration::from_secs(1));
        assert_eq!(backoff.next_delay(), Duration::from_secs(2));
        assert_eq!(backoff.next_delay(), Duration::from_secs(4));
        assert_eq!(backoff.next_delay(), Duration::from_secs(8));
        assert_eq!(backoff.next_delay(), Duration::from_secs(16));
        assert_eq!(backoff.next_delay(), Duration::from_secs(30));
        assert_eq!(backoff.next_delay(), Duration::from_secs(30));
    }

    #[test]
    fn test_reset_rewinds() {
        let mut backoff = no_jitter();
        backoff.next_delay();
        backoff.next_delay();
        backoff.reset();
        assert_eq!(backoff.next_delay(), Duration::from_secs(1));
    }

    #[test]
    fn test_jitter_stays_in_band() {
        let mut backoff = ExponentialBackoff::new(&BackoffConfig {
            base: Duration::from_secs(1),
            cap: Duration::from_secs(30),
            jitter: 0.2,
        });
        for _ in 0..50 {
            backoff.reset();
            let delay = backoff.next_delay();
            assert!(delay >= Duration::from_millis(800), "delay {delay:?}");
            assert!(delay <= Duration::from_millis(1200), "delay {delay:?}");
        }
    }
}
