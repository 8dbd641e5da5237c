//! Reconnect delay schedule: exponential, capped, jittered.

use std::time::Duration;

use rand::Rng;

/// Reconnect timing parameters.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct BackoffConfig {
    pub base: Duration,
    pub max: Duration,
    /// Upper bound of the random extra delay, as a fraction of the computed
    /// delay (0.2 = up to 20% more).
    pub jitter: f64,
}

impl Default for BackoffConfig {
    fn default() -> Self {
        Self {
            base: Duration::from_secs(1),
            max: Duration::from_secs(30),
            jitter: 0.2,
        }
    }
}

/// Attempt counter plus the delay formula
/// `min(max, base × 2^attempts) + jitter`.
#[derive(Debug, Clone)]
pub struct Backoff {
    config: BackoffConfig,
    attempts: u32,
}

impl Backoff {
    pub fn new(config: BackoffConfig) -> Self {
        Self {
            config,
            attempts: 0,
        }
    }

    /// Delay before jitter for a given attempt number.
    pub fn base_delay(&self, attempts: u32) -> Duration {
        let factor = 1u32.checked_shl(attempts).unwrap_or(u32::MAX);
        self.config
            .base
            .checked_mul(factor)
            .unwrap_or(self.config.max)
            .min(self.config.max)
    }

    /// Delay for the next attempt, consuming it.
    pub fn next_delay(&mut self, rng: &mut impl Rng) -> Duration {
        let delay = self.base_delay(self.attempts);
        self.attempts = self.attempts.saturating_add(1);
        let jitter = if self.config.jitter > 0.0 {
            delay.mul_f64(rng.gen_range(0.0..self.config.jitter))
        } else {
            Duration::ZERO
        };
        delay + jitter
    }

    /// Back to the base delay; called on every successful open.
    pub fn reset(&mut self) {
        self.attempts = 0;
    }

    pub fn attempts(&self) -> u32 {
        self.attempts
    }

    pub fn config(&self) -> &BackoffConfig {
        &self.config
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rand::rngs::StdRng;
    use rand::SeedableRng;

    #[test]
    fn base_delay_doubles_then_clamps() {
        let b = Backoff::new(BackoffConfig::default());
        let secs: Vec<u64> = (0..8).map(|n| b.base_delay(n).as_secs()).collect();
        assert_eq!(secs, vec![1, 2, 4, 8, 16, 30, 30, 30]);
    }

    #[test]
    fn base_delay_is_monotonic_and_never_overflows() {
        let b = Backoff::new(BackoffConfig::default());
        let mut prev = Duration::ZERO;
        for n in 0..200 {
            let d = b.base_delay(n);
            assert!(d >= prev);
            assert!(d <= b.config().max);
            prev = d;
        }
    }

    #[test]
    fn jitter_stays_within_twenty_percent() {
        let mut rng = StdRng::seed_from_u64(7);
        let mut b = Backoff::new(BackoffConfig::default());
        for n in 0..10 {
            let base = b.base_delay(n);
            let d = b.next_delay(&mut rng);
            assert!(d >= base);
            assert!(d < base + base.mul_f64(0.2) + Duration::from_nanos(1));
        }
    }

    #[test]
    fn reset_returns_to_base_delay() {
        let mut rng = StdRng::seed_from_u64(1);
        let mut b = Backoff::new(BackoffConfig {
            jitter: 0.0,
            ..BackoffConfig::default()
        });
        for _ in 0..4 {
            b.next_delay(&mut rng);
        }
        assert_eq!(b.attempts(), 4);
        b.reset();
        assert_eq!(b.next_delay(&mut rng), Duration::from_secs(1));
    }
}
