//! Truncated exponential backoff with jitter for upstream reconnects

use rand::Rng;
use std::time::Duration;

use crate::config::IngestConfig;

#[derive(Debug, Clone)]
pub struct Backoff {
    base: Duration,
    cap: Duration,
    jitter: f64,
    attempt: u32,
}

impl Backoff {
    pub fn new(base: Duration, cap: Duration, jitter: f64) -> Self {
        Self {
            base,
            cap,
            jitter: jitter.clamp(0.0, 1.0),
            attempt: 0,
        }
    }

    pub fn from_config(config: &IngestConfig) -> Self {
        Self::new(config.backoff_base, config.backoff_cap, config.backoff_jitter)
    }

    /// Un-jittered delay for the current attempt: base * 2^attempt, capped
    pub fn nominal_delay(&self) -> Duration {
        let factor = 2u32.saturating_pow(self.attempt.min(16));
        self.base.saturating_mul(factor).min(self.cap)
    }

    /// Delay to wait before the next attempt; advances the attempt counter
    pub fn next_delay<R: Rng + ?Sized>(&mut self, rng: &mut R) -> Duration {
        let nominal = self.nominal_delay();
        self.attempt = self.attempt.saturating_add(1);
        if self.jitter == 0.0 {
            return nominal;
        }
        let factor = 1.0 + rng.gen_range(-self.jitter..=self.jitter);
        nominal.mul_f64(factor)
    }

    pub fn reset(&mut self) {
        self.attempt = 0;
    }

    pub fn attempt(&self) -> u32 {
        self.attempt
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rand::rngs::StdRng;
    use rand::SeedableRng;

    #[test]
    fn test_doubles_until_cap() {
        let mut backoff = Backoff::new(Duration::from_secs(1), Duration::from_secs(30), 0.0);
        let mut rng = StdRng::seed_from_u64(1);
        let delays: Vec<u64> = (0..7).map(|_| backoff.next_delay(&mut rng).as_secs()).collect();
        assert_eq!(delays, vec![1, 2, 4, 8, 16, 30, 30]);
    }

    #[test]
    fn test_jitter_within_twenty_percent() {
        let mut backoff = Backoff::new(Duration::from_secs(1), Duration::from_secs(30), 0.2);
        let mut rng = StdRng::seed_from_u64(7);
        for _ in 0..50 {
            let nominal = backoff.nominal_delay().as_secs_f64();
            let delay = backoff.next_delay(&mut rng).as_secs_f64();
            assert!(delay >= nominal * 0.8 - 1e-9, "{delay} below {nominal}");
            assert!(delay <= nominal * 1.2 + 1e-9, "{delay} above {nominal}");
        }
        // Deep into the sequence the ceiling still holds.
        assert!(backoff.next_delay(&mut rng) <= Duration::from_secs(36));
    }

    #[test]
    fn test_reset() {
        let mut backoff = Backoff::new(Duration::from_secs(1), Duration::from_secs(30), 0.0);
        let mut rng = StdRng::seed_from_u64(3);
        backoff.next_delay(&mut rng);
        backoff.next_delay(&mut rng);
        assert_eq!(backoff.attempt(), 2);

        backoff.reset();
        assert_eq!(backoff.next_delay(&mut rng), Duration::from_secs(1));
    }
}
