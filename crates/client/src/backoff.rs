use std::time::Duration;

use {
    gatelink_config::ReconnectConfig,
    rand::{Rng, SeedableRng, rngs::StdRng},
};

/// Jittered exponential backoff between reconnect attempts.
///
/// Attempt `n` waits roughly `base * factor^n` within `±jitter`, capped at
/// `cap`. Delays never shrink between resets, so jitter cannot make a later
/// attempt fire sooner than an earlier one.
#[derive(Debug)]
pub struct Backoff {
    base: Duration,
    factor: f64,
    cap: Duration,
    jitter: f64,
    attempt: u32,
    last: Duration,
    rng: StdRng,
}

impl Backoff {
    pub fn new(config: &ReconnectConfig) -> Self {
        Self::with_rng(config, StdRng::from_os_rng())
    }

    /// Deterministic jitter, for tests.
    pub fn with_seed(config: &ReconnectConfig, seed: u64) -> Self {
        Self::with_rng(config, StdRng::seed_from_u64(seed))
    }

    fn with_rng(config: &ReconnectConfig, rng: StdRng) -> Self {
        Self {
            base: Duration::from_millis(config.base_ms),
            factor: config.factor,
            cap: Duration::from_millis(config.cap_ms),
            jitter: config.jitter.clamp(0.0, 0.99),
            attempt: 0,
            last: Duration::ZERO,
            rng,
        }
    }

    /// Un-jittered delay for `attempt`.
    pub fn expected(&self, attempt: u32) -> Duration {
        let scaled = self.base.as_secs_f64() * self.factor.powi(attempt.min(64) as i32);
        if scaled.is_finite() && scaled < self.cap.as_secs_f64() {
            Duration::from_secs_f64(scaled)
        } else {
            self.cap
        }
    }

    pub fn next_delay(&mut self) -> Duration {
        let expected = self.expected(self.attempt).as_secs_f64();
        let spread = if self.jitter > 0.0 {
            self.rng.random_range(-self.jitter..=self.jitter)
        } else {
            0.0
        };
        let jittered = Duration::from_secs_f64((expected * (1.0 + spread)).max(0.0));
        let delay = jittered.min(self.cap).max(self.last);
        self.last = delay;
        self.attempt = self.attempt.saturating_add(1);
        delay
    }

    /// Back to the base delay after a successful connection.
    pub fn reset(&mut self) {
        self.attempt = 0;
        self.last = Duration::ZERO;
    }

    pub fn attempt(&self) -> u32 {
        self.attempt
    }
}

#[cfg(test)]
mod tests {
    use {super::*, rstest::rstest};

    fn config(jitter: f64) -> ReconnectConfig {
        ReconnectConfig {
            base_ms: 250,
            factor: 2.0,
            cap_ms: 30_000,
            jitter,
        }
    }

    #[test]
    fn without_jitter_delays_double_until_cap() {
        let mut backoff = Backoff::with_seed(&config(0.0), 1);
        let delays: Vec<u64> = (0..10)
            .map(|_| backoff.next_delay().as_millis() as u64)
            .collect();
        assert_eq!(delays, vec![
            250, 500, 1000, 2000, 4000, 8000, 16000, 30000, 30000, 30000
        ]);
    }

    #[rstest]
    #[case(1)]
    #[case(7)]
    #[case(42)]
    #[case(9001)]
    fn jittered_delays_stay_in_band_and_never_shrink(#[case] seed: u64) {
        let cfg = config(0.2);
        let mut backoff = Backoff::with_seed(&cfg, seed);
        let cap = Duration::from_millis(cfg.cap_ms);
        let mut previous = Duration::ZERO;
        for attempt in 0..20 {
            let expected = backoff.expected(attempt).as_secs_f64();
            let delay = backoff.next_delay();
            assert!(delay <= cap, "attempt {attempt}: {delay:?} above cap");
            assert!(delay >= previous, "attempt {attempt}: {delay:?} < {previous:?}");
            let secs = delay.as_secs_f64();
            assert!(
                secs <= expected * 1.2 + 1e-9,
                "attempt {attempt}: {secs} above band of {expected}"
            );
            // Monotonic clamping may lift a delay above its own band floor,
            // but never above the band ceiling checked above.
            assert!(secs >= expected * 0.8 - 1e-9 || secs == previous.as_secs_f64());
            previous = delay;
        }
    }

    #[test]
    fn reset_returns_to_base() {
        let mut backoff = Backoff::with_seed(&config(0.0), 3);
        for _ in 0..5 {
            backoff.next_delay();
        }
        assert_eq!(backoff.attempt(), 5);
        backoff.reset();
        assert_eq!(backoff.next_delay(), Duration::from_millis(250));
    }

    #[test]
    fn huge_attempt_counts_saturate_at_cap() {
        let backoff = Backoff::with_seed(&config(0.0), 0);
        assert_eq!(backoff.expected(10_000), Duration::from_millis(30_000));
    }
}
