use rand::RngExt;
use std::time::Duration;

pub const JITTER_RATIO: f64 = 0.25;

/// Exponential backoff schedule shared by retrying callers:
/// `min(base * 2^attempt * (1 + jitter[-0.25, +0.25]), cap)`.
#[derive(Clone, Copy, Debug)]
pub struct Backoff {
    base: Duration,
    cap: Duration,
}
impl Backoff {
    pub const CAP_DEFAULT: Duration = Duration::from_secs(30);

    pub fn new(
        base: Duration,
        cap: Duration,
    ) -> Self {
        Self { base, cap }
    }
    pub fn with_base(base: Duration) -> Self {
        Self::new(base, Self::CAP_DEFAULT)
    }

    /// Delay before retry number `attempt` (0-based).
    pub fn delay(
        &self,
        attempt: u32,
    ) -> Duration {
        let jitter = rand::rng().random_range(-JITTER_RATIO..=JITTER_RATIO);
        self.delay_with_jitter(attempt, jitter)
    }

    fn delay_with_jitter(
        &self,
        attempt: u32,
        jitter: f64,
    ) -> Duration {
        let exponent = attempt.min(32);
        let scaled = self.base.as_secs_f64() * 2.0f64.powi(exponent as i32);
        let jittered = scaled * (1.0 + jitter);

        Duration::from_secs_f64(jittered.max(0.0)).min(self.cap)
    }
}

#[cfg(test)]
mod tests {
    use super::{Backoff, JITTER_RATIO};
    use approx::assert_relative_eq;
    use std::time::Duration;

    #[test]
    fn grows_exponentially_without_jitter() {
        let backoff = Backoff::new(Duration::from_millis(100), Duration::from_secs(30));

        assert_relative_eq!(
            backoff.delay_with_jitter(0, 0.0).as_secs_f64(),
            0.1,
            epsilon = 1e-9
        );
        assert_relative_eq!(
            backoff.delay_with_jitter(3, 0.0).as_secs_f64(),
            0.8,
            epsilon = 1e-9
        );
    }

    #[test]
    fn caps_at_configured_maximum() {
        let backoff = Backoff::with_base(Duration::from_secs(1));

        assert_eq!(
            backoff.delay_with_jitter(20, JITTER_RATIO),
            Duration::from_secs(30)
        );
    }

    #[test]
    fn jitter_stays_in_bounds() {
        let backoff = Backoff::new(Duration::from_secs(1), Duration::from_secs(300));

        for attempt in 0..8 {
            let nominal = backoff.delay_with_jitter(attempt, 0.0).as_secs_f64();
            for _ in 0..64 {
                let delay = backoff.delay(attempt).as_secs_f64();
                assert!(delay >= nominal * (1.0 - JITTER_RATIO) - 1e-9);
                assert!(delay <= nominal * (1.0 + JITTER_RATIO) + 1e-9);
            }
        }
    }
}
