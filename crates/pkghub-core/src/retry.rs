use rand::Rng;
use std::time::Duration;

/// Bounded exponential backoff with jitter.
///
/// The delay before retry `n` (1-based) is drawn uniformly from
/// `[d/2, d]` where `d = min(base * 2^(n-1), max)`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Backoff {
    pub base: Duration,
    pub max: Duration,
}

impl Backoff {
    pub fn new(base: Duration, max: Duration) -> Self {
        Self {
            base,
            max: max.max(base),
        }
    }

    pub fn from_millis(base_ms: u64, max_ms: u64) -> Self {
        Self::new(Duration::from_millis(base_ms), Duration::from_millis(max_ms))
    }

    /// Upper bound of the delay before retry `attempt`.
    pub fn ceiling(&self, attempt: u32) -> Duration {
        let factor = 1u32 << attempt.saturating_sub(1).min(16);
        self.base.saturating_mul(factor).min(self.max)
    }

    pub fn delay(&self, attempt: u32) -> Duration {
        let ceiling = self.ceiling(attempt);
        let ms = ceiling.as_millis() as u64;
        if ms < 2 {
            return ceiling;
        }
        Duration::from_millis(rand::rng().random_range(ms / 2..=ms))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn grows_then_caps() {
        let backoff = Backoff::from_millis(100, 1_000);
        assert_eq!(backoff.ceiling(1), Duration::from_millis(100));
        assert_eq!(backoff.ceiling(2), Duration::from_millis(200));
        assert_eq!(backoff.ceiling(4), Duration::from_millis(800));
        assert_eq!(backoff.ceiling(5), Duration::from_millis(1_000));
        assert_eq!(backoff.ceiling(60), Duration::from_millis(1_000));
    }

    #[test]
    fn jitter_stays_in_range() {
        let backoff = Backoff::from_millis(100, 1_000);
        for attempt in 1..8 {
            let ceiling = backoff.ceiling(attempt);
            let delay = backoff.delay(attempt);
            assert!(delay <= ceiling && delay >= ceiling / 2);
        }
        assert_eq!(Backoff::from_millis(0, 0).delay(3), Duration::ZERO);
    }
}
