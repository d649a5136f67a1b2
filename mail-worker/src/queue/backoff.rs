//! Exponential backoff shared by the publisher and the consumer reconnect loop.

use std::time::Duration;

/// Doubling delay with a ceiling.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Backoff {
    base: Duration,
    max: Duration,
}

impl Backoff {
    /// Publisher default: 500ms doubling, capped at 30s.
    pub const PUBLISH: Backoff = Backoff::new(Duration::from_millis(500), Duration::from_secs(30));

    /// Consumer reconnect default: 1s doubling, capped at 30s.
    pub const RECONNECT: Backoff = Backoff::new(Duration::from_secs(1), Duration::from_secs(30));

    pub const fn new(base: Duration, max: Duration) -> Self {
        Self { base, max }
    }

    /// Build from a `(base, max)` pair of milliseconds.
    pub fn from_millis((base, max): (u64, u64)) -> Self {
        Self::new(Duration::from_millis(base), Duration::from_millis(max))
    }

    pub fn base(&self) -> Duration {
        self.base
    }

    pub fn max(&self) -> Duration {
        self.max
    }

    /// Delay before retry `retry` (0-based): `base * 2^retry`, never above `max`.
    pub fn delay(&self, retry: u32) -> Duration {
        let factor = 2u32.checked_pow(retry).unwrap_or(u32::MAX);
        self.base
            .checked_mul(factor)
            .unwrap_or(self.max)
            .min(self.max)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_delay_doubles_from_base() {
        let backoff = Backoff::PUBLISH;
        let delays: Vec<u128> = (0..5).map(|n| backoff.delay(n).as_millis()).collect();

        assert_eq!(delays, vec![500, 1000, 2000, 4000, 8000]);
    }

    #[test]
    fn test_delay_is_capped() {
        let backoff = Backoff::RECONNECT;

        assert_eq!(backoff.delay(4), Duration::from_secs(16));
        assert_eq!(backoff.delay(5), Duration::from_secs(30));
        assert_eq!(backoff.delay(40), Duration::from_secs(30));
        assert_eq!(backoff.delay(u32::MAX), Duration::from_secs(30));
    }

    #[test]
    fn test_from_millis() {
        let backoff = Backoff::from_millis((250, 1000));

        assert_eq!(backoff.base(), Duration::from_millis(250));
        assert_eq!(backoff.delay(3), Duration::from_millis(1000));
    }
}
