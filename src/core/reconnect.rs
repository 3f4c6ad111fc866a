use std::time::Duration;

use rand::{Rng, SeedableRng, rngs::SmallRng};

use super::types::WsReconnectStrategy;

/// Simple exponential backoff reconnect strategy.
///
/// Policy lives here, not in the connection: the transport client drives it after a
/// drop and resets it once a handshake succeeds.
#[derive(Clone, Debug)]
pub struct ExponentialBackoffReconnect {
    base: Duration,
    max: Duration,
    factor: f64,
    current: Duration,
    max_attempts: Option<u32>,
    attempts: u32,
}

impl ExponentialBackoffReconnect {
    pub fn new(base: Duration, max: Duration, factor: f64) -> Self {
        let factor = if factor.is_finite() && factor > 1.0 {
            factor
        } else {
            1.5
        };
        Self {
            base,
            max,
            factor,
            current: base,
            max_attempts: None,
            attempts: 0,
        }
    }

    /// Give up after `attempts` consecutive failed reconnects.
    pub fn with_max_attempts(mut self, attempts: u32) -> Self {
        self.max_attempts = Some(attempts);
        self
    }

    pub fn attempts(&self) -> u32 {
        self.attempts
    }
}

impl Default for ExponentialBackoffReconnect {
    fn default() -> Self {
        Self::new(Duration::from_secs(1), Duration::from_secs(30), 1.5)
    }
}

impl WsReconnectStrategy for ExponentialBackoffReconnect {
    fn next_delay(&mut self) -> Duration {
        let delay = self.current;
        // Past what a Duration holds means past any cap.
        self.current = Duration::try_from_secs_f64(self.current.as_secs_f64() * self.factor)
            .map_or(self.max, |next| next.min(self.max));
        self.attempts = self.attempts.saturating_add(1);
        delay
    }

    fn reset(&mut self) {
        self.current = self.base;
        self.attempts = 0;
    }

    fn should_retry(&self) -> bool {
        self.max_attempts.is_none_or(|max| self.attempts < max)
    }
}

/// Reconnect strategy that never retries.
#[derive(Clone, Copy, Debug, Default)]
pub struct NoReconnect;

impl WsReconnectStrategy for NoReconnect {
    fn next_delay(&mut self) -> Duration {
        Duration::from_secs(24 * 60 * 60)
    }

    fn reset(&mut self) {}

    fn should_retry(&self) -> bool {
        false
    }
}

/// Scale `base` by a random factor in `[0.5, 1.0]` so reconnecting clients spread out.
pub fn jitter_delay(base: Duration) -> Duration {
    if base.is_zero() {
        return base;
    }

    let mut rng = SmallRng::from_entropy();
    let jitter: f64 = rng.gen_range(0.5..=1.0);
    let nanos = (base.as_nanos() as f64 * jitter) as u128;
    Duration::from_nanos(nanos.min(u64::MAX as u128) as u64)
}
