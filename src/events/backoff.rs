//! Reconnect backoff for broker consumers.

use std::time::Duration;

/// Exponent cap; beyond it the delay is pinned at `max` anyway
const MAX_EXPONENT: u32 = 10;

/// `min(max, base * 2^min(attempt, 10) * (1 + jitter))` with `jitter` in [0, 1)
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ReconnectBackoff {
    pub base: Duration,
    pub max: Duration,
}

impl Default for ReconnectBackoff {
    fn default() -> Self {
        Self {
            base: Duration::from_secs(1),
            max: Duration::from_secs(30),
        }
    }
}

impl ReconnectBackoff {
    pub fn new(base: Duration, max: Duration) -> Self {
        Self { base, max }
    }

    /// Delay before reconnect `attempt` (0-indexed) for a given jitter
    pub fn delay_for(&self, attempt: u32, jitter: f64) -> Duration {
        let jitter = if jitter.is_finite() {
            jitter.clamp(0.0, 1.0)
        } else {
            0.0
        };
        let factor = f64::from(1u32 << attempt.min(MAX_EXPONENT)) * (1.0 + jitter);
        let delay_ms = self.base.as_millis() as f64 * factor;
        let max_ms = self.max.as_millis() as f64;
        Duration::from_millis(delay_ms.min(max_ms) as u64)
    }

    /// Delay with fresh random jitter
    pub fn next_delay(&self, attempt: u32) -> Duration {
        self.delay_for(attempt, rand::random::<f64>())
    }
}

/// Reconnect attempt counter for one consumer loop
#[derive(Debug, Clone)]
pub struct ReconnectState {
    backoff: ReconnectBackoff,
    attempt: u32,
}

impl ReconnectState {
    pub fn new(backoff: ReconnectBackoff) -> Self {
        Self {
            backoff,
            attempt: 0,
        }
    }

    /// Failures since the last successful receive
    pub fn attempt(&self) -> u32 {
        self.attempt
    }

    /// Count a failure and return the delay before reconnecting
    pub fn on_failure(&mut self) -> Duration {
        let delay = self.backoff.next_delay(self.attempt);
        self.attempt = self.attempt.saturating_add(1);
        delay
    }

    /// A receive cycle succeeded; the next failure waits the base delay again
    pub fn on_success(&mut self) {
        self.attempt = 0;
    }
}
