//! Capped exponential backoff.
//!
//! Used by the replicator retry loop, the outbound transport reconnect
//! loop and the catch-up client. The delay after `k` increments starting
//! from `base` is `min(base * 2^k, upper)`.

use std::time::Duration;

use rand::Rng;

/// A capped exponential backoff sequence.
#[derive(Debug, Clone)]
pub struct Backoff {
    base: Duration,
    upper: Duration,
    current: Duration,
}

impl Backoff {
    pub fn new(base: Duration, upper: Duration) -> Self {
        debug_assert!(base <= upper);
        Self {
            base,
            upper,
            current: base,
        }
    }

    /// The current delay, without advancing the sequence.
    pub fn delay(&self) -> Duration {
        self.current
    }

    /// Advance the sequence, returning the delay that was current before
    /// the increment.
    pub fn increment(&mut self) -> Duration {
        let delay = self.current;
        self.current = std::cmp::min(self.current.saturating_mul(2), self.upper);
        delay
    }

    /// Reset the sequence back to the base delay.
    pub fn reset(&mut self) {
        self.current = self.base;
    }

    /// The current delay with up to 20% random jitter added, to avoid
    /// synchronized retry storms across members.
    pub fn jittered_delay(&self) -> Duration {
        let jitter_ceil = (self.current.as_millis() / 5) as u64;
        if jitter_ceil == 0 {
            return self.current;
        }
        let jitter = rand::thread_rng().gen_range(0..=jitter_ceil);
        self.current + Duration::from_millis(jitter)
    }
}
