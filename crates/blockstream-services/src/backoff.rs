//! Retry backoff for connection attempts.

use std::time::Duration;

use rand::Rng;

pub const INITIAL_RETRY_DELAY: Duration = Duration::from_secs(1);
pub const MAX_RETRY_DELAY: Duration = Duration::from_secs(10);
const RETRY_MULTIPLIER: u32 = 2;

/// Exponential backoff. Each step doubles the base delay up to the cap.
#[derive(Debug, Clone)]
pub struct RetryBackoff {
    current: Duration,
}

impl RetryBackoff {
    pub fn new() -> Self {
        Self::starting_at(Duration::ZERO)
    }

    pub fn starting_at(delay: Duration) -> Self {
        Self { current: delay }
    }

    pub fn current(&self) -> Duration {
        self.current
    }

    /// Advance and return the next base delay.
    pub fn next_delay(&mut self) -> Duration {
        self.current = if self.current.is_zero() {
            INITIAL_RETRY_DELAY
        } else {
            (self.current * RETRY_MULTIPLIER).min(MAX_RETRY_DELAY)
        };
        self.current
    }
}

impl Default for RetryBackoff {
    fn default() -> Self {
        Self::new()
    }
}

/// Half the delay plus a random share of the other half.
pub fn jittered(delay: Duration) -> Duration {
    let half = delay / 2;
    let extra_ms = rand::thread_rng().gen_range(0..=half.as_millis() as u64);
    half + Duration::from_millis(extra_ms)
}
