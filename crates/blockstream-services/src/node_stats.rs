//! Per-node EndOfStream rate limiting.

use std::collections::VecDeque;
use std::time::Duration;

use tokio::time::Instant;

/// Sliding window of EndOfStream timestamps for one block node.
#[derive(Debug, Default)]
pub struct EndOfStreamStats {
    events: VecDeque<Instant>,
}

impl EndOfStreamStats {
    pub fn new() -> Self {
        Self::default()
    }

    /// Record one EndOfStream at `now` and report whether more than
    /// `max_allowed` fell inside `window`.
    pub fn record_and_check(&mut self, now: Instant, window: Duration, max_allowed: usize) -> bool {
        self.events.push_back(now);
        while let Some(front) = self.events.front() {
            if now.duration_since(*front) > window {
                self.events.pop_front();
            } else {
                break;
            }
        }
        self.events.len() > max_allowed
    }

    pub fn count(&self) -> usize {
        self.events.len()
    }
}
