//! Per-connection fixed-window message throttle

use std::time::{Duration, Instant};

/// Fixed-window message counter.
///
/// The window opens at the first message after the previous window ended;
/// at most `max_messages` messages are admitted per window.
#[derive(Debug)]
pub struct RateLimiter {
    window: Duration,
    max_messages: u32,
    window_start: Instant,
    count: u32,
}

impl RateLimiter {
    pub fn new(window: Duration, max_messages: u32) -> Self {
        Self {
            window,
            max_messages,
            window_start: Instant::now(),
            count: 0,
        }
    }

    /// Record one message now; returns whether it is admitted
    pub fn check(&mut self) -> bool {
        self.check_at(Instant::now())
    }

    /// Record one message at `now`; returns whether it is admitted
    pub fn check_at(&mut self, now: Instant) -> bool {
        if now.saturating_duration_since(self.window_start) > self.window {
            self.window_start = now;
            self.count = 1;
            return true;
        }

        self.count = self.count.saturating_add(1);
        self.count <= self.max_messages
    }

    /// Messages counted in the current window
    pub fn count(&self) -> u32 {
        self.count
    }
}
