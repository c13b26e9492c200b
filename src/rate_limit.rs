// src/rate_limit.rs
//! Queue-wide cap on job starts per time window.

use crate::{RelayError, Result};
use std::time::Duration;

/// At most `max` job starts per `window`, shared by every worker of a queue.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RateLimit {
    pub max: u32,
    pub window: Duration,
}

impl RateLimit {
    pub fn new(max: u32, window: Duration) -> Result<Self> {
        if max == 0 {
            return Err(RelayError::Config(
                "rate limit max must be at least 1".to_string(),
            ));
        }
        if window.is_zero() {
            return Err(RelayError::Config(
                "rate limit window must be non-zero".to_string(),
            ));
        }
        Ok(Self { max, window })
    }

    pub fn window_ms(&self) -> u64 {
        (self.window.as_millis() as u64).max(1)
    }
}

/// Fixed-window counter used by stores without server-side expiry.
#[derive(Debug, Default, Clone)]
pub(crate) struct FixedWindow {
    started_at_ms: i64,
    count: u32,
}

impl FixedWindow {
    /// How long until another start fits, or `None` when one fits now.
    /// Checking never uses up budget.
    pub(crate) fn wait(&mut self, limit: &RateLimit, now_ms: i64) -> Option<Duration> {
        self.roll(limit, now_ms);
        if self.count >= limit.max {
            let remaining = self.started_at_ms + limit.window_ms() as i64 - now_ms;
            return Some(Duration::from_millis(remaining.max(1) as u64));
        }
        None
    }

    /// Count one start at `now_ms`.
    pub(crate) fn record(&mut self, limit: &RateLimit, now_ms: i64) {
        self.roll(limit, now_ms);
        self.count += 1;
    }

    fn roll(&mut self, limit: &RateLimit, now_ms: i64) {
        if self.count == 0 || now_ms - self.started_at_ms >= limit.window_ms() as i64 {
            self.started_at_ms = now_ms;
            self.count = 0;
        }
    }
}
