// src/backoff.rs
use serde::{Deserialize, Serialize};
use std::time::Duration;

/// Backoff strategies for job retries
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "lowercase")]
pub enum BackoffStrategy {
    /// Every retry waits `base_delay_ms`.
    Fixed { base_delay_ms: u64 },
    /// The retry before attempt `n` waits `base_delay_ms * 2^(n-2)`.
    Exponential { base_delay_ms: u64 },
}

impl BackoffStrategy {
    pub fn fixed(delay: Duration) -> Self {
        BackoffStrategy::Fixed {
            base_delay_ms: delay.as_millis() as u64,
        }
    }

    pub fn exponential(base: Duration) -> Self {
        BackoffStrategy::Exponential {
            base_delay_ms: base.as_millis() as u64,
        }
    }

    /// Delay to wait before starting `attempt` (1-based). The first attempt
    /// never waits.
    pub fn delay_before_attempt(&self, attempt: u32) -> Duration {
        if attempt < 2 {
            return Duration::ZERO;
        }
        match *self {
            BackoffStrategy::Fixed { base_delay_ms } => Duration::from_millis(base_delay_ms),
            BackoffStrategy::Exponential { base_delay_ms } => {
                let factor = 2u64.checked_pow(attempt - 2).unwrap_or(u64::MAX);
                Duration::from_millis(base_delay_ms.saturating_mul(factor))
            }
        }
    }
}

impl Default for BackoffStrategy {
    fn default() -> Self {
        BackoffStrategy::Exponential {
            base_delay_ms: 1000,
        }
    }
}

/// Convenience type alias
pub type Backoff = BackoffStrategy;

/// Decide what happens after a failed attempt.
///
/// Returns `None` once `attempts_made` has reached `max_attempts`: the job is
/// exhausted and must be failed. Otherwise returns the delay before the next
/// attempt.
pub fn next_delay(
    attempts_made: u32,
    max_attempts: u32,
    backoff: &BackoffStrategy,
) -> Option<Duration> {
    if attempts_made >= max_attempts {
        return None;
    }
    Some(backoff.delay_before_attempt(attempts_made + 1))
}
