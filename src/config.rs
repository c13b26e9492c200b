// src/config.rs
//! Process-level settings read from flags or `RELAYMQ_*` environment
//! variables. Library callers can skip this and use the builders directly.

use crate::rate_limit::RateLimit;
use crate::{QueueOptions, Result};
use clap::Args;
use std::time::Duration;

/// Where the store lives.
#[derive(Debug, Clone, Args)]
pub struct BrokerSettings {
    /// Redis connection URL
    #[arg(long, env = "RELAYMQ_REDIS_URL", default_value = "redis://127.0.0.1:6379")]
    pub redis_url: String,

    /// Prefix for every key the queue writes
    #[arg(long, env = "RELAYMQ_KEY_PREFIX", default_value = "rmq")]
    pub key_prefix: String,
}

impl Default for BrokerSettings {
    fn default() -> Self {
        let defaults = QueueOptions::default();
        Self {
            redis_url: defaults.redis_url,
            key_prefix: defaults.key_prefix,
        }
    }
}

/// Worker tuning.
#[derive(Debug, Clone, Args)]
pub struct WorkerSettings {
    /// Queue to consume
    #[arg(long, env = "RELAYMQ_QUEUE", default_value = "default")]
    pub queue: String,

    /// Jobs processed in parallel
    #[arg(long, env = "RELAYMQ_CONCURRENCY", default_value_t = 10)]
    pub concurrency: usize,

    /// Max jobs started per rate-limit window; unset disables the limit
    #[arg(long, env = "RELAYMQ_RATE_LIMIT_MAX")]
    pub rate_limit_max: Option<u32>,

    #[arg(long, env = "RELAYMQ_RATE_LIMIT_WINDOW_MS", default_value_t = 1000)]
    pub rate_limit_window_ms: u64,

    /// Idle sleep between claim attempts
    #[arg(long, env = "RELAYMQ_POLL_INTERVAL_MS", default_value_t = 100)]
    pub poll_interval_ms: u64,

    /// How long close() waits for in-flight jobs
    #[arg(long, env = "RELAYMQ_SHUTDOWN_TIMEOUT_MS", default_value_t = 30_000)]
    pub shutdown_timeout_ms: u64,
}

impl Default for WorkerSettings {
    fn default() -> Self {
        Self {
            queue: "default".to_string(),
            concurrency: 10,
            rate_limit_max: None,
            rate_limit_window_ms: 1000,
            poll_interval_ms: 100,
            shutdown_timeout_ms: 30_000,
        }
    }
}

impl WorkerSettings {
    pub fn rate_limit(&self) -> Result<Option<RateLimit>> {
        self.rate_limit_max
            .map(|max| RateLimit::new(max, Duration::from_millis(self.rate_limit_window_ms)))
            .transpose()
    }

    pub fn poll_interval(&self) -> Duration {
        Duration::from_millis(self.poll_interval_ms)
    }

    pub fn shutdown_timeout(&self) -> Duration {
        Duration::from_millis(self.shutdown_timeout_ms)
    }
}
