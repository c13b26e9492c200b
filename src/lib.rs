// src/lib.rs
//! relaymq: a Redis-backed job queue for Rust
//!
//! Producers add named jobs with JSON payloads; workers claim them with a
//! fixed concurrency, retry failures with backoff, honor a queue-wide rate
//! limit and fire cron-style repeatable jobs. All coordination happens in
//! the store, so any number of producers, workers and schedulers can share
//! a queue.

pub mod backoff;
pub mod broker;
pub mod config;
pub mod context;
pub mod error;
pub mod job;
pub mod lua;
pub mod queue;
pub mod rate_limit;
pub mod registry;
pub mod repeat;
pub mod scheduler;
pub mod status;
pub mod worker;

pub use backoff::{Backoff, BackoffStrategy};
pub use broker::{Broker, BrokerEvent, BrokerEventKind, MemoryBroker, RedisBroker};
pub use config::{BrokerSettings, WorkerSettings};
pub use context::{AppContext, EmptyContext, JobContext};
pub use error::{RelayError, Result};
pub use job::{Job, JobFailure, JobId, JobOptions, JobRecord, JobState};
pub use queue::{Queue, QueueOptions};
pub use rate_limit::RateLimit;
pub use registry::JobRegistry;
pub use repeat::{RepeatOptions, RepeatableRegistration};
pub use scheduler::{Scheduler, TickSummary};
pub use status::{JobCounts, JobInspector, JobStatusView};
pub use worker::{ShutdownReport, Worker, WorkerBuilder, WorkerConfig, WorkerEvent, WorkerStats};

// Re-export commonly used types
pub use async_trait::async_trait;
pub use serde::{Deserialize, Serialize};
