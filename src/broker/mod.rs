// src/broker/mod.rs
//! Store adapter: the atomic primitives the queue, scheduler and worker
//! coordinate through. Every mutating call is a single atomic operation at
//! the store.

pub mod memory;
pub mod redis;

use crate::rate_limit::RateLimit;
use crate::repeat::RepeatableRegistration;
use crate::status::JobCounts;
use crate::{JobFailure, JobId, JobRecord, Result};
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::time::Duration;

pub use self::memory::MemoryBroker;
pub use self::redis::RedisBroker;

/// Outcome of an attempt to claim the next waiting job.
#[derive(Debug, Clone, PartialEq)]
pub enum Claim {
    /// The job is now `active` and held by the caller.
    Job(Box<JobRecord>),
    /// Nothing is waiting.
    Empty,
    /// A job is waiting but the queue's rate limit window is full.
    Throttled(Duration),
}

/// Transition out of `active`, applied by the holder of the job.
#[derive(Debug, Clone, PartialEq)]
pub enum Transition {
    Complete {
        finished_at: DateTime<Utc>,
        keep: Option<usize>,
    },
    Retry {
        due_at: DateTime<Utc>,
        failure: JobFailure,
    },
    Fail {
        finished_at: DateTime<Utc>,
        failure: JobFailure,
        keep: Option<usize>,
    },
}

/// Lightweight notification published on every state change.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct BrokerEvent {
    pub queue: String,
    pub job_id: JobId,
    pub kind: BrokerEventKind,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum BrokerEventKind {
    Added,
    Promoted,
    Active,
    Progress,
    Completed,
    Retrying,
    Failed,
}

#[async_trait]
pub trait Broker: Send + Sync {
    /// Persist a new job and push it to the waiting list, or to the delayed
    /// set when `due_at` is given. Returns `false` if a job with the same id
    /// already exists.
    async fn add_job(&self, job: &JobRecord, due_at: Option<DateTime<Utc>>) -> Result<bool>;

    /// Atomically move the next waiting job to `active`, incrementing its
    /// `attempts_made`. Two callers never receive the same job.
    async fn claim(
        &self,
        queue: &str,
        worker_id: &str,
        limit: Option<&RateLimit>,
        now: DateTime<Utc>,
    ) -> Result<Claim>;

    /// Move an active job to its next state. Fails with `NotActive` if the
    /// job is not in the active set.
    async fn transition(&self, job: &JobRecord, transition: Transition) -> Result<()>;

    /// Atomically move every delayed job due at or before `now` to waiting.
    async fn promote_due(&self, queue: &str, now: DateTime<Utc>) -> Result<Vec<JobId>>;

    async fn get_job(&self, id: &JobId) -> Result<Option<JobRecord>>;

    async fn update_progress(
        &self,
        queue: &str,
        id: &JobId,
        progress: serde_json::Value,
    ) -> Result<()>;

    async fn counts(&self, queue: &str) -> Result<JobCounts>;

    /// Insert or replace the registration with the same key.
    async fn upsert_repeatable(&self, registration: &RepeatableRegistration) -> Result<()>;

    async fn remove_repeatable(&self, queue: &str, key: &str) -> Result<bool>;

    async fn clear_repeatables(&self, queue: &str) -> Result<usize>;

    async fn repeatables(&self, queue: &str) -> Result<Vec<RepeatableRegistration>>;

    /// Fire one occurrence: only if the stored registration still expects
    /// `registration.next_fire_at`, advance it to `next_fire_at` and enqueue
    /// `job` as waiting. Returns `false` when another scheduler got there first.
    async fn fire_repeatable(
        &self,
        registration: &RepeatableRegistration,
        next_fire_at: DateTime<Utc>,
        job: &JobRecord,
    ) -> Result<bool>;
}
