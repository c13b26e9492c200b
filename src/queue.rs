// src/queue.rs
use crate::broker::{Broker, RedisBroker};
use crate::repeat::{RepeatOptions, RepeatableRegistration};
use crate::scheduler::Scheduler;
use crate::status::{JobCounts, JobInspector};
use crate::{Job, JobId, JobOptions, JobRecord, JobState, RelayError, Result};
use chrono::{DateTime, Utc};
use serde::Serialize;
use std::sync::Arc;
use tracing::{debug, info};

/// Options for queue configuration
#[derive(Debug, Clone)]
pub struct QueueOptions {
    pub name: String,
    pub redis_url: String,
    pub key_prefix: String,
    /// Used by `enqueue` for job types that keep the trait's default options.
    pub default_job_options: JobOptions,
}

impl Default for QueueOptions {
    fn default() -> Self {
        Self {
            name: "default".to_string(),
            redis_url: "redis://127.0.0.1:6379".to_string(),
            key_prefix: "rmq".to_string(),
            default_job_options: JobOptions::default(),
        }
    }
}

/// Producer-facing handle on one named queue. Adding never waits for
/// execution.
#[derive(Clone)]
pub struct Queue {
    broker: Arc<dyn Broker>,
    options: QueueOptions,
}

impl Queue {
    /// Connect to Redis using `options.redis_url`.
    pub async fn connect(options: QueueOptions) -> Result<Self> {
        let broker = RedisBroker::connect(&options.redis_url, options.key_prefix.clone()).await?;
        Ok(Self::with_broker(Arc::new(broker), options))
    }

    pub fn with_broker(broker: Arc<dyn Broker>, options: QueueOptions) -> Self {
        Self { broker, options }
    }

    pub fn name(&self) -> &str {
        &self.options.name
    }

    pub fn broker(&self) -> Arc<dyn Broker> {
        Arc::clone(&self.broker)
    }

    pub fn scheduler(&self) -> Scheduler {
        Scheduler::new(Arc::clone(&self.broker), self.options.name.clone())
    }

    pub fn inspector(&self) -> JobInspector {
        JobInspector::new(Arc::clone(&self.broker))
    }

    /// Enqueue a typed job with its default options
    pub async fn enqueue<T: Job>(&self, job: T) -> Result<JobRecord> {
        self.enqueue_with_options(job, T::default_options()).await
    }

    /// Enqueue a typed job with custom options
    pub async fn enqueue_with_options<T: Job>(&self, job: T, options: JobOptions) -> Result<JobRecord> {
        self.add(T::name(), &job, options).await
    }

    /// Enqueue a job under `name` with the queue's default options.
    pub async fn add_default(&self, name: &str, payload: impl Serialize) -> Result<JobRecord> {
        self.add(name, payload, self.options.default_job_options.clone())
            .await
    }

    /// Validate, persist and return the new job. A job with `repeat` set
    /// registers the rule and enqueues its first occurrence as delayed.
    pub async fn add(
        &self,
        name: &str,
        payload: impl Serialize,
        options: JobOptions,
    ) -> Result<JobRecord> {
        if name.is_empty() {
            return Err(RelayError::InvalidOptions(
                "job name must not be empty".to_string(),
            ));
        }
        options.validate()?;
        let payload = serde_json::to_value(payload)?;
        let now = Utc::now();

        if let Some(repeat) = options.repeat.clone() {
            return self
                .add_first_occurrence(name, payload, repeat, options, now)
                .await;
        }

        let job = JobRecord::new(self.options.name.clone(), name, payload, options, now);
        self.broker.add_job(&job, job.due_at()).await?;

        info!(
            job_id = %job.id,
            job_name = %job.name,
            queue = %job.queue_name,
            state = %job.state,
            "Job enqueued"
        );
        Ok(job)
    }

    async fn add_first_occurrence(
        &self,
        name: &str,
        payload: serde_json::Value,
        repeat: RepeatOptions,
        options: JobOptions,
        now: DateTime<Utc>,
    ) -> Result<JobRecord> {
        let first = repeat.next_after(now)?;
        let registration = RepeatableRegistration {
            key: repeat.registration_key(name),
            queue_name: self.options.name.clone(),
            name: name.to_string(),
            payload,
            repeat: repeat.clone(),
            options: JobOptions {
                repeat: None,
                ..options
            },
            next_fire_at: repeat.next_after(first)?,
        };
        self.broker.upsert_repeatable(&registration).await?;

        let mut job = registration.materialize(first, now);
        job.state = JobState::Delayed;
        if !self.broker.add_job(&job, Some(first)).await? {
            debug!(job_id = %job.id, key = %registration.key, "Occurrence already enqueued");
            return Ok(self.broker.get_job(&job.id).await?.unwrap_or(job));
        }

        info!(
            job_id = %job.id,
            key = %registration.key,
            fire_at = %first,
            "Repeatable job enqueued"
        );
        Ok(job)
    }

    /// Register (or replace) a cron rule. Jobs are materialized by the
    /// scheduler when each occurrence is due.
    pub async fn add_repeatable(
        &self,
        repeat: RepeatOptions,
        name: &str,
        payload: impl Serialize,
        options: JobOptions,
    ) -> Result<RepeatableRegistration> {
        if name.is_empty() {
            return Err(RelayError::InvalidOptions(
                "job name must not be empty".to_string(),
            ));
        }
        let options = JobOptions {
            repeat: None,
            delay_ms: None,
            ..options
        };
        options.validate()?;

        let registration = RepeatableRegistration {
            key: repeat.registration_key(name),
            queue_name: self.options.name.clone(),
            name: name.to_string(),
            payload: serde_json::to_value(payload)?,
            next_fire_at: repeat.next_after(Utc::now())?,
            repeat,
            options,
        };
        self.broker.upsert_repeatable(&registration).await?;

        info!(
            key = %registration.key,
            queue = %registration.queue_name,
            next_fire_at = %registration.next_fire_at,
            "Repeatable registered"
        );
        Ok(registration)
    }

    pub async fn remove_repeatable(&self, key: &str) -> Result<bool> {
        self.broker.remove_repeatable(&self.options.name, key).await
    }

    /// Drop every registration of this queue; run at process start before
    /// re-registering so stale rules do not survive a restart.
    pub async fn clear_all_repeatables(&self) -> Result<usize> {
        let removed = self.broker.clear_repeatables(&self.options.name).await?;
        if removed > 0 {
            info!(queue = %self.options.name, removed, "Cleared repeatables");
        }
        Ok(removed)
    }

    pub async fn repeatables(&self) -> Result<Vec<RepeatableRegistration>> {
        self.broker.repeatables(&self.options.name).await
    }

    /// Get job by ID; `None` when it does not exist.
    pub async fn get_job(&self, job_id: &JobId) -> Result<Option<JobRecord>> {
        self.broker.get_job(job_id).await
    }

    pub async fn get_job_counts(&self) -> Result<JobCounts> {
        self.broker.counts(&self.options.name).await
    }

    /// Move delayed jobs that are due to waiting
    pub async fn promote_due_jobs(&self) -> Result<Vec<JobId>> {
        self.scheduler().promote_due_jobs(Utc::now()).await
    }
}
