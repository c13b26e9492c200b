// src/status.rs
//! Read-only views over job state for pollers and dashboards.

use crate::broker::Broker;
use crate::{JobFailure, JobId, JobRecord, JobState, Result};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::sync::Arc;

/// Number of jobs in each state for one queue.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct JobCounts {
    pub waiting: usize,
    pub delayed: usize,
    pub active: usize,
    pub completed: usize,
    pub failed: usize,
}

impl JobCounts {
    pub fn total(&self) -> usize {
        self.waiting + self.delayed + self.active + self.completed + self.failed
    }
}

/// What a status poller sees for one job.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct JobStatusView {
    pub id: JobId,
    pub name: String,
    pub state: JobState,
    pub progress: Option<serde_json::Value>,
    pub attempts_made: u32,
    pub last_error: Option<JobFailure>,
    pub processed_at: Option<DateTime<Utc>>,
    pub finished_at: Option<DateTime<Utc>>,
}

impl From<JobRecord> for JobStatusView {
    fn from(job: JobRecord) -> Self {
        Self {
            id: job.id,
            name: job.name,
            state: job.state,
            progress: job.progress,
            attempts_made: job.attempts_made,
            last_error: job.last_error,
            processed_at: job.processed_at,
            finished_at: job.finished_at,
        }
    }
}

/// Never mutates anything; every call is a plain read against the store.
#[derive(Clone)]
pub struct JobInspector {
    broker: Arc<dyn Broker>,
}

impl JobInspector {
    pub fn new(broker: Arc<dyn Broker>) -> Self {
        Self { broker }
    }

    /// `None` for unknown or pruned ids.
    pub async fn get_state(&self, id: &JobId) -> Result<Option<JobStatusView>> {
        Ok(self.broker.get_job(id).await?.map(JobStatusView::from))
    }

    pub async fn get_progress(&self, id: &JobId) -> Result<Option<serde_json::Value>> {
        Ok(self.broker.get_job(id).await?.and_then(|job| job.progress))
    }

    pub async fn get_counts(&self, queue_name: &str) -> Result<JobCounts> {
        self.broker.counts(queue_name).await
    }
}
