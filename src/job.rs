// src/job.rs
use crate::backoff::BackoffStrategy;
use crate::repeat::RepeatOptions;
use crate::{JobContext, RelayError, Result};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::str::FromStr;
use uuid::Uuid;

/// Unique identifier for a job
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct JobId(pub Uuid);

impl JobId {
    pub fn new() -> Self {
        Self(Uuid::new_v4())
    }

    /// Deterministic id for one occurrence of a repeatable registration.
    pub fn for_occurrence(repeat_key: &str, fire_at: DateTime<Utc>) -> Self {
        let name = format!("{}:{}", repeat_key, fire_at.timestamp_millis());
        Self(Uuid::new_v5(&Uuid::NAMESPACE_OID, name.as_bytes()))
    }
}

impl Default for JobId {
    fn default() -> Self {
        Self::new()
    }
}

impl std::fmt::Display for JobId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl FromStr for JobId {
    type Err = RelayError;

    fn from_str(s: &str) -> Result<Self> {
        s.parse()
            .map(JobId)
            .map_err(|_| RelayError::Corrupt(format!("invalid job id '{}'", s)))
    }
}

/// Current state of a job
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum JobState {
    Waiting,
    Delayed,
    Active,
    Completed,
    Failed,
}

impl JobState {
    pub fn as_str(&self) -> &'static str {
        match self {
            JobState::Waiting => "waiting",
            JobState::Delayed => "delayed",
            JobState::Active => "active",
            JobState::Completed => "completed",
            JobState::Failed => "failed",
        }
    }

    pub fn is_terminal(&self) -> bool {
        matches!(self, JobState::Completed | JobState::Failed)
    }
}

impl std::fmt::Display for JobState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for JobState {
    type Err = RelayError;

    fn from_str(s: &str) -> Result<Self> {
        match s {
            "waiting" => Ok(JobState::Waiting),
            "delayed" => Ok(JobState::Delayed),
            "active" => Ok(JobState::Active),
            "completed" => Ok(JobState::Completed),
            "failed" => Ok(JobState::Failed),
            other => Err(RelayError::Corrupt(format!("unknown job state '{}'", other))),
        }
    }
}

/// Job execution options
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct JobOptions {
    /// Total handler invocations allowed, including the first.
    pub attempts: u32,
    pub backoff: BackoffStrategy,
    pub delay_ms: Option<u64>,
    pub repeat: Option<RepeatOptions>,
    /// How many completed jobs the queue keeps; `None` keeps all.
    pub keep_completed: Option<usize>,
    /// How many failed jobs the queue keeps; `None` keeps all.
    pub keep_failed: Option<usize>,
}

impl Default for JobOptions {
    fn default() -> Self {
        Self {
            attempts: 3,
            backoff: BackoffStrategy::default(),
            delay_ms: None,
            repeat: None,
            keep_completed: None,
            keep_failed: None,
        }
    }
}

impl JobOptions {
    pub fn validate(&self) -> Result<()> {
        if self.attempts < 1 {
            return Err(RelayError::InvalidOptions(
                "attempts must be at least 1".to_string(),
            ));
        }
        if self.delay_ms.is_some() && self.repeat.is_some() {
            return Err(RelayError::InvalidOptions(
                "delay_ms and repeat are mutually exclusive".to_string(),
            ));
        }
        if let Some(ms) = self.delay_ms {
            if delay_until(Utc::now(), ms).is_none() {
                return Err(RelayError::InvalidOptions(format!(
                    "delay_ms {} is out of range",
                    ms
                )));
            }
        }
        if let Some(repeat) = &self.repeat {
            repeat.validate()?;
        }
        Ok(())
    }
}

/// `from + ms`, or `None` when that instant cannot be represented.
fn delay_until(from: DateTime<Utc>, ms: u64) -> Option<DateTime<Utc>> {
    let ms = i64::try_from(ms).ok()?;
    from.checked_add_signed(chrono::Duration::try_milliseconds(ms)?)
}

/// One failed handler invocation.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct JobFailure {
    pub message: String,
    pub attempt: u32,
    pub at: DateTime<Utc>,
}

/// The persisted job envelope
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct JobRecord {
    pub id: JobId,
    pub name: String,
    pub queue_name: String,
    pub payload: serde_json::Value,
    pub options: JobOptions,
    pub state: JobState,
    pub attempts_made: u32,
    pub progress: Option<serde_json::Value>,
    pub last_error: Option<JobFailure>,
    pub error_history: Vec<JobFailure>,
    /// Registration this job was materialized from, if any.
    pub repeat_key: Option<String>,
    pub worker_id: Option<String>,
    pub enqueued_at: DateTime<Utc>,
    pub processed_at: Option<DateTime<Utc>>,
    pub finished_at: Option<DateTime<Utc>>,
}

impl JobRecord {
    pub fn new(
        queue_name: impl Into<String>,
        name: impl Into<String>,
        payload: serde_json::Value,
        options: JobOptions,
        now: DateTime<Utc>,
    ) -> Self {
        let state = if options.delay_ms.unwrap_or(0) > 0 || options.repeat.is_some() {
            JobState::Delayed
        } else {
            JobState::Waiting
        };

        Self {
            id: JobId::new(),
            name: name.into(),
            queue_name: queue_name.into(),
            payload,
            options,
            state,
            attempts_made: 0,
            progress: None,
            last_error: None,
            error_history: Vec::new(),
            repeat_key: None,
            worker_id: None,
            enqueued_at: now,
            processed_at: None,
            finished_at: None,
        }
    }

    /// When a delayed job becomes claimable. A delay past the representable
    /// range saturates, so the job is never due early.
    pub fn due_at(&self) -> Option<DateTime<Utc>> {
        match self.options.delay_ms {
            Some(ms) if ms > 0 => {
                Some(delay_until(self.enqueued_at, ms).unwrap_or(DateTime::<Utc>::MAX_UTC))
            }
            _ => None,
        }
    }

    /// Describe a failure of the attempt currently held.
    pub fn failure(&self, message: impl Into<String>, at: DateTime<Utc>) -> JobFailure {
        JobFailure {
            message: message.into(),
            attempt: self.attempts_made,
            at,
        }
    }
}

/// Core trait that all typed jobs implement
#[async_trait::async_trait]
pub trait Job: Send + Sync + 'static + serde::de::DeserializeOwned + serde::Serialize {
    /// Execute the job with the provided context
    async fn perform(&self, ctx: &JobContext) -> Result<()>;

    /// Job type name for registration and deserialization
    fn name() -> &'static str
    where
        Self: Sized;

    /// Default options for this job type
    fn default_options() -> JobOptions
    where
        Self: Sized,
    {
        JobOptions::default()
    }
}
