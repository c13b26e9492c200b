// src/error.rs
use thiserror::Error;

#[derive(Error, Debug)]
pub enum RelayError {
    #[error("Redis error: {0}")]
    Redis(#[from] redis::RedisError),

    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    #[error("Invalid job options: {0}")]
    InvalidOptions(String),

    #[error("Invalid cron expression: {0}")]
    InvalidCron(String),

    #[error("Job execution failed: {0}")]
    JobExecution(#[from] anyhow::Error),

    /// The job is no longer in the active set, so the caller does not hold it.
    #[error("Job {0} is not active")]
    NotActive(crate::JobId),

    #[error("Worker error: {0}")]
    Worker(String),

    #[error("Registry error: {0}")]
    Registry(String),

    #[error("Configuration error: {0}")]
    Config(String),

    #[error("Corrupt job record: {0}")]
    Corrupt(String),
}

pub type Result<T> = std::result::Result<T, RelayError>;
