// src/context.rs
use crate::broker::Broker;
use crate::{JobId, JobRecord, Result};
use std::sync::Arc;
use tracing::Span;

/// Application context containing shared resources
pub trait AppContext: AsAny + Send + Sync + 'static {
    /// Clone the context for use in another task
    fn clone_context(&self) -> Arc<dyn AppContext>;
}

/// Used when a worker is built without an application context.
#[derive(Clone, Default)]
pub struct EmptyContext;

impl AppContext for EmptyContext {
    fn clone_context(&self) -> Arc<dyn AppContext> {
        Arc::new(self.clone())
    }
}

/// What a handler sees while it runs one attempt of a job.
#[derive(Clone)]
pub struct JobContext {
    pub job: JobRecord,
    pub app_context: Arc<dyn AppContext>,
    pub span: Span,
    broker: Arc<dyn Broker>,
}

impl JobContext {
    pub fn new(job: JobRecord, app_context: Arc<dyn AppContext>, broker: Arc<dyn Broker>) -> Self {
        let span = tracing::info_span!(
            "job_execution",
            job_id = %job.id,
            job_name = %job.name,
            queue = %job.queue_name,
            attempt = job.attempts_made,
        );

        Self {
            job,
            app_context,
            span,
            broker,
        }
    }

    pub fn job_id(&self) -> JobId {
        self.job.id
    }

    pub fn queue_name(&self) -> &str {
        &self.job.queue_name
    }

    /// 1-based number of the attempt being executed.
    pub fn attempt(&self) -> u32 {
        self.job.attempts_made
    }

    /// Get typed app context
    pub fn app<T: AppContext>(&self) -> Option<&T> {
        self.app_context.as_ref().as_any().downcast_ref::<T>()
    }

    /// Publish progress for pollers. Does not change the job's state.
    pub async fn update_progress(&self, progress: impl Into<serde_json::Value>) -> Result<()> {
        self.broker
            .update_progress(&self.job.queue_name, &self.job.id, progress.into())
            .await
    }
}

// Helper trait for downcasting
pub trait AsAny {
    fn as_any(&self) -> &dyn std::any::Any;
}

impl<T: AppContext> AsAny for T {
    fn as_any(&self) -> &dyn std::any::Any {
        self
    }
}
