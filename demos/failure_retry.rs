use relaymq::{
    async_trait, BackoffStrategy, Job, JobContext, JobOptions, JobRegistry, Queue, QueueOptions,
    RelayError, Result, WorkerBuilder, WorkerEvent,
};
use serde::{Deserialize, Serialize};
use std::time::Duration;

/// Fails until its third attempt.
#[derive(Serialize, Deserialize)]
struct FlakyCharge {
    invoice: u64,
}

#[async_trait]
impl Job for FlakyCharge {
    async fn perform(&self, ctx: &JobContext) -> Result<()> {
        if ctx.attempt() < 3 {
            return Err(RelayError::JobExecution(anyhow::anyhow!(
                "payment gateway timeout for invoice {}",
                self.invoice
            )));
        }
        Ok(())
    }

    fn name() -> &'static str {
        "charge"
    }

    fn default_options() -> JobOptions {
        JobOptions {
            attempts: 3,
            backoff: BackoffStrategy::exponential(Duration::from_millis(500)),
            ..Default::default()
        }
    }
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt::try_init().ok();

    let options = QueueOptions {
        name: "billing".to_string(),
        redis_url: "redis://localhost:6379".to_string(),
        ..Default::default()
    };
    let queue = Queue::connect(options.clone()).await?;
    let job = queue.enqueue(FlakyCharge { invoice: 42 }).await?;

    let mut registry = JobRegistry::new();
    registry.register::<FlakyCharge>();
    let mut worker = WorkerBuilder::new_with_redis_uri(&options.redis_url, registry)
        .with_queue_name(&options.name)
        .with_concurrency(1)
        .with_scheduler_interval(Duration::from_millis(100))
        .spawn()
        .await?;

    let mut events = worker.subscribe();
    worker.start()?;

    while let Ok(event) = events.recv().await {
        if event.job_id() != job.id {
            continue;
        }
        println!("[retry] {:?}", event);
        if matches!(event, WorkerEvent::Completed { .. } | WorkerEvent::Failed { .. }) {
            break;
        }
    }

    if let Some(record) = queue.get_job(&job.id).await? {
        println!(
            "[retry] final state={} attempts={} errors={}",
            record.state,
            record.attempts_made,
            record.error_history.len()
        );
    }

    worker.close().await;
    Ok(())
}
