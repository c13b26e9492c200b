use relaymq::{async_trait, Job, JobContext, JobOptions, Queue, QueueOptions, Result};
use serde::{Deserialize, Serialize};
use serde_json::json;

#[derive(Serialize, Deserialize)]
struct EmailJob {
    to: String,
    subject: String,
    body: String,
}

#[async_trait]
impl Job for EmailJob {
    async fn perform(&self, _ctx: &JobContext) -> Result<()> {
        Ok(())
    }

    fn name() -> &'static str {
        "send"
    }
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt::try_init().ok();

    let queue = Queue::connect(QueueOptions {
        name: "email".to_string(),
        redis_url: "redis://localhost:6379".to_string(),
        ..Default::default()
    })
    .await?;
    println!("[enqueue] Connected; queue '{}'", queue.name());

    let job = queue
        .enqueue(EmailJob {
            to: "user@example.com".into(),
            subject: "Welcome!".into(),
            body: "Thanks for signing up".into(),
        })
        .await?;
    println!("[enqueue] Enqueued {} ({})", job.id, job.state);

    // Untyped producers only need the job name and a JSON payload.
    let reminder = queue
        .add(
            "send",
            json!({"to": "user@example.com", "subject": "Reminder", "body": "Still there?"}),
            JobOptions {
                delay_ms: Some(60_000),
                attempts: 5,
                ..Default::default()
            },
        )
        .await?;
    println!("[enqueue] Enqueued {} ({}), due in 60s", reminder.id, reminder.state);

    let status = queue.inspector().get_state(&job.id).await?;
    println!("[enqueue] Status: {}", serde_json::to_string_pretty(&status)?);

    Ok(())
}
