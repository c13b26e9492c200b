use relaymq::{JobOptions, Queue, QueueOptions};
use serde_json::json;
use std::time::Duration;

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt::try_init().ok();

    let queue = Queue::connect(QueueOptions {
        name: "email".to_string(),
        ..Default::default()
    })
    .await?;

    for delay_ms in [1_000u64, 3_000, 5_000] {
        let job = queue
            .add(
                "send",
                json!({"to": "later@example.com", "subject": format!("after {}ms", delay_ms), "body": ""}),
                JobOptions {
                    delay_ms: Some(delay_ms),
                    ..Default::default()
                },
            )
            .await?;
        println!("[delayed] {} due in {}ms", job.id, delay_ms);
    }

    // Without a worker running, promote by hand and watch the counts move.
    for _ in 0..6 {
        tokio::time::sleep(Duration::from_secs(1)).await;
        let promoted = queue.promote_due_jobs().await?;
        let counts = queue.get_job_counts().await?;
        println!(
            "[delayed] promoted={} waiting={} delayed={}",
            promoted.len(),
            counts.waiting,
            counts.delayed
        );
    }

    Ok(())
}
