use relaymq::{JobOptions, Queue, QueueOptions, RepeatOptions};
use serde_json::json;

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt::try_init().ok();

    let queue = Queue::connect(QueueOptions {
        name: "reports".to_string(),
        ..Default::default()
    })
    .await?;

    // Start from a clean slate so rules removed from code do not linger.
    let removed = queue.clear_all_repeatables().await?;
    println!("[repeat] cleared {} stale registrations", removed);

    queue
        .add_repeatable(
            RepeatOptions::cron("*/5 * * * *"),
            "metrics-rollup",
            json!({"window": "5m"}),
            JobOptions::default(),
        )
        .await?;
    queue
        .add_repeatable(
            RepeatOptions::cron("0 9 * * 1-5")
                .with_tz("Europe/Berlin")
                .with_key("weekday-digest"),
            "digest",
            json!({"audience": "team"}),
            JobOptions {
                attempts: 5,
                ..Default::default()
            },
        )
        .await?;

    for registration in queue.repeatables().await? {
        println!(
            "[repeat] {} -> '{}' next at {}",
            registration.key, registration.name, registration.next_fire_at
        );
    }

    Ok(())
}
