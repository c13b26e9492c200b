//! relaymq - operator tooling for a relaymq deployment
//!
//! # Usage
//!
//! ```bash
//! # Job counts per state
//! relaymq --queue email counts
//!
//! # Inspect one job
//! relaymq job 5f0c5a4e-2d5b-4a59-9a59-2f7e0b1f2a11
//!
//! # Manage repeatable registrations
//! relaymq repeatables
//! relaymq remove-repeatable 'report::UTC::0 * * * *'
//!
//! # Run one scheduler pass, or follow state changes
//! relaymq promote
//! relaymq watch
//! ```

use anyhow::{Context, Result};
use chrono::Utc;
use clap::{Parser, Subcommand};
use futures::StreamExt;
use relaymq::{BrokerSettings, JobId, Queue, QueueOptions, RedisBroker};
use std::sync::Arc;

#[derive(Parser)]
#[command(name = "relaymq", version, about = "Inspect and operate relaymq queues")]
struct Cli {
    /// Increase verbosity (-v, -vv, -vvv)
    #[arg(short, long, action = clap::ArgAction::Count, global = true)]
    verbose: u8,

    #[command(flatten)]
    broker: BrokerSettings,

    /// Queue to operate on
    #[arg(long, env = "RELAYMQ_QUEUE", default_value = "default", global = true)]
    queue: String,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Number of jobs in each state
    Counts,

    /// Show one job as JSON
    Job { id: String },

    /// List repeatable registrations
    Repeatables,

    /// Remove a repeatable registration by key
    RemoveRepeatable { key: String },

    /// Remove every repeatable registration of the queue
    ClearRepeatables,

    /// Promote due delayed jobs and fire due repeatables once
    Promote,

    /// Print state change events as they happen
    Watch,
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();
    setup_logging(cli.verbose);

    let broker = RedisBroker::connect(&cli.broker.redis_url, cli.broker.key_prefix.clone())
        .await
        .with_context(|| format!("connecting to {}", cli.broker.redis_url))?;

    let broker = Arc::new(broker);
    let queue = Queue::with_broker(
        Arc::clone(&broker) as Arc<dyn relaymq::Broker>,
        QueueOptions {
            name: cli.queue.clone(),
            redis_url: cli.broker.redis_url.clone(),
            key_prefix: cli.broker.key_prefix.clone(),
            ..Default::default()
        },
    );

    match cli.command {
        Commands::Counts => {
            let counts = queue.get_job_counts().await?;
            println!("{}", serde_json::to_string_pretty(&counts)?);
        }
        Commands::Job { id } => {
            let id: JobId = id.parse()?;
            match queue.get_job(&id).await? {
                Some(job) => println!("{}", serde_json::to_string_pretty(&job)?),
                None => anyhow::bail!("job {} not found", id),
            }
        }
        Commands::Repeatables => {
            for registration in queue.repeatables().await? {
                println!(
                    "{}\t{}\tnext={}",
                    registration.key, registration.name, registration.next_fire_at
                );
            }
        }
        Commands::RemoveRepeatable { key } => {
            if !queue.remove_repeatable(&key).await? {
                anyhow::bail!("no repeatable with key '{}'", key);
            }
            println!("removed {}", key);
        }
        Commands::ClearRepeatables => {
            let removed = queue.clear_all_repeatables().await?;
            println!("removed {} repeatables", removed);
        }
        Commands::Promote => {
            let summary = queue.scheduler().tick(Utc::now()).await?;
            println!(
                "promoted {} delayed jobs, fired {} repeatables",
                summary.promoted, summary.fired
            );
        }
        Commands::Watch => {
            let mut events = Box::pin(broker.subscribe(&cli.queue).await?);
            while let Some(event) = events.next().await {
                println!("{}", serde_json::to_string(&event)?);
            }
        }
    }

    Ok(())
}

fn setup_logging(verbosity: u8) {
    use tracing_subscriber::EnvFilter;

    let filter = match verbosity {
        0 => "warn",
        1 => "info",
        2 => "debug",
        _ => "trace",
    };

    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(filter)))
        .init();
}
