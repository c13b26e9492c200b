use clap::Parser;
use relaymq::{
    async_trait, AppContext, BrokerSettings, Job, JobContext, JobRegistry, Result, WorkerBuilder,
    WorkerSettings,
};
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use tracing_subscriber::EnvFilter;

#[derive(Serialize, Deserialize)]
struct EmailJob {
    to: String,
    subject: String,
    body: String,
}

#[async_trait]
impl Job for EmailJob {
    async fn perform(&self, ctx: &JobContext) -> Result<()> {
        if let Some(app) = ctx.app::<AppState>() {
            app.email_service
                .send(&self.to, &self.subject, &self.body)
                .await?;
        }
        ctx.update_progress(100).await?;
        Ok(())
    }

    fn name() -> &'static str {
        "send"
    }
}

#[derive(Clone, Default)]
struct AppState {
    email_service: EmailService,
}

impl AppContext for AppState {
    fn clone_context(&self) -> Arc<dyn AppContext> {
        Arc::new(self.clone())
    }
}

#[derive(Clone, Default)]
struct EmailService;

impl EmailService {
    async fn send(&self, to: &str, subject: &str, _body: &str) -> Result<()> {
        tracing::info!(to, subject, "Sent email");
        Ok(())
    }
}

/// Email worker; every flag can also come from the environment.
#[derive(Parser)]
struct Args {
    #[command(flatten)]
    broker: BrokerSettings,
    #[command(flatten)]
    worker: WorkerSettings,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")))
        .init();

    let args = Args::parse();

    let mut registry = JobRegistry::new();
    registry.register::<EmailJob>();

    let worker = WorkerBuilder::new(registry)
        .with_settings(&args.broker, &args.worker)?
        .with_app_context(Arc::new(AppState::default()))
        .spawn()
        .await?;

    let report = worker.run_until_signal().await?;
    if !report.abandoned.is_empty() {
        tracing::warn!(count = report.abandoned.len(), "Jobs left active at shutdown");
    }

    Ok(())
}
