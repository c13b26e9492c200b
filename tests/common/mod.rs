#![allow(dead_code)]

use relaymq::{
    async_trait, AppContext, Broker, Deserialize, Job, JobContext, JobId, JobRegistry,
    MemoryBroker, Queue, QueueOptions, RelayError, Result, Serialize, Worker, WorkerBuilder,
    WorkerEvent,
};
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};
use tokio::sync::broadcast;

/// One handler invocation as seen from inside the handler.
#[derive(Debug, Clone)]
pub struct Invocation {
    pub job_id: JobId,
    pub attempt: u32,
    pub started: Instant,
    pub finished: Option<Instant>,
}

/// Shared recorder handed to handlers through the app context.
#[derive(Clone, Default)]
pub struct Probe {
    invocations: Arc<Mutex<Vec<Invocation>>>,
}

impl AppContext for Probe {
    fn clone_context(&self) -> Arc<dyn AppContext> {
        Arc::new(self.clone())
    }
}

impl Probe {
    fn start(&self, ctx: &JobContext) -> usize {
        let mut invocations = self.invocations.lock().unwrap();
        invocations.push(Invocation {
            job_id: ctx.job_id(),
            attempt: ctx.attempt(),
            started: Instant::now(),
            finished: None,
        });
        invocations.len() - 1
    }

    fn finish(&self, index: usize) {
        self.invocations.lock().unwrap()[index].finished = Some(Instant::now());
    }

    pub fn invocations(&self) -> Vec<Invocation> {
        self.invocations.lock().unwrap().clone()
    }

    pub fn invocations_of(&self, job_id: JobId) -> Vec<Invocation> {
        self.invocations()
            .into_iter()
            .filter(|i| i.job_id == job_id)
            .collect()
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SendEmail {
    pub to: String,
}

#[async_trait]
impl Job for SendEmail {
    async fn perform(&self, ctx: &JobContext) -> Result<()> {
        if let Some(probe) = ctx.app::<Probe>() {
            let index = probe.start(ctx);
            probe.finish(index);
        }
        Ok(())
    }

    fn name() -> &'static str {
        "send"
    }
}

/// Fails its first `fail_times` attempts.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct FlakyJob {
    pub fail_times: u32,
}

#[async_trait]
impl Job for FlakyJob {
    async fn perform(&self, ctx: &JobContext) -> Result<()> {
        if let Some(probe) = ctx.app::<Probe>() {
            let index = probe.start(ctx);
            probe.finish(index);
        }
        if ctx.attempt() <= self.fail_times {
            return Err(RelayError::JobExecution(anyhow::anyhow!(
                "attempt {} failed",
                ctx.attempt()
            )));
        }
        Ok(())
    }

    fn name() -> &'static str {
        "flaky"
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SleepJob {
    pub ms: u64,
}

#[async_trait]
impl Job for SleepJob {
    async fn perform(&self, ctx: &JobContext) -> Result<()> {
        let probe = ctx.app::<Probe>().cloned();
        let index = probe.as_ref().map(|p| p.start(ctx));
        tokio::time::sleep(Duration::from_millis(self.ms)).await;
        if let (Some(probe), Some(index)) = (probe, index) {
            probe.finish(index);
        }
        Ok(())
    }

    fn name() -> &'static str {
        "sleep"
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PanicJob;

#[async_trait]
impl Job for PanicJob {
    async fn perform(&self, _ctx: &JobContext) -> Result<()> {
        panic!("handler exploded");
    }

    fn name() -> &'static str {
        "panic"
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ProgressJob;

#[async_trait]
impl Job for ProgressJob {
    async fn perform(&self, ctx: &JobContext) -> Result<()> {
        ctx.update_progress(50).await?;
        ctx.update_progress(serde_json::json!({"percent": 100})).await?;
        Ok(())
    }

    fn name() -> &'static str {
        "progress"
    }
}

pub fn registry() -> JobRegistry {
    let mut registry = JobRegistry::new();
    registry
        .register::<SendEmail>()
        .register::<FlakyJob>()
        .register::<SleepJob>()
        .register::<PanicJob>()
        .register::<ProgressJob>()
        .register_fn("echo", |payload, ctx| async move { ctx.update_progress(payload).await });
    registry
}

pub fn queue(broker: &Arc<MemoryBroker>, name: &str) -> Queue {
    Queue::with_broker(
        Arc::clone(broker) as Arc<dyn Broker>,
        QueueOptions {
            name: name.to_string(),
            ..Default::default()
        },
    )
}

pub fn worker_builder(broker: &Arc<MemoryBroker>, queue_name: &str, probe: &Probe) -> WorkerBuilder {
    WorkerBuilder::new(registry())
        .with_broker(Arc::clone(broker) as Arc<dyn Broker>)
        .with_queue_name(queue_name)
        .with_app_context(Arc::new(probe.clone()))
        .with_poll_interval(Duration::from_millis(10))
        .with_scheduler_interval(Duration::from_millis(25))
        .with_shutdown_timeout(Duration::from_secs(5))
}

pub async fn started(builder: WorkerBuilder) -> (Worker, broadcast::Receiver<WorkerEvent>) {
    let mut worker = builder.spawn().await.unwrap();
    let events = worker.subscribe();
    worker.start().unwrap();
    (worker, events)
}

/// Collect events until `count` jobs reached `completed` or `failed`.
pub async fn wait_for_terminal(
    events: &mut broadcast::Receiver<WorkerEvent>,
    count: usize,
    within: Duration,
) -> Vec<WorkerEvent> {
    let mut seen = Vec::new();
    let mut terminal = 0;
    tokio::time::timeout(within, async {
        while terminal < count {
            let event = events.recv().await.unwrap();
            if matches!(
                event,
                WorkerEvent::Completed { .. } | WorkerEvent::Failed { .. }
            ) {
                terminal += 1;
            }
            seen.push(event);
        }
    })
    .await
    .expect("jobs did not finish in time");
    seen
}
