// src/worker.rs
use crate::backoff;
use crate::broker::{Broker, Claim, RedisBroker, Transition};
use crate::config::{BrokerSettings, WorkerSettings};
use crate::context::EmptyContext;
use crate::rate_limit::RateLimit;
use crate::scheduler::Scheduler;
use crate::{AppContext, JobContext, JobId, JobRecord, JobRegistry, QueueOptions, RelayError, Result};
use chrono::{DateTime, Utc};
use futures::FutureExt;
use std::collections::HashMap;
use std::panic::AssertUnwindSafe;
use std::sync::{
    atomic::{AtomicBool, Ordering},
    Arc, Mutex, PoisonError,
};
use tokio::{
    sync::broadcast,
    task::JoinHandle,
    time::{timeout, Duration},
};
use tracing::{debug, error, info, instrument, warn, Instrument};

/// Pause after a store error before the slot claims again.
const STORE_ERROR_BACKOFF: Duration = Duration::from_secs(1);

/// Worker configuration
#[derive(Debug, Clone)]
pub struct WorkerConfig {
    pub queue_options: QueueOptions,
    pub concurrency: usize,
    pub poll_interval: Duration,
    pub rate_limit: Option<RateLimit>,
    /// Run a scheduler loop (delayed promotion and cron firing) inside the
    /// worker process.
    pub run_scheduler: bool,
    pub scheduler_interval: Duration,
    pub worker_id: String,
    pub shutdown_timeout: Duration,
}

impl Default for WorkerConfig {
    fn default() -> Self {
        Self {
            queue_options: QueueOptions::default(),
            concurrency: 10,
            poll_interval: Duration::from_millis(100),
            rate_limit: None,
            run_scheduler: true,
            scheduler_interval: Duration::from_secs(1),
            worker_id: format!("worker-{}", uuid::Uuid::new_v4()),
            shutdown_timeout: Duration::from_secs(30),
        }
    }
}

/// Lifecycle notifications for local observers.
#[derive(Debug, Clone, PartialEq)]
pub enum WorkerEvent {
    Active {
        job_id: JobId,
        name: String,
        attempt: u32,
    },
    Completed {
        job_id: JobId,
        name: String,
        attempts_made: u32,
        duration: Duration,
    },
    Retrying {
        job_id: JobId,
        name: String,
        attempts_made: u32,
        delay: Duration,
        error: String,
    },
    Failed {
        job_id: JobId,
        name: String,
        attempts_made: u32,
        error: String,
    },
}

impl WorkerEvent {
    pub fn job_id(&self) -> JobId {
        match self {
            WorkerEvent::Active { job_id, .. }
            | WorkerEvent::Completed { job_id, .. }
            | WorkerEvent::Retrying { job_id, .. }
            | WorkerEvent::Failed { job_id, .. } => *job_id,
        }
    }
}

/// Worker builder for fluent configuration
pub struct WorkerBuilder {
    config: WorkerConfig,
    registry: JobRegistry,
    app_context: Option<Arc<dyn AppContext>>,
    broker: Option<Arc<dyn Broker>>,
}

impl WorkerBuilder {
    pub fn new(registry: JobRegistry) -> Self {
        Self {
            config: WorkerConfig::default(),
            registry,
            app_context: None,
            broker: None,
        }
    }

    pub fn new_with_redis_uri(redis_url: impl Into<String>, registry: JobRegistry) -> Self {
        let mut builder = Self::new(registry);
        builder.config.queue_options.redis_url = redis_url.into();
        builder
    }

    /// Use an existing store instead of connecting to `redis_url`.
    pub fn with_broker(mut self, broker: Arc<dyn Broker>) -> Self {
        self.broker = Some(broker);
        self
    }

    pub fn with_config(mut self, config: WorkerConfig) -> Self {
        self.config = config;
        self
    }

    /// Apply flag/env settings on top of the current configuration.
    pub fn with_settings(mut self, broker: &BrokerSettings, worker: &WorkerSettings) -> Result<Self> {
        self.config.queue_options.redis_url = broker.redis_url.clone();
        self.config.queue_options.key_prefix = broker.key_prefix.clone();
        self.config.queue_options.name = worker.queue.clone();
        self.config.concurrency = worker.concurrency;
        self.config.rate_limit = worker.rate_limit()?;
        self.config.poll_interval = worker.poll_interval();
        self.config.shutdown_timeout = worker.shutdown_timeout();
        Ok(self)
    }

    pub fn with_concurrency(mut self, concurrency: usize) -> Self {
        self.config.concurrency = concurrency;
        self
    }

    pub fn with_queue_name(mut self, name: impl Into<String>) -> Self {
        self.config.queue_options.name = name.into();
        self
    }

    pub fn with_key_prefix(mut self, prefix: impl Into<String>) -> Self {
        self.config.queue_options.key_prefix = prefix.into();
        self
    }

    pub fn with_app_context(mut self, ctx: Arc<dyn AppContext>) -> Self {
        self.app_context = Some(ctx);
        self
    }

    pub fn with_poll_interval(mut self, interval: Duration) -> Self {
        self.config.poll_interval = interval;
        self
    }

    pub fn with_rate_limit(mut self, limit: RateLimit) -> Self {
        self.config.rate_limit = Some(limit);
        self
    }

    pub fn with_scheduler_interval(mut self, interval: Duration) -> Self {
        self.config.scheduler_interval = interval;
        self
    }

    /// Leave promotion and cron firing to another process.
    pub fn without_scheduler(mut self) -> Self {
        self.config.run_scheduler = false;
        self
    }

    pub fn with_worker_id(mut self, worker_id: impl Into<String>) -> Self {
        self.config.worker_id = worker_id.into();
        self
    }

    pub fn with_shutdown_timeout(mut self, timeout: Duration) -> Self {
        self.config.shutdown_timeout = timeout;
        self
    }

    /// Build the worker. Nothing is claimed until `start`.
    pub async fn spawn(self) -> Result<Worker> {
        if self.config.concurrency == 0 {
            return Err(RelayError::Config(
                "concurrency must be at least 1".to_string(),
            ));
        }

        let broker: Arc<dyn Broker> = match self.broker {
            Some(broker) => broker,
            None => Arc::new(
                RedisBroker::connect(
                    &self.config.queue_options.redis_url,
                    self.config.queue_options.key_prefix.clone(),
                )
                .await?,
            ),
        };
        let app_context = self
            .app_context
            .unwrap_or_else(|| Arc::new(EmptyContext));

        Ok(Worker::new(self.config, self.registry, app_context, broker))
    }
}

/// State shared by the worker's slot tasks.
struct Shared {
    broker: Arc<dyn Broker>,
    registry: JobRegistry,
    app_context: Arc<dyn AppContext>,
    queue_name: String,
    worker_id: String,
    poll_interval: Duration,
    rate_limit: Option<RateLimit>,
    events: broadcast::Sender<WorkerEvent>,
    /// Claimed jobs held by this worker. A plain mutex, so a job is recorded
    /// in the same poll its claim returns in.
    in_flight: Mutex<HashMap<JobId, String>>,
    is_shutting_down: AtomicBool,
}

impl Shared {
    fn emit(&self, event: WorkerEvent) {
        // No subscribers is fine.
        let _ = self.events.send(event);
    }

    fn in_flight(&self) -> std::sync::MutexGuard<'_, HashMap<JobId, String>> {
        self.in_flight.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

/// Jobs still running when the shutdown timeout expired.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ShutdownReport {
    pub abandoned: Vec<JobId>,
}

/// Job worker that processes queued jobs with `concurrency` independent
/// slots, each claiming one job at a time.
pub struct Worker {
    config: WorkerConfig,
    shared: Arc<Shared>,
    handles: Vec<JoinHandle<()>>,
    shutdown_tx: broadcast::Sender<()>,
}

impl Worker {
    fn new(
        config: WorkerConfig,
        registry: JobRegistry,
        app_context: Arc<dyn AppContext>,
        broker: Arc<dyn Broker>,
    ) -> Self {
        let (shutdown_tx, _) = broadcast::channel(1);
        let (events, _) = broadcast::channel(1024);

        let shared = Arc::new(Shared {
            broker,
            registry,
            app_context,
            queue_name: config.queue_options.name.clone(),
            worker_id: config.worker_id.clone(),
            poll_interval: config.poll_interval,
            rate_limit: config.rate_limit,
            events,
            in_flight: Mutex::new(HashMap::new()),
            is_shutting_down: AtomicBool::new(false),
        });

        Self {
            config,
            shared,
            handles: Vec::new(),
            shutdown_tx,
        }
    }

    pub fn worker_id(&self) -> &str {
        &self.config.worker_id
    }

    /// Receive lifecycle events. Subscribe before `start` to see every job.
    pub fn subscribe(&self) -> broadcast::Receiver<WorkerEvent> {
        self.shared.events.subscribe()
    }

    /// Start the slot loops (and the scheduler unless disabled). Returns
    /// immediately.
    pub fn start(&mut self) -> Result<()> {
        if !self.handles.is_empty() {
            return Err(RelayError::Worker(format!(
                "worker {} already started",
                self.config.worker_id
            )));
        }
        if self.shared.is_shutting_down.load(Ordering::SeqCst) {
            return Err(RelayError::Worker(format!(
                "worker {} is shutting down",
                self.config.worker_id
            )));
        }

        info!(
            "Starting worker {} on queue '{}' with concurrency {}",
            self.config.worker_id, self.config.queue_options.name, self.config.concurrency
        );

        if self.config.run_scheduler {
            let scheduler = Scheduler::new(
                Arc::clone(&self.shared.broker),
                self.config.queue_options.name.clone(),
            );
            self.handles.push(
                scheduler.spawn(self.config.scheduler_interval, self.shutdown_tx.subscribe()),
            );
        }

        for slot in 0..self.config.concurrency {
            let shared = Arc::clone(&self.shared);
            let shutdown_rx = self.shutdown_tx.subscribe();
            self.handles
                .push(tokio::spawn(Self::run_slot(shared, slot, shutdown_rx)));
        }

        info!("Worker started successfully");
        Ok(())
    }

    /// Start, block until SIGINT/SIGTERM, then shut down gracefully.
    pub async fn run_until_signal(mut self) -> Result<ShutdownReport> {
        if self.handles.is_empty() {
            self.start()?;
        }
        Self::wait_for_shutdown_signal().await?;
        info!("Shutdown signal received by worker {}", self.config.worker_id);
        Ok(self.close().await)
    }

    async fn wait_for_shutdown_signal() -> Result<()> {
        use tokio::signal;

        #[cfg(unix)]
        {
            use signal::unix::{signal, SignalKind};

            let mut sigterm = signal(SignalKind::terminate())
                .map_err(|e| RelayError::Worker(format!("failed to install SIGTERM handler: {}", e)))?;
            let mut sigint = signal(SignalKind::interrupt())
                .map_err(|e| RelayError::Worker(format!("failed to install SIGINT handler: {}", e)))?;

            tokio::select! {
                _ = sigterm.recv() => info!("SIGTERM received"),
                _ = sigint.recv() => info!("SIGINT received"),
            }
        }

        #[cfg(not(unix))]
        {
            signal::ctrl_c()
                .await
                .map_err(|e| RelayError::Worker(format!("failed to listen for CTRL+C: {}", e)))?;
            info!("CTRL+C received");
        }

        Ok(())
    }

    /// Stop claiming, wait up to `shutdown_timeout` for in-flight jobs,
    /// then release the store. Jobs still running at the deadline stay
    /// `active` in the store and are reported.
    pub async fn close(mut self) -> ShutdownReport {
        info!(
            "Initiating graceful shutdown for worker {}",
            self.config.worker_id
        );

        self.shared.is_shutting_down.store(true, Ordering::SeqCst);
        let _ = self.shutdown_tx.send(());

        let in_flight = self.shared.in_flight().len();
        if in_flight > 0 {
            info!("Waiting for {} active jobs to complete...", in_flight);
        }

        let mut handles = std::mem::take(&mut self.handles);
        let drained = timeout(
            self.config.shutdown_timeout,
            futures::future::join_all(handles.iter_mut()),
        )
        .await;

        let report = match drained {
            Ok(_) => {
                debug!("All slots stopped");
                ShutdownReport::default()
            }
            Err(_) => {
                let abandoned: Vec<(JobId, String)> = self
                    .shared
                    .in_flight()
                    .iter()
                    .map(|(id, name)| (*id, name.clone()))
                    .collect();
                for (job_id, job_name) in &abandoned {
                    warn!(
                        job_id = %job_id,
                        job_name = %job_name,
                        "Shutdown timeout reached; job left active"
                    );
                }
                for handle in &handles {
                    handle.abort();
                }
                ShutdownReport {
                    abandoned: abandoned.into_iter().map(|(id, _)| id).collect(),
                }
            }
        };

        info!("Worker {} shutdown complete", self.config.worker_id);
        report
    }

    async fn run_slot(shared: Arc<Shared>, slot: usize, mut shutdown_rx: broadcast::Receiver<()>) {
        debug!(worker_id = %shared.worker_id, slot, "Slot started");

        loop {
            if shared.is_shutting_down.load(Ordering::SeqCst) {
                break;
            }

            let pause = match shared
                .broker
                .claim(
                    &shared.queue_name,
                    &shared.worker_id,
                    shared.rate_limit.as_ref(),
                    Utc::now(),
                )
                .await
            {
                Ok(Claim::Job(job)) => {
                    shared.in_flight().insert(job.id, job.name.clone());
                    Self::execute_job(&shared, *job).await;
                    continue;
                }
                Ok(Claim::Empty) => shared.poll_interval,
                Ok(Claim::Throttled(wait)) => {
                    debug!(slot, wait_ms = wait.as_millis() as u64, "Rate limited");
                    wait
                }
                Err(e) => {
                    error!("Failed to claim job: {}", e);
                    STORE_ERROR_BACKOFF
                }
            };

            tokio::select! {
                _ = tokio::time::sleep(pause) => {}
                _ = shutdown_rx.recv() => break,
            }
        }

        debug!(worker_id = %shared.worker_id, slot, "Slot stopped");
    }

    #[instrument(skip_all, fields(job_id = %job.id, attempt = job.attempts_made))]
    async fn execute_job(shared: &Shared, job: JobRecord) {
        let start_time = std::time::Instant::now();

        shared.emit(WorkerEvent::Active {
            job_id: job.id,
            name: job.name.clone(),
            attempt: job.attempts_made,
        });

        let job_context = JobContext::new(
            job.clone(),
            Arc::clone(&shared.app_context),
            Arc::clone(&shared.broker),
        );
        let span = job_context.span.clone();

        let result = AssertUnwindSafe(shared.registry.execute_job(
            &job.name,
            job.payload.clone(),
            &job_context,
        ))
        .catch_unwind()
        .instrument(span)
        .await
        .unwrap_or_else(|panic| {
            Err(RelayError::Worker(format!(
                "handler panicked: {}",
                panic_message(panic.as_ref())
            )))
        });

        let execution_time = start_time.elapsed();

        match result {
            Ok(()) => Self::complete(shared, &job, execution_time).await,
            Err(e) => Self::fail_or_retry(shared, &job, e.to_string()).await,
        }

        shared.in_flight().remove(&job.id);
    }

    async fn complete(shared: &Shared, job: &JobRecord, execution_time: Duration) {
        let transition = Transition::Complete {
            finished_at: Utc::now(),
            keep: job.options.keep_completed,
        };
        if let Err(e) = shared.broker.transition(job, transition).await {
            error!("Failed to mark job {} completed: {}", job.id, e);
            return;
        }

        info!(
            "Job {} completed successfully in {:?}",
            job.id, execution_time
        );
        shared.emit(WorkerEvent::Completed {
            job_id: job.id,
            name: job.name.clone(),
            attempts_made: job.attempts_made,
            duration: execution_time,
        });
    }

    async fn fail_or_retry(shared: &Shared, job: &JobRecord, error_msg: String) {
        let now = Utc::now();
        let failure = job.failure(error_msg.clone(), now);

        match backoff::next_delay(job.attempts_made, job.options.attempts, &job.options.backoff) {
            Some(delay) => {
                let transition = Transition::Retry {
                    due_at: due_after(now, delay),
                    failure,
                };
                if let Err(e) = shared.broker.transition(job, transition).await {
                    error!("Failed to schedule retry of job {}: {}", job.id, e);
                    return;
                }

                warn!(
                    "Job {} failed on attempt {}/{}, retrying in {:?}: {}",
                    job.id, job.attempts_made, job.options.attempts, delay, error_msg
                );
                shared.emit(WorkerEvent::Retrying {
                    job_id: job.id,
                    name: job.name.clone(),
                    attempts_made: job.attempts_made,
                    delay,
                    error: error_msg,
                });
            }
            None => {
                let transition = Transition::Fail {
                    finished_at: now,
                    failure,
                    keep: job.options.keep_failed,
                };
                if let Err(e) = shared.broker.transition(job, transition).await {
                    error!("Failed to mark job {} failed: {}", job.id, e);
                    return;
                }

                error!(
                    "Job {} failed after {} attempts: {}",
                    job.id, job.attempts_made, error_msg
                );
                shared.emit(WorkerEvent::Failed {
                    job_id: job.id,
                    name: job.name.clone(),
                    attempts_made: job.attempts_made,
                    error: error_msg,
                });
            }
        }
    }

    /// Get worker statistics
    pub async fn get_stats(&self) -> WorkerStats {
        WorkerStats {
            worker_id: self.config.worker_id.clone(),
            concurrency: self.config.concurrency,
            queue_name: self.config.queue_options.name.clone(),
            is_shutting_down: self.shared.is_shutting_down.load(Ordering::SeqCst),
            active_jobs: self.shared.in_flight().len(),
        }
    }
}

impl Drop for Worker {
    /// A worker dropped without `close` stops claiming; running jobs finish.
    fn drop(&mut self) {
        self.shared.is_shutting_down.store(true, Ordering::SeqCst);
        let _ = self.shutdown_tx.send(());
    }
}

fn due_after(now: DateTime<Utc>, delay: Duration) -> DateTime<Utc> {
    chrono::Duration::from_std(delay)
        .ok()
        .and_then(|d| now.checked_add_signed(d))
        .unwrap_or(DateTime::<Utc>::MAX_UTC)
}

fn panic_message(panic: &(dyn std::any::Any + Send)) -> String {
    if let Some(s) = panic.downcast_ref::<&str>() {
        s.to_string()
    } else if let Some(s) = panic.downcast_ref::<String>() {
        s.clone()
    } else {
        "unknown panic payload".to_string()
    }
}

#[derive(Debug, Clone)]
pub struct WorkerStats {
    pub worker_id: String,
    pub concurrency: usize,
    pub queue_name: String,
    pub is_shutting_down: bool,
    pub active_jobs: usize,
}
