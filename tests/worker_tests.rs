mod common;

use common::*;
use relaymq::{BackoffStrategy, JobOptions, JobState, MemoryBroker, RateLimit, WorkerEvent};
use serde_json::json;
use std::sync::Arc;
use std::time::{Duration, Instant};

#[tokio::test]
async fn success_path_completes_on_first_attempt() {
    let broker = Arc::new(MemoryBroker::new());
    let queue = queue(&broker, "email");
    let probe = Probe::default();

    let job = queue
        .add(
            "send",
            json!({"to": "a@b.com"}),
            JobOptions {
                attempts: 3,
                ..Default::default()
            },
        )
        .await
        .unwrap();
    assert_eq!(job.state, JobState::Waiting);

    let (worker, mut events) = started(worker_builder(&broker, "email", &probe)).await;
    wait_for_terminal(&mut events, 1, Duration::from_secs(5)).await;

    let status = queue.inspector().get_state(&job.id).await.unwrap().unwrap();
    assert_eq!(status.state, JobState::Completed);
    assert_eq!(status.attempts_made, 1);
    assert!(status.last_error.is_none());
    assert!(status.processed_at.is_some());
    assert!(status.finished_at.is_some());

    let counts = queue.get_job_counts().await.unwrap();
    assert_eq!(counts.completed, 1);
    assert_eq!(counts.active, 0);

    assert!(worker.close().await.abandoned.is_empty());
}

#[tokio::test]
async fn retries_with_exponential_backoff_then_succeeds() {
    let broker = Arc::new(MemoryBroker::new());
    let queue = queue(&broker, "flaky");
    let probe = Probe::default();

    let job = queue
        .enqueue_with_options(
            FlakyJob { fail_times: 2 },
            JobOptions {
                attempts: 3,
                backoff: BackoffStrategy::exponential(Duration::from_millis(1000)),
                ..Default::default()
            },
        )
        .await
        .unwrap();

    let (worker, mut events) = started(worker_builder(&broker, "flaky", &probe)).await;
    let seen = wait_for_terminal(&mut events, 1, Duration::from_secs(10)).await;

    let retry_delays: Vec<Duration> = seen
        .iter()
        .filter_map(|e| match e {
            WorkerEvent::Retrying { delay, .. } => Some(*delay),
            _ => None,
        })
        .collect();
    assert_eq!(
        retry_delays,
        vec![Duration::from_millis(1000), Duration::from_millis(2000)]
    );

    let invocations = probe.invocations_of(job.id);
    assert_eq!(invocations.len(), 3);
    assert_eq!(
        invocations.iter().map(|i| i.attempt).collect::<Vec<_>>(),
        vec![1, 2, 3]
    );
    assert!(invocations[1].started - invocations[0].finished.unwrap() >= Duration::from_millis(1000));
    assert!(invocations[2].started - invocations[1].finished.unwrap() >= Duration::from_millis(2000));

    let stored = queue.get_job(&job.id).await.unwrap().unwrap();
    assert_eq!(stored.state, JobState::Completed);
    assert_eq!(stored.attempts_made, 3);
    assert_eq!(stored.error_history.len(), 2);
    assert_eq!(stored.error_history[0].attempt, 1);
    assert_eq!(stored.error_history[1].attempt, 2);

    worker.close().await;
}

#[tokio::test]
async fn exhausted_job_is_failed_with_last_error() {
    let broker = Arc::new(MemoryBroker::new());
    let queue = queue(&broker, "flaky");
    let probe = Probe::default();

    let job = queue
        .enqueue_with_options(
            FlakyJob { fail_times: u32::MAX },
            JobOptions {
                attempts: 2,
                backoff: BackoffStrategy::fixed(Duration::from_millis(50)),
                ..Default::default()
            },
        )
        .await
        .unwrap();

    let (worker, mut events) = started(worker_builder(&broker, "flaky", &probe)).await;
    let seen = wait_for_terminal(&mut events, 1, Duration::from_secs(5)).await;

    assert_eq!(
        seen.iter()
            .filter(|e| matches!(e, WorkerEvent::Retrying { .. }))
            .count(),
        1
    );
    assert!(matches!(
        seen.last(),
        Some(WorkerEvent::Failed { attempts_made: 2, .. })
    ));
    assert_eq!(probe.invocations_of(job.id).len(), 2);

    let status = queue.inspector().get_state(&job.id).await.unwrap().unwrap();
    assert_eq!(status.state, JobState::Failed);
    assert_eq!(status.attempts_made, 2);
    let last_error = status.last_error.unwrap();
    assert_eq!(last_error.attempt, 2);
    assert!(last_error.message.contains("attempt 2 failed"));

    worker.close().await;
}

#[tokio::test]
async fn single_slot_processes_jobs_sequentially() {
    let broker = Arc::new(MemoryBroker::new());
    let queue = queue(&broker, "sleep");
    let probe = Probe::default();

    for _ in 0..5 {
        queue.enqueue(SleepJob { ms: 300 }).await.unwrap();
    }

    let started_at = Instant::now();
    let (worker, mut events) =
        started(worker_builder(&broker, "sleep", &probe).with_concurrency(1)).await;
    wait_for_terminal(&mut events, 5, Duration::from_secs(10)).await;
    assert!(started_at.elapsed() >= Duration::from_millis(1500));

    let mut windows: Vec<(Instant, Instant)> = probe
        .invocations()
        .into_iter()
        .map(|i| (i.started, i.finished.unwrap()))
        .collect();
    windows.sort();
    for pair in windows.windows(2) {
        assert!(pair[0].1 <= pair[1].0, "handler windows overlap");
    }

    worker.close().await;
}

#[tokio::test]
async fn slots_run_jobs_in_parallel() {
    let broker = Arc::new(MemoryBroker::new());
    let queue = queue(&broker, "sleep");
    let probe = Probe::default();

    for _ in 0..5 {
        queue.enqueue(SleepJob { ms: 300 }).await.unwrap();
    }

    let started_at = Instant::now();
    let (worker, mut events) =
        started(worker_builder(&broker, "sleep", &probe).with_concurrency(5)).await;
    wait_for_terminal(&mut events, 5, Duration::from_secs(5)).await;

    assert!(started_at.elapsed() < Duration::from_millis(1000));
    assert_eq!(probe.invocations().len(), 5);

    worker.close().await;
}

#[tokio::test]
async fn unregistered_job_name_fails_through_retry_path() {
    let broker = Arc::new(MemoryBroker::new());
    let queue = queue(&broker, "misc");
    let probe = Probe::default();

    let job = queue
        .add(
            "nobody-handles-this",
            json!({}),
            JobOptions {
                attempts: 1,
                ..Default::default()
            },
        )
        .await
        .unwrap();

    let (worker, mut events) = started(worker_builder(&broker, "misc", &probe)).await;
    wait_for_terminal(&mut events, 1, Duration::from_secs(5)).await;

    let stored = queue.get_job(&job.id).await.unwrap().unwrap();
    assert_eq!(stored.state, JobState::Failed);
    assert!(stored.last_error.unwrap().message.contains("no handler registered"));

    worker.close().await;
}

#[tokio::test]
async fn undecodable_payload_is_a_handler_failure() {
    let broker = Arc::new(MemoryBroker::new());
    let queue = queue(&broker, "email");
    let probe = Probe::default();

    let job = queue
        .add(
            "send",
            json!({"recipient": 42}),
            JobOptions {
                attempts: 1,
                ..Default::default()
            },
        )
        .await
        .unwrap();

    let (worker, mut events) = started(worker_builder(&broker, "email", &probe)).await;
    wait_for_terminal(&mut events, 1, Duration::from_secs(5)).await;

    let stored = queue.get_job(&job.id).await.unwrap().unwrap();
    assert_eq!(stored.state, JobState::Failed);
    assert!(probe.invocations().is_empty());

    worker.close().await;
}

#[tokio::test]
async fn panicking_handler_is_recorded_as_failure() {
    let broker = Arc::new(MemoryBroker::new());
    let queue = queue(&broker, "panic");
    let probe = Probe::default();

    let job = queue
        .enqueue_with_options(
            common::PanicJob,
            JobOptions {
                attempts: 1,
                ..Default::default()
            },
        )
        .await
        .unwrap();

    let (worker, mut events) = started(worker_builder(&broker, "panic", &probe)).await;
    wait_for_terminal(&mut events, 1, Duration::from_secs(5)).await;

    let stored = queue.get_job(&job.id).await.unwrap().unwrap();
    assert_eq!(stored.state, JobState::Failed);
    assert!(stored.last_error.unwrap().message.contains("handler exploded"));

    // The slot survives the panic and keeps claiming.
    let next = queue.enqueue(SendEmail { to: "x@y.z".into() }).await.unwrap();
    wait_for_terminal(&mut events, 1, Duration::from_secs(5)).await;
    assert_eq!(
        queue.get_job(&next.id).await.unwrap().unwrap().state,
        JobState::Completed
    );

    worker.close().await;
}

#[tokio::test]
async fn rate_limit_spreads_starts_across_windows() {
    let broker = Arc::new(MemoryBroker::new());
    let queue = queue(&broker, "limited");
    let probe = Probe::default();

    for _ in 0..6 {
        queue.enqueue(SleepJob { ms: 1 }).await.unwrap();
    }

    let (worker, mut events) = started(
        worker_builder(&broker, "limited", &probe)
            .with_concurrency(6)
            .with_rate_limit(RateLimit::new(2, Duration::from_millis(400)).unwrap()),
    )
    .await;
    wait_for_terminal(&mut events, 6, Duration::from_secs(5)).await;

    let mut starts: Vec<Instant> = probe.invocations().iter().map(|i| i.started).collect();
    starts.sort();
    assert_eq!(starts.len(), 6);
    // Two per window: the fifth start opens the third window.
    assert!(starts[4] - starts[0] >= Duration::from_millis(750));

    worker.close().await;
}

#[tokio::test]
async fn delayed_job_is_not_started_before_due() {
    let broker = Arc::new(MemoryBroker::new());
    let queue = queue(&broker, "email");
    let probe = Probe::default();

    let enqueued = Instant::now();
    let job = queue
        .add(
            "send",
            json!({"to": "later@b.com"}),
            JobOptions {
                delay_ms: Some(400),
                ..Default::default()
            },
        )
        .await
        .unwrap();
    assert_eq!(job.state, JobState::Delayed);

    let (worker, mut events) = started(worker_builder(&broker, "email", &probe)).await;
    wait_for_terminal(&mut events, 1, Duration::from_secs(5)).await;

    let invocation = &probe.invocations_of(job.id)[0];
    assert!(invocation.started - enqueued >= Duration::from_millis(400));

    worker.close().await;
}

#[tokio::test]
async fn progress_is_visible_to_pollers() {
    let broker = Arc::new(MemoryBroker::new());
    let queue = queue(&broker, "progress");
    let probe = Probe::default();

    let job = queue.enqueue(common::ProgressJob).await.unwrap();
    assert_eq!(queue.inspector().get_progress(&job.id).await.unwrap(), None);

    let (worker, mut events) = started(worker_builder(&broker, "progress", &probe)).await;
    wait_for_terminal(&mut events, 1, Duration::from_secs(5)).await;

    assert_eq!(
        queue.inspector().get_progress(&job.id).await.unwrap(),
        Some(json!({"percent": 100}))
    );

    worker.close().await;
}

#[tokio::test]
async fn closure_handlers_run_by_name() {
    let broker = Arc::new(MemoryBroker::new());
    let queue = queue(&broker, "misc");
    let probe = Probe::default();

    let job = queue
        .add("echo", json!({"hello": "world"}), JobOptions::default())
        .await
        .unwrap();

    let (worker, mut events) = started(worker_builder(&broker, "misc", &probe)).await;
    wait_for_terminal(&mut events, 1, Duration::from_secs(5)).await;

    let stored = queue.get_job(&job.id).await.unwrap().unwrap();
    assert_eq!(stored.state, JobState::Completed);
    assert_eq!(stored.progress, Some(json!({"hello": "world"})));

    worker.close().await;
}

#[tokio::test]
async fn close_waits_for_in_flight_jobs() {
    let broker = Arc::new(MemoryBroker::new());
    let queue = queue(&broker, "sleep");
    let probe = Probe::default();

    let job = queue.enqueue(SleepJob { ms: 300 }).await.unwrap();
    let (worker, mut events) = started(worker_builder(&broker, "sleep", &probe)).await;

    let active = tokio::time::timeout(Duration::from_secs(5), events.recv())
        .await
        .unwrap()
        .unwrap();
    assert!(matches!(active, WorkerEvent::Active { .. }));

    let stats = worker.get_stats().await;
    assert_eq!(stats.queue_name, "sleep");
    assert_eq!(stats.active_jobs, 1);
    assert!(!stats.is_shutting_down);

    let report = worker.close().await;
    assert!(report.abandoned.is_empty());
    assert_eq!(
        queue.get_job(&job.id).await.unwrap().unwrap().state,
        JobState::Completed
    );
}

#[tokio::test]
async fn close_timeout_reports_abandoned_jobs() {
    let broker = Arc::new(MemoryBroker::new());
    let queue = queue(&broker, "sleep");
    let probe = Probe::default();

    let job = queue.enqueue(SleepJob { ms: 5_000 }).await.unwrap();
    let (worker, mut events) = started(
        worker_builder(&broker, "sleep", &probe).with_shutdown_timeout(Duration::from_millis(100)),
    )
    .await;

    tokio::time::timeout(Duration::from_secs(5), events.recv())
        .await
        .unwrap()
        .unwrap();

    let report = worker.close().await;
    assert_eq!(report.abandoned, vec![job.id]);

    // Left for a future reclaim pass rather than silently dropped.
    assert_eq!(
        queue.get_job(&job.id).await.unwrap().unwrap().state,
        JobState::Active
    );
    assert_eq!(queue.get_job_counts().await.unwrap().active, 1);
}

#[tokio::test]
async fn every_job_active_in_the_store_is_reported_on_timeout() {
    let broker = Arc::new(MemoryBroker::new());
    let queue = queue(&broker, "sleep");
    let probe = Probe::default();

    let mut ids = Vec::new();
    for _ in 0..3 {
        ids.push(queue.enqueue(SleepJob { ms: 5_000 }).await.unwrap().id);
    }
    let (worker, _events) = started(
        worker_builder(&broker, "sleep", &probe)
            .with_concurrency(3)
            .with_shutdown_timeout(Duration::from_millis(100)),
    )
    .await;

    tokio::time::timeout(Duration::from_secs(5), async {
        while queue.get_job_counts().await.unwrap().active < 3 {
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
    })
    .await
    .unwrap();

    let mut abandoned = worker.close().await.abandoned;
    abandoned.sort();
    ids.sort();
    assert_eq!(abandoned, ids);
}

#[tokio::test]
async fn closed_worker_claims_nothing_new() {
    let broker = Arc::new(MemoryBroker::new());
    let queue = queue(&broker, "email");
    let probe = Probe::default();

    let (worker, _events) = started(worker_builder(&broker, "email", &probe)).await;
    worker.close().await;

    queue
        .enqueue(SendEmail { to: "late@b.com".into() })
        .await
        .unwrap();
    tokio::time::sleep(Duration::from_millis(100)).await;
    assert_eq!(queue.get_job_counts().await.unwrap().waiting, 1);
}

#[tokio::test]
async fn zero_concurrency_is_rejected() {
    let broker = Arc::new(MemoryBroker::new());
    let probe = Probe::default();
    let result = worker_builder(&broker, "email", &probe)
        .with_concurrency(0)
        .spawn()
        .await;
    assert!(result.is_err());
}

#[tokio::test]
async fn two_workers_share_a_queue_without_double_processing() {
    let broker = Arc::new(MemoryBroker::new());
    let queue = queue(&broker, "sleep");
    let probe = Probe::default();

    for _ in 0..20 {
        queue.enqueue(SleepJob { ms: 10 }).await.unwrap();
    }

    let (first, _first_events) =
        started(worker_builder(&broker, "sleep", &probe).with_concurrency(3)).await;
    let (second, _second_events) = started(
        worker_builder(&broker, "sleep", &probe)
            .with_concurrency(3)
            .without_scheduler(),
    )
    .await;

    tokio::time::timeout(Duration::from_secs(5), async {
        loop {
            if queue.get_job_counts().await.unwrap().completed == 20 {
                break;
            }
            tokio::time::sleep(Duration::from_millis(20)).await;
        }
    })
    .await
    .unwrap();

    let mut ids: Vec<_> = probe.invocations().iter().map(|i| i.job_id).collect();
    ids.sort();
    ids.dedup();
    assert_eq!(ids.len(), 20);
    assert_eq!(probe.invocations().len(), 20);

    first.close().await;
    second.close().await;
}
