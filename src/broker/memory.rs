// src/broker/memory.rs
//! In-process store with the same atomic contract as the Redis store. Every
//! operation runs under one lock, which is what makes claims and promotions
//! atomic here.

use crate::broker::{Broker, BrokerEvent, BrokerEventKind, Claim, Transition};
use crate::rate_limit::{FixedWindow, RateLimit};
use crate::repeat::RepeatableRegistration;
use crate::status::JobCounts;
use crate::{JobId, JobRecord, JobState, RelayError, Result};
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use std::collections::{BTreeSet, HashMap, VecDeque};
use tokio::sync::{broadcast, Mutex};

#[derive(Default)]
struct QueueLists {
    waiting: VecDeque<JobId>,
    delayed: BTreeSet<(i64, JobId)>,
    active: HashMap<JobId, i64>,
    completed: VecDeque<JobId>,
    failed: VecDeque<JobId>,
    repeatables: HashMap<String, RepeatableRegistration>,
    limiter: FixedWindow,
}

#[derive(Default)]
struct State {
    jobs: HashMap<JobId, JobRecord>,
    queues: HashMap<String, QueueLists>,
}

pub struct MemoryBroker {
    state: Mutex<State>,
    events: broadcast::Sender<BrokerEvent>,
}

impl Default for MemoryBroker {
    fn default() -> Self {
        Self::new()
    }
}

impl MemoryBroker {
    pub fn new() -> Self {
        let (events, _) = broadcast::channel(1024);
        Self {
            state: Mutex::new(State::default()),
            events,
        }
    }

    /// Receive every state change notification from now on.
    pub fn subscribe(&self) -> broadcast::Receiver<BrokerEvent> {
        self.events.subscribe()
    }

    fn publish(&self, queue: &str, job_id: JobId, kind: BrokerEventKind) {
        // No subscribers is fine.
        let _ = self.events.send(BrokerEvent {
            queue: queue.to_string(),
            job_id,
            kind,
        });
    }
}

fn prune(
    list: &mut VecDeque<JobId>,
    keep: Option<usize>,
    jobs: &mut HashMap<JobId, JobRecord>,
) -> usize {
    let Some(keep) = keep else {
        return 0;
    };
    let mut pruned = 0;
    while list.len() > keep {
        if let Some(oldest) = list.pop_front() {
            jobs.remove(&oldest);
            pruned += 1;
        }
    }
    pruned
}

#[async_trait]
impl Broker for MemoryBroker {
    async fn add_job(&self, job: &JobRecord, due_at: Option<DateTime<Utc>>) -> Result<bool> {
        let mut state = self.state.lock().await;
        let State { jobs, queues } = &mut *state;
        if jobs.contains_key(&job.id) {
            return Ok(false);
        }

        let lists = queues.entry(job.queue_name.clone()).or_default();
        let mut stored = job.clone();
        match due_at {
            Some(due_at) => {
                stored.state = JobState::Delayed;
                lists.delayed.insert((due_at.timestamp_millis(), job.id));
            }
            None => {
                stored.state = JobState::Waiting;
                lists.waiting.push_back(job.id);
            }
        }
        jobs.insert(job.id, stored);

        self.publish(&job.queue_name, job.id, BrokerEventKind::Added);
        Ok(true)
    }

    async fn claim(
        &self,
        queue: &str,
        worker_id: &str,
        limit: Option<&RateLimit>,
        now: DateTime<Utc>,
    ) -> Result<Claim> {
        let mut state = self.state.lock().await;
        let State { jobs, queues } = &mut *state;
        let lists = queues.entry(queue.to_string()).or_default();

        if lists.waiting.is_empty() {
            return Ok(Claim::Empty);
        }
        if let Some(limit) = limit {
            if let Some(wait) = lists.limiter.wait(limit, now.timestamp_millis()) {
                return Ok(Claim::Throttled(wait));
            }
        }

        while let Some(id) = lists.waiting.pop_front() {
            let Some(job) = jobs.get_mut(&id) else {
                continue;
            };
            if let Some(limit) = limit {
                lists.limiter.record(limit, now.timestamp_millis());
            }
            job.state = JobState::Active;
            job.attempts_made += 1;
            job.processed_at = Some(now);
            job.worker_id = Some(worker_id.to_string());
            lists.active.insert(id, now.timestamp_millis());

            let claimed = job.clone();
            self.publish(queue, id, BrokerEventKind::Active);
            return Ok(Claim::Job(Box::new(claimed)));
        }

        Ok(Claim::Empty)
    }

    async fn transition(&self, job: &JobRecord, transition: Transition) -> Result<()> {
        let mut state = self.state.lock().await;
        let State { jobs, queues } = &mut *state;
        let lists = queues.entry(job.queue_name.clone()).or_default();

        if lists.active.remove(&job.id).is_none() {
            return Err(RelayError::NotActive(job.id));
        }
        let stored = jobs
            .get_mut(&job.id)
            .ok_or(RelayError::NotActive(job.id))?;

        let kind = match transition {
            Transition::Complete { finished_at, keep } => {
                stored.state = JobState::Completed;
                stored.finished_at = Some(finished_at);
                lists.completed.push_back(job.id);
                prune(&mut lists.completed, keep, jobs);
                BrokerEventKind::Completed
            }
            Transition::Retry { due_at, failure } => {
                stored.state = JobState::Delayed;
                stored.error_history.push(failure.clone());
                stored.last_error = Some(failure);
                lists.delayed.insert((due_at.timestamp_millis(), job.id));
                BrokerEventKind::Retrying
            }
            Transition::Fail {
                finished_at,
                failure,
                keep,
            } => {
                stored.state = JobState::Failed;
                stored.finished_at = Some(finished_at);
                stored.error_history.push(failure.clone());
                stored.last_error = Some(failure);
                lists.failed.push_back(job.id);
                prune(&mut lists.failed, keep, jobs);
                BrokerEventKind::Failed
            }
        };

        self.publish(&job.queue_name, job.id, kind);
        Ok(())
    }

    async fn promote_due(&self, queue: &str, now: DateTime<Utc>) -> Result<Vec<JobId>> {
        let mut state = self.state.lock().await;
        let State { jobs, queues } = &mut *state;
        let lists = queues.entry(queue.to_string()).or_default();
        let now_ms = now.timestamp_millis();

        let mut promoted = Vec::new();
        while let Some(&(due_ms, id)) = lists.delayed.first() {
            if due_ms > now_ms {
                break;
            }
            lists.delayed.pop_first();
            if let Some(job) = jobs.get_mut(&id) {
                job.state = JobState::Waiting;
                lists.waiting.push_back(id);
                promoted.push(id);
            }
        }

        for id in &promoted {
            self.publish(queue, *id, BrokerEventKind::Promoted);
        }
        Ok(promoted)
    }

    async fn get_job(&self, id: &JobId) -> Result<Option<JobRecord>> {
        let state = self.state.lock().await;
        Ok(state.jobs.get(id).cloned())
    }

    async fn update_progress(
        &self,
        queue: &str,
        id: &JobId,
        progress: serde_json::Value,
    ) -> Result<()> {
        let mut state = self.state.lock().await;
        if let Some(job) = state.jobs.get_mut(id) {
            job.progress = Some(progress);
            self.publish(queue, *id, BrokerEventKind::Progress);
        }
        Ok(())
    }

    async fn counts(&self, queue: &str) -> Result<JobCounts> {
        let state = self.state.lock().await;
        Ok(match state.queues.get(queue) {
            Some(lists) => JobCounts {
                waiting: lists.waiting.len(),
                delayed: lists.delayed.len(),
                active: lists.active.len(),
                completed: lists.completed.len(),
                failed: lists.failed.len(),
            },
            None => JobCounts::default(),
        })
    }

    async fn upsert_repeatable(&self, registration: &RepeatableRegistration) -> Result<()> {
        let mut state = self.state.lock().await;
        state
            .queues
            .entry(registration.queue_name.clone())
            .or_default()
            .repeatables
            .insert(registration.key.clone(), registration.clone());
        Ok(())
    }

    async fn remove_repeatable(&self, queue: &str, key: &str) -> Result<bool> {
        let mut state = self.state.lock().await;
        Ok(state
            .queues
            .get_mut(queue)
            .map(|lists| lists.repeatables.remove(key).is_some())
            .unwrap_or(false))
    }

    async fn clear_repeatables(&self, queue: &str) -> Result<usize> {
        let mut state = self.state.lock().await;
        Ok(state
            .queues
            .get_mut(queue)
            .map(|lists| lists.repeatables.drain().count())
            .unwrap_or(0))
    }

    async fn repeatables(&self, queue: &str) -> Result<Vec<RepeatableRegistration>> {
        let state = self.state.lock().await;
        let mut registrations: Vec<RepeatableRegistration> = state
            .queues
            .get(queue)
            .map(|lists| lists.repeatables.values().cloned().collect())
            .unwrap_or_default();
        registrations.sort_by_key(|r| r.next_fire_at);
        Ok(registrations)
    }

    async fn fire_repeatable(
        &self,
        registration: &RepeatableRegistration,
        next_fire_at: DateTime<Utc>,
        job: &JobRecord,
    ) -> Result<bool> {
        let mut state = self.state.lock().await;
        let State { jobs, queues } = &mut *state;
        let lists = queues.entry(registration.queue_name.clone()).or_default();

        match lists.repeatables.get_mut(&registration.key) {
            Some(stored) if stored.next_fire_at == registration.next_fire_at => {
                stored.next_fire_at = next_fire_at;
            }
            _ => return Ok(false),
        }
        if jobs.contains_key(&job.id) {
            return Ok(false);
        }

        let mut stored = job.clone();
        stored.state = JobState::Waiting;
        jobs.insert(job.id, stored);
        lists.waiting.push_back(job.id);

        self.publish(&registration.queue_name, job.id, BrokerEventKind::Added);
        Ok(true)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{JobOptions, RepeatOptions};
    use chrono::Duration;
    use serde_json::json;

    fn job(queue: &str) -> JobRecord {
        JobRecord::new(queue, "test", json!({"n": 1}), JobOptions::default(), Utc::now())
    }

    #[tokio::test]
    async fn claim_marks_active_and_counts_attempt() {
        let broker = MemoryBroker::new();
        let job = job("q");
        assert!(broker.add_job(&job, None).await.unwrap());

        let Claim::Job(claimed) = broker.claim("q", "w1", None, Utc::now()).await.unwrap() else {
            panic!("expected a job");
        };
        assert_eq!(claimed.id, job.id);
        assert_eq!(claimed.state, JobState::Active);
        assert_eq!(claimed.attempts_made, 1);
        assert_eq!(claimed.worker_id.as_deref(), Some("w1"));

        assert_eq!(
            broker.claim("q", "w2", None, Utc::now()).await.unwrap(),
            Claim::Empty
        );
    }

    #[tokio::test]
    async fn throttled_claims_leave_budget_alone() {
        let broker = MemoryBroker::new();
        let limit = RateLimit::new(1, std::time::Duration::from_millis(1000)).unwrap();
        for _ in 0..2 {
            broker.add_job(&job("q"), None).await.unwrap();
        }

        let start = Utc::now();
        assert!(matches!(
            broker.claim("q", "w", Some(&limit), start).await.unwrap(),
            Claim::Job(_)
        ));
        for offset in [10, 500, 999] {
            assert!(matches!(
                broker
                    .claim("q", "w", Some(&limit), start + Duration::milliseconds(offset))
                    .await
                    .unwrap(),
                Claim::Throttled(_)
            ));
        }
        assert!(matches!(
            broker
                .claim("q", "w", Some(&limit), start + Duration::milliseconds(1000))
                .await
                .unwrap(),
            Claim::Job(_)
        ));
    }

    #[tokio::test]
    async fn duplicate_ids_are_rejected() {
        let broker = MemoryBroker::new();
        let job = job("q");
        assert!(broker.add_job(&job, None).await.unwrap());
        assert!(!broker.add_job(&job, None).await.unwrap());
        assert_eq!(broker.counts("q").await.unwrap().waiting, 1);
    }

    #[tokio::test]
    async fn transition_requires_active() {
        let broker = MemoryBroker::new();
        let job = job("q");
        broker.add_job(&job, None).await.unwrap();

        let err = broker
            .transition(
                &job,
                Transition::Complete {
                    finished_at: Utc::now(),
                    keep: None,
                },
            )
            .await
            .unwrap_err();
        assert!(matches!(err, RelayError::NotActive(id) if id == job.id));
    }

    #[tokio::test]
    async fn completed_retention_prunes_oldest() {
        let broker = MemoryBroker::new();
        let mut ids = Vec::new();
        for _ in 0..3 {
            let job = job("q");
            ids.push(job.id);
            broker.add_job(&job, None).await.unwrap();
        }
        for _ in 0..3 {
            let Claim::Job(claimed) = broker.claim("q", "w", None, Utc::now()).await.unwrap()
            else {
                panic!("expected a job");
            };
            broker
                .transition(
                    &claimed,
                    Transition::Complete {
                        finished_at: Utc::now(),
                        keep: Some(2),
                    },
                )
                .await
                .unwrap();
        }

        assert_eq!(broker.counts("q").await.unwrap().completed, 2);
        assert!(broker.get_job(&ids[0]).await.unwrap().is_none());
        assert!(broker.get_job(&ids[2]).await.unwrap().is_some());
    }

    #[tokio::test]
    async fn promote_only_moves_due_jobs() {
        let broker = MemoryBroker::new();
        let now = Utc::now();
        let soon = job("q");
        let later = job("q");
        broker
            .add_job(&soon, Some(now + Duration::milliseconds(10)))
            .await
            .unwrap();
        broker
            .add_job(&later, Some(now + Duration::seconds(60)))
            .await
            .unwrap();

        assert!(broker.promote_due("q", now).await.unwrap().is_empty());
        let promoted = broker
            .promote_due("q", now + Duration::milliseconds(10))
            .await
            .unwrap();
        assert_eq!(promoted, vec![soon.id]);

        let counts = broker.counts("q").await.unwrap();
        assert_eq!((counts.waiting, counts.delayed), (1, 1));
    }

    #[tokio::test]
    async fn throttled_only_when_work_is_waiting() {
        let broker = MemoryBroker::new();
        let limit = RateLimit::new(1, std::time::Duration::from_secs(60)).unwrap();
        let now = Utc::now();

        assert_eq!(
            broker.claim("q", "w", Some(&limit), now).await.unwrap(),
            Claim::Empty
        );
        broker.add_job(&job("q"), None).await.unwrap();
        broker.add_job(&job("q"), None).await.unwrap();

        assert!(matches!(
            broker.claim("q", "w", Some(&limit), now).await.unwrap(),
            Claim::Job(_)
        ));
        assert!(matches!(
            broker.claim("q", "w", Some(&limit), now).await.unwrap(),
            Claim::Throttled(_)
        ));
    }

    #[tokio::test]
    async fn stale_fire_is_ignored() {
        let broker = MemoryBroker::new();
        let now = Utc::now();
        let registration = RepeatableRegistration {
            key: "k".to_string(),
            queue_name: "q".to_string(),
            name: "tick".to_string(),
            payload: json!(null),
            repeat: RepeatOptions::cron("* * * * *"),
            options: JobOptions::default(),
            next_fire_at: now,
        };
        broker.upsert_repeatable(&registration).await.unwrap();

        let next = now + Duration::minutes(1);
        let job = registration.materialize(now, now);
        assert!(broker
            .fire_repeatable(&registration, next, &job)
            .await
            .unwrap());
        assert!(!broker
            .fire_repeatable(&registration, next, &job)
            .await
            .unwrap());

        let stored = broker.repeatables("q").await.unwrap();
        assert_eq!(stored[0].next_fire_at, next);
        assert_eq!(broker.counts("q").await.unwrap().waiting, 1);
    }

    #[tokio::test]
    async fn events_are_published() {
        let broker = MemoryBroker::new();
        let mut events = broker.subscribe();
        let job = job("q");
        broker.add_job(&job, None).await.unwrap();

        let event = events.recv().await.unwrap();
        assert_eq!(event.kind, BrokerEventKind::Added);
        assert_eq!(event.job_id, job.id);
    }
}
