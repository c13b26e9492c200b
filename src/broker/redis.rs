// src/broker/redis.rs
//! Redis-backed store. Every state change is a Lua script or a MULTI
//! pipeline, so a single round trip either applies fully or not at all.

use crate::broker::{Broker, BrokerEvent, Claim, Transition};
use crate::lua::LuaScripts;
use crate::rate_limit::RateLimit;
use crate::repeat::RepeatableRegistration;
use crate::status::JobCounts;
use crate::{JobFailure, JobId, JobOptions, JobRecord, JobState, RelayError, Result};
use ::redis::aio::ConnectionManager;
use ::redis::{AsyncCommands, Client as RedisClient};
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use futures::{Stream, StreamExt};
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::time::Duration;

/// Upper bound on delayed jobs promoted per script call.
const PROMOTE_BATCH: usize = 1000;

/// Immutable part of a job, stored as one JSON field of the job hash.
#[derive(Serialize, Deserialize)]
struct JobData {
    name: String,
    queue_name: String,
    payload: serde_json::Value,
    options: JobOptions,
    repeat_key: Option<String>,
    enqueued_at: DateTime<Utc>,
}

impl JobData {
    fn encode(job: &JobRecord) -> Result<String> {
        let data = JobData {
            name: job.name.clone(),
            queue_name: job.queue_name.clone(),
            payload: job.payload.clone(),
            options: job.options.clone(),
            repeat_key: job.repeat_key.clone(),
            enqueued_at: job.enqueued_at,
        };
        Ok(serde_json::to_string(&data)?)
    }
}

#[derive(Debug, Clone)]
struct Keys {
    prefix: String,
}

impl Keys {
    fn job(&self, job_id: &JobId) -> String {
        format!("{}:job:{}", self.prefix, job_id)
    }

    fn job_prefix(&self) -> String {
        format!("{}:job:", self.prefix)
    }

    fn queue(&self, queue_name: &str, suffix: &str) -> String {
        format!("{}:queue:{}:{}", self.prefix, queue_name, suffix)
    }

    fn wait(&self, queue_name: &str) -> String {
        self.queue(queue_name, "wait")
    }

    fn delayed(&self, queue_name: &str) -> String {
        self.queue(queue_name, "delayed")
    }

    fn active(&self, queue_name: &str) -> String {
        self.queue(queue_name, "active")
    }

    fn completed(&self, queue_name: &str) -> String {
        self.queue(queue_name, "completed")
    }

    fn failed(&self, queue_name: &str) -> String {
        self.queue(queue_name, "failed")
    }

    fn limiter(&self, queue_name: &str) -> String {
        self.queue(queue_name, "limiter")
    }

    fn repeat(&self, queue_name: &str) -> String {
        self.queue(queue_name, "repeat")
    }

    fn repeat_defs(&self, queue_name: &str) -> String {
        self.queue(queue_name, "repeat:defs")
    }

    fn events(&self, queue_name: &str) -> String {
        format!("{}:events:{}", self.prefix, queue_name)
    }
}

pub struct RedisBroker {
    client: RedisClient,
    conn: ConnectionManager,
    scripts: LuaScripts,
    keys: Keys,
}

impl RedisBroker {
    pub async fn connect(redis_url: &str, key_prefix: impl Into<String>) -> Result<Self> {
        let client = RedisClient::open(redis_url)?;
        Self::from_client(client, key_prefix).await
    }

    /// The connection manager reconnects on its own; that transport-level
    /// retry is independent of job retries.
    pub async fn from_client(client: RedisClient, key_prefix: impl Into<String>) -> Result<Self> {
        let conn = client.get_connection_manager().await?;
        Ok(Self {
            client,
            conn,
            scripts: LuaScripts::new(),
            keys: Keys {
                prefix: key_prefix.into(),
            },
        })
    }

    pub async fn ping(&self) -> Result<()> {
        let mut con = self.conn.clone();
        let _: String = ::redis::cmd("PING").query_async(&mut con).await?;
        Ok(())
    }

    /// Stream of state change notifications for one queue. Messages that do
    /// not decode are skipped.
    pub async fn subscribe(&self, queue_name: &str) -> Result<impl Stream<Item = BrokerEvent>> {
        let mut pubsub = self.client.get_async_pubsub().await?;
        pubsub.subscribe(self.keys.events(queue_name)).await?;

        Ok(pubsub.into_on_message().filter_map(|msg| async move {
            let payload: String = msg.get_payload().ok()?;
            serde_json::from_str(&payload).ok()
        }))
    }

    async fn finish(
        &self,
        job: &JobRecord,
        state: JobState,
        finished_at: DateTime<Utc>,
        keep: Option<usize>,
        failure: Option<&JobFailure>,
    ) -> Result<()> {
        let target = match state {
            JobState::Completed => self.keys.completed(&job.queue_name),
            _ => self.keys.failed(&job.queue_name),
        };
        let (last_error, history) = match failure {
            Some(failure) => (
                serde_json::to_string(failure)?,
                history_with(job, failure)?,
            ),
            None => (String::new(), String::new()),
        };
        let keep = keep.map(|k| k as i64).unwrap_or(-1);

        let mut con = self.conn.clone();
        let pruned: i64 = self
            .scripts
            .finish_job
            .key(self.keys.active(&job.queue_name))
            .key(target)
            .key(self.keys.job(&job.id))
            .arg(job.id.to_string())
            .arg(state.as_str())
            .arg(finished_at.timestamp_millis())
            .arg(keep)
            .arg(last_error)
            .arg(history)
            .arg(self.keys.job_prefix())
            .arg(self.keys.events(&job.queue_name))
            .arg(&job.queue_name)
            .invoke_async(&mut con)
            .await?;

        if pruned < 0 {
            return Err(RelayError::NotActive(job.id));
        }
        if pruned > 0 {
            tracing::debug!(queue = %job.queue_name, pruned, state = %state, "Pruned retained jobs");
        }
        Ok(())
    }

    /// Retire a claimed job whose stored fields do not decode, so it does not
    /// sit in the active set without a holder.
    async fn fail_unreadable(
        &self,
        queue: &str,
        id: &JobId,
        attempt: u32,
        now: DateTime<Utc>,
        reason: &str,
    ) -> Result<()> {
        let failure = JobFailure {
            message: format!("job record could not be decoded: {}", reason),
            attempt,
            at: now,
        };
        let last_error = serde_json::to_string(&failure)?;
        let history = serde_json::to_string(&[&failure])?;

        let mut con = self.conn.clone();
        let _: i64 = self
            .scripts
            .finish_job
            .key(self.keys.active(queue))
            .key(self.keys.failed(queue))
            .key(self.keys.job(id))
            .arg(id.to_string())
            .arg(JobState::Failed.as_str())
            .arg(now.timestamp_millis())
            .arg(-1i64)
            .arg(last_error)
            .arg(history)
            .arg(self.keys.job_prefix())
            .arg(self.keys.events(queue))
            .arg(queue)
            .invoke_async(&mut con)
            .await?;
        Ok(())
    }
}

/// Field/value pairs of a flattened `HGETALL` reply.
fn pairs(flat: &[String]) -> HashMap<String, String> {
    flat.chunks_exact(2)
        .map(|pair| (pair[0].clone(), pair[1].clone()))
        .collect()
}

fn history_with(job: &JobRecord, failure: &JobFailure) -> Result<String> {
    let mut history = job.error_history.clone();
    history.push(failure.clone());
    Ok(serde_json::to_string(&history)?)
}

fn json_field<T: DeserializeOwned>(
    fields: &HashMap<String, String>,
    name: &str,
) -> Result<Option<T>> {
    match fields.get(name) {
        Some(raw) if !raw.is_empty() => Ok(Some(serde_json::from_str(raw)?)),
        _ => Ok(None),
    }
}

fn millis_field(fields: &HashMap<String, String>, name: &str) -> Result<Option<DateTime<Utc>>> {
    match fields.get(name) {
        None => Ok(None),
        Some(raw) => raw
            .parse::<i64>()
            .ok()
            .and_then(DateTime::from_timestamp_millis)
            .map(Some)
            .ok_or_else(|| RelayError::Corrupt(format!("{}='{}'", name, raw))),
    }
}

fn decode_job(id: JobId, fields: HashMap<String, String>) -> Result<Option<JobRecord>> {
    let Some(data) = fields.get("data") else {
        return Ok(None);
    };
    let data: JobData = serde_json::from_str(data)?;

    let state: JobState = fields
        .get("state")
        .ok_or_else(|| RelayError::Corrupt(format!("job {} has no state", id)))?
        .parse()?;
    let attempts_made = match fields.get("attempts_made") {
        Some(raw) => raw
            .parse()
            .map_err(|_| RelayError::Corrupt(format!("attempts_made='{}'", raw)))?,
        None => 0,
    };

    Ok(Some(JobRecord {
        id,
        name: data.name,
        queue_name: data.queue_name,
        payload: data.payload,
        options: data.options,
        state,
        attempts_made,
        progress: json_field(&fields, "progress")?,
        last_error: json_field(&fields, "last_error")?,
        error_history: json_field(&fields, "errors")?.unwrap_or_default(),
        repeat_key: data.repeat_key,
        worker_id: fields.get("worker_id").cloned(),
        enqueued_at: data.enqueued_at,
        processed_at: millis_field(&fields, "processed_at")?,
        finished_at: millis_field(&fields, "finished_at")?,
    }))
}

#[async_trait]
impl Broker for RedisBroker {
    async fn add_job(&self, job: &JobRecord, due_at: Option<DateTime<Utc>>) -> Result<bool> {
        let due_at = due_at
            .map(|at| at.timestamp_millis().to_string())
            .unwrap_or_default();

        let mut con = self.conn.clone();
        let added: i64 = self
            .scripts
            .add_job
            .key(self.keys.job(&job.id))
            .key(self.keys.wait(&job.queue_name))
            .key(self.keys.delayed(&job.queue_name))
            .arg(job.id.to_string())
            .arg(JobData::encode(job)?)
            .arg(due_at)
            .arg(self.keys.events(&job.queue_name))
            .arg(&job.queue_name)
            .invoke_async(&mut con)
            .await?;

        Ok(added == 1)
    }

    async fn claim(
        &self,
        queue: &str,
        worker_id: &str,
        limit: Option<&RateLimit>,
        now: DateTime<Utc>,
    ) -> Result<Claim> {
        let (max, window_ms) = limit.map(|l| (l.max, l.window_ms())).unwrap_or((0, 0));

        let mut con = self.conn.clone();
        let reply: Vec<String> = self
            .scripts
            .claim_job
            .key(self.keys.wait(queue))
            .key(self.keys.active(queue))
            .key(self.keys.limiter(queue))
            .key(self.keys.failed(queue))
            .arg(self.keys.job_prefix())
            .arg(worker_id)
            .arg(now.timestamp_millis())
            .arg(max)
            .arg(window_ms)
            .arg(self.keys.events(queue))
            .arg(queue)
            .arg(now.to_rfc3339())
            .invoke_async(&mut con)
            .await?;

        match reply.first().map(String::as_str) {
            Some("claimed") => {
                let id: JobId = reply
                    .get(1)
                    .ok_or_else(|| RelayError::Corrupt("claim reply without id".to_string()))?
                    .parse()?;
                // The script returns the claimed hash with the id.
                let fields = pairs(reply.get(2..).unwrap_or_default());
                let attempt = fields
                    .get("attempts_made")
                    .and_then(|raw| raw.parse().ok())
                    .unwrap_or(0);

                let err = match decode_job(id, fields) {
                    Ok(Some(job)) => return Ok(Claim::Job(Box::new(job))),
                    Ok(None) => RelayError::Corrupt(format!("claimed job {} has no data", id)),
                    Err(e) => e,
                };
                self.fail_unreadable(queue, &id, attempt, now, &err.to_string())
                    .await?;
                Err(err)
            }
            Some("throttled") => {
                let wait_ms = reply
                    .get(1)
                    .and_then(|raw| raw.parse::<u64>().ok())
                    .unwrap_or(window_ms);
                Ok(Claim::Throttled(Duration::from_millis(wait_ms.max(1))))
            }
            _ => Ok(Claim::Empty),
        }
    }

    async fn transition(&self, job: &JobRecord, transition: Transition) -> Result<()> {
        match transition {
            Transition::Complete { finished_at, keep } => {
                self.finish(job, JobState::Completed, finished_at, keep, None)
                    .await
            }
            Transition::Fail {
                finished_at,
                failure,
                keep,
            } => {
                self.finish(job, JobState::Failed, finished_at, keep, Some(&failure))
                    .await
            }
            Transition::Retry { due_at, failure } => {
                let mut con = self.conn.clone();
                let moved: i64 = self
                    .scripts
                    .retry_job
                    .key(self.keys.active(&job.queue_name))
                    .key(self.keys.delayed(&job.queue_name))
                    .key(self.keys.job(&job.id))
                    .arg(job.id.to_string())
                    .arg(due_at.timestamp_millis())
                    .arg(serde_json::to_string(&failure)?)
                    .arg(history_with(job, &failure)?)
                    .arg(self.keys.events(&job.queue_name))
                    .arg(&job.queue_name)
                    .invoke_async(&mut con)
                    .await?;

                if moved < 0 {
                    return Err(RelayError::NotActive(job.id));
                }
                Ok(())
            }
        }
    }

    /// Runs batches until one comes back short, so every due job moves.
    async fn promote_due(&self, queue: &str, now: DateTime<Utc>) -> Result<Vec<JobId>> {
        let mut con = self.conn.clone();
        let mut promoted = Vec::new();

        loop {
            let reply: Vec<String> = self
                .scripts
                .move_delayed
                .key(self.keys.delayed(queue))
                .key(self.keys.wait(queue))
                .arg(now.timestamp_millis())
                .arg(self.keys.job_prefix())
                .arg(self.keys.events(queue))
                .arg(queue)
                .arg(PROMOTE_BATCH)
                .invoke_async(&mut con)
                .await?;

            let Some((scanned, ids)) = reply.split_first() else {
                break;
            };
            for id in ids {
                promoted.push(id.parse::<JobId>()?);
            }
            let scanned: usize = scanned
                .parse()
                .map_err(|_| RelayError::Corrupt(format!("promote reply count '{}'", scanned)))?;
            if scanned < PROMOTE_BATCH {
                break;
            }
        }

        Ok(promoted)
    }

    async fn get_job(&self, id: &JobId) -> Result<Option<JobRecord>> {
        let mut con = self.conn.clone();
        let fields: HashMap<String, String> = con.hgetall(self.keys.job(id)).await?;
        decode_job(*id, fields)
    }

    async fn update_progress(
        &self,
        queue: &str,
        id: &JobId,
        progress: serde_json::Value,
    ) -> Result<()> {
        let mut con = self.conn.clone();
        let _: i64 = self
            .scripts
            .update_progress
            .key(self.keys.job(id))
            .arg(serde_json::to_string(&progress)?)
            .arg(self.keys.events(queue))
            .arg(queue)
            .arg(id.to_string())
            .invoke_async(&mut con)
            .await?;
        Ok(())
    }

    async fn counts(&self, queue: &str) -> Result<JobCounts> {
        let mut con = self.conn.clone();
        let (waiting, delayed, active, completed, failed): (usize, usize, usize, usize, usize) =
            ::redis::pipe()
                .llen(self.keys.wait(queue))
                .zcard(self.keys.delayed(queue))
                .zcard(self.keys.active(queue))
                .zcard(self.keys.completed(queue))
                .zcard(self.keys.failed(queue))
                .query_async(&mut con)
                .await?;

        Ok(JobCounts {
            waiting,
            delayed,
            active,
            completed,
            failed,
        })
    }

    async fn upsert_repeatable(&self, registration: &RepeatableRegistration) -> Result<()> {
        let queue = &registration.queue_name;
        let definition = serde_json::to_string(registration)?;

        let mut con = self.conn.clone();
        let _: () = ::redis::pipe()
            .atomic()
            .hset(self.keys.repeat_defs(queue), &registration.key, definition)
            .ignore()
            .zadd(
                self.keys.repeat(queue),
                &registration.key,
                registration.next_fire_at.timestamp_millis(),
            )
            .ignore()
            .query_async(&mut con)
            .await?;
        Ok(())
    }

    async fn remove_repeatable(&self, queue: &str, key: &str) -> Result<bool> {
        let mut con = self.conn.clone();
        let (removed, _): (i64, i64) = ::redis::pipe()
            .atomic()
            .hdel(self.keys.repeat_defs(queue), key)
            .zrem(self.keys.repeat(queue), key)
            .query_async(&mut con)
            .await?;
        Ok(removed > 0)
    }

    async fn clear_repeatables(&self, queue: &str) -> Result<usize> {
        let mut con = self.conn.clone();
        let (count, _, _): (usize, i64, i64) = ::redis::pipe()
            .atomic()
            .hlen(self.keys.repeat_defs(queue))
            .del(self.keys.repeat_defs(queue))
            .del(self.keys.repeat(queue))
            .query_async(&mut con)
            .await?;
        Ok(count)
    }

    async fn repeatables(&self, queue: &str) -> Result<Vec<RepeatableRegistration>> {
        let mut con = self.conn.clone();
        let definitions: HashMap<String, String> =
            con.hgetall(self.keys.repeat_defs(queue)).await?;

        let mut registrations = definitions
            .values()
            .map(|raw| serde_json::from_str(raw))
            .collect::<std::result::Result<Vec<RepeatableRegistration>, _>>()?;
        registrations.sort_by_key(|r| r.next_fire_at);
        Ok(registrations)
    }

    async fn fire_repeatable(
        &self,
        registration: &RepeatableRegistration,
        next_fire_at: DateTime<Utc>,
        job: &JobRecord,
    ) -> Result<bool> {
        let queue = &registration.queue_name;
        let updated = RepeatableRegistration {
            next_fire_at,
            ..registration.clone()
        };

        let mut con = self.conn.clone();
        let fired: i64 = self
            .scripts
            .fire_repeatable
            .key(self.keys.repeat(queue))
            .key(self.keys.repeat_defs(queue))
            .key(self.keys.job(&job.id))
            .key(self.keys.wait(queue))
            .arg(&registration.key)
            .arg(registration.next_fire_at.timestamp_millis())
            .arg(next_fire_at.timestamp_millis())
            .arg(serde_json::to_string(&updated)?)
            .arg(job.id.to_string())
            .arg(JobData::encode(job)?)
            .arg(self.keys.events(queue))
            .arg(queue)
            .invoke_async(&mut con)
            .await?;

        Ok(fired == 1)
    }
}
