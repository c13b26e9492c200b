// src/scheduler.rs
//! Promotes due delayed jobs and fires cron registrations. Safe to run from
//! any number of processes at once: every step is a single atomic store
//! operation.

use crate::broker::Broker;
use crate::{JobId, Result};
use chrono::{DateTime, Utc};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::broadcast;
use tokio::task::JoinHandle;
use tokio::time::MissedTickBehavior;
use tracing::{debug, error, info, warn};

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct TickSummary {
    pub promoted: usize,
    pub fired: usize,
}

#[derive(Clone)]
pub struct Scheduler {
    broker: Arc<dyn Broker>,
    queue_name: String,
}

impl Scheduler {
    pub fn new(broker: Arc<dyn Broker>, queue_name: impl Into<String>) -> Self {
        Self {
            broker,
            queue_name: queue_name.into(),
        }
    }

    pub async fn promote_due_jobs(&self, now: DateTime<Utc>) -> Result<Vec<JobId>> {
        self.broker.promote_due(&self.queue_name, now).await
    }

    /// Materialize one job per registration whose fire time has passed.
    /// Occurrences missed while no scheduler ran collapse into one.
    pub async fn fire_due_repeatables(&self, now: DateTime<Utc>) -> Result<usize> {
        let mut fired = 0;

        for registration in self.broker.repeatables(&self.queue_name).await? {
            if registration.next_fire_at > now {
                continue;
            }
            let next_fire_at = match registration.repeat.next_after(now) {
                Ok(next) => next,
                Err(e) => {
                    warn!(key = %registration.key, error = %e, "Skipping unschedulable repeatable");
                    continue;
                }
            };

            let job = registration.materialize(registration.next_fire_at, now);
            let won = match self
                .broker
                .fire_repeatable(&registration, next_fire_at, &job)
                .await
            {
                Ok(won) => won,
                Err(e) => {
                    error!(key = %registration.key, error = %e, "Failed to fire repeatable");
                    continue;
                }
            };
            if won {
                fired += 1;
                info!(
                    key = %registration.key,
                    job_id = %job.id,
                    next_fire_at = %next_fire_at,
                    "Repeatable fired"
                );
            } else {
                debug!(key = %registration.key, "Occurrence already fired elsewhere");
            }
        }

        Ok(fired)
    }

    pub async fn tick(&self, now: DateTime<Utc>) -> Result<TickSummary> {
        let promoted = self.promote_due_jobs(now).await?.len();
        let fired = self.fire_due_repeatables(now).await?;
        Ok(TickSummary { promoted, fired })
    }

    /// Tick every `interval` until a shutdown message arrives.
    pub fn spawn(self, interval: Duration, mut shutdown_rx: broadcast::Receiver<()>) -> JoinHandle<()> {
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(interval);
            ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);

            loop {
                tokio::select! {
                    _ = ticker.tick() => {}
                    _ = shutdown_rx.recv() => {
                        info!(queue = %self.queue_name, "Scheduler stopping");
                        break;
                    }
                }

                match self.tick(Utc::now()).await {
                    Ok(summary) if summary != TickSummary::default() => {
                        debug!(
                            queue = %self.queue_name,
                            promoted = summary.promoted,
                            fired = summary.fired,
                            "Scheduler tick"
                        );
                    }
                    Ok(_) => {}
                    Err(e) => {
                        error!(queue = %self.queue_name, "Scheduler tick failed: {}", e);
                    }
                }
            }
        })
    }
}
