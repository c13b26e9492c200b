// src/repeat.rs
//! Cron-based repeat rules and their stored registrations.

use crate::{JobId, JobOptions, JobRecord, JobState, RelayError, Result};
use chrono::{DateTime, Utc};
use chrono_tz::Tz;
use cron::Schedule;
use serde::{Deserialize, Serialize};
use std::str::FromStr;

/// How a repeatable job recurs.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RepeatOptions {
    /// Cron expression: minute hour day-of-month month day-of-week.
    pub pattern: String,
    /// IANA timezone the pattern is evaluated in; UTC when absent.
    pub tz: Option<String>,
    /// Explicit registration key. Derived from name, tz and pattern when absent.
    pub key: Option<String>,
}

impl RepeatOptions {
    pub fn cron(pattern: impl Into<String>) -> Self {
        Self {
            pattern: pattern.into(),
            tz: None,
            key: None,
        }
    }

    pub fn with_tz(mut self, tz: impl Into<String>) -> Self {
        self.tz = Some(tz.into());
        self
    }

    pub fn with_key(mut self, key: impl Into<String>) -> Self {
        self.key = Some(key.into());
        self
    }

    pub fn validate(&self) -> Result<()> {
        self.schedules()?;
        self.timezone()?;
        Ok(())
    }

    /// Key identifying this rule; registering the same key twice replaces.
    pub fn registration_key(&self, job_name: &str) -> String {
        match &self.key {
            Some(key) => key.clone(),
            None => format!(
                "{}::{}::{}",
                job_name,
                self.tz.as_deref().unwrap_or("UTC"),
                self.pattern
            ),
        }
    }

    /// Next occurrence strictly after `after`.
    pub fn next_after(&self, after: DateTime<Utc>) -> Result<DateTime<Utc>> {
        let tz = self.timezone()?;
        let local_after = after.with_timezone(&tz);

        let next_local = self
            .schedules()?
            .iter()
            .filter_map(|schedule| schedule.after(&local_after).next())
            .min()
            .ok_or_else(|| {
                RelayError::InvalidCron(format!("'{}' has no upcoming occurrence", self.pattern))
            })?;

        Ok(next_local.with_timezone(&Utc))
    }

    /// A pattern restricting both day fields matches either of them, so it
    /// becomes two schedules.
    fn schedules(&self) -> Result<Vec<Schedule>> {
        to_cron_crate_format(&self.pattern)
            .iter()
            .map(|expression| {
                Schedule::from_str(expression)
                    .map_err(|e| RelayError::InvalidCron(format!("'{}': {}", self.pattern, e)))
            })
            .collect()
    }

    fn timezone(&self) -> Result<Tz> {
        match &self.tz {
            None => Ok(Tz::UTC),
            Some(tz) => tz
                .parse()
                .map_err(|_| RelayError::InvalidCron(format!("unknown timezone '{}'", tz))),
        }
    }
}

/// A stored repeat rule: one per distinct key.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RepeatableRegistration {
    pub key: String,
    pub queue_name: String,
    pub name: String,
    pub payload: serde_json::Value,
    pub repeat: RepeatOptions,
    /// Options applied to every materialized job.
    pub options: JobOptions,
    pub next_fire_at: DateTime<Utc>,
}

impl RepeatableRegistration {
    /// Build the concrete job for the occurrence at `fire_at`.
    pub fn materialize(&self, fire_at: DateTime<Utc>, now: DateTime<Utc>) -> JobRecord {
        let options = JobOptions {
            delay_ms: None,
            repeat: None,
            ..self.options.clone()
        };
        let mut job = JobRecord::new(
            self.queue_name.clone(),
            self.name.clone(),
            self.payload.clone(),
            options,
            now,
        );
        job.id = JobId::for_occurrence(&self.key, fire_at);
        job.state = JobState::Waiting;
        job.repeat_key = Some(self.key.clone());
        job
    }
}

/// The `cron` crate wants seconds first and an optional year, and numbers
/// days of the week 1-7 from Sunday. Standard 5-field expressions get a zero
/// seconds field, a wildcard year and a renumbered day-of-week field.
///
/// The `cron` crate also requires both day fields to match, while standard
/// cron fires when either restricted one does. Such patterns are split into
/// a day-of-month schedule and a day-of-week schedule.
fn to_cron_crate_format(expression: &str) -> Vec<String> {
    let fields: Vec<&str> = expression.split_whitespace().collect();
    if fields.len() != 5 {
        return vec![expression.to_string()];
    }
    let (minute, hour, day_of_month, month) = (fields[0], fields[1], fields[2], fields[3]);
    let day_of_week = translate_day_of_week(fields[4]);
    let build = |dom: &str, dow: &str| format!("0 {} {} {} {} {} *", minute, hour, dom, month, dow);

    if is_restricted(day_of_month) && is_restricted(fields[4]) {
        vec![build(day_of_month, "*"), build("*", &day_of_week)]
    } else {
        vec![build(day_of_month, &day_of_week)]
    }
}

fn is_restricted(field: &str) -> bool {
    !(field.starts_with('*') || field == "?")
}

fn translate_day_of_week(field: &str) -> String {
    field
        .split(',')
        .map(translate_day_of_week_part)
        .collect::<Vec<_>>()
        .join(",")
}

fn translate_day_of_week_part(part: &str) -> String {
    let (base, step) = match part.split_once('/') {
        Some((base, step)) => (base, Some(step)),
        None => (part, None),
    };
    if base == "*" || base.chars().any(|c| c.is_ascii_alphabetic()) {
        return part.to_string();
    }

    let step: usize = match step {
        None => 1,
        Some(step) => match step.parse() {
            Ok(step) if step > 0 => step,
            _ => return part.to_string(),
        },
    };
    let bounds = match base.split_once('-') {
        Some((lo, hi)) => (lo.parse::<u8>(), hi.parse::<u8>()),
        None if step > 1 => (base.parse::<u8>(), Ok(6)),
        None => (base.parse::<u8>(), base.parse::<u8>()),
    };
    let (Ok(lo), Ok(hi)) = bounds else {
        return part.to_string();
    };
    if lo > 7 || hi > 7 || lo > hi {
        return part.to_string();
    }

    let mut days: Vec<u8> = (lo..=hi).step_by(step).map(|d| d % 7 + 1).collect();
    days.sort_unstable();
    days.dedup();
    days.iter()
        .map(u8::to_string)
        .collect::<Vec<_>>()
        .join(",")
}
