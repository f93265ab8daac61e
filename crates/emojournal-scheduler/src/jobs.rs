//! Job definitions: the data model for pending scheduled work.

use chrono::{DateTime, NaiveDate, NaiveTime, Utc};
use serde::Serialize;
use std::future::Future;
use std::pin::Pin;
use std::sync::Arc;
use std::time::Duration;

use crate::cron::CronSpec;
use emojournal_core::error::Result;

pub const HOURLY_SWEEP_ID: &str = "weekly_summary_sweep";
pub const MAINTENANCE_ID: &str = "maintenance_cleanup";
const RETRY_SUFFIX: &str = "_retry";

pub type JobFuture = Pin<Box<dyn Future<Output = Result<()>> + Send>>;

/// Invoked once per firing; returns the unit of work to run.
pub type JobCallback = Arc<dyn Fn() -> JobFuture + Send + Sync>;

/// Wrap an async closure as a [`JobCallback`].
pub fn job_callback<F, Fut>(f: F) -> JobCallback
where
    F: Fn() -> Fut + Send + Sync + 'static,
    Fut: Future<Output = Result<()>> + Send + 'static,
{
    Arc::new(move || -> JobFuture { Box::pin(f()) })
}

/// What a job is for. Drives logging and diagnostics only.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum JobKind {
    Ping,
    Snooze,
    DailyRegen,
    HourlySweep,
    Maintenance,
}

impl std::fmt::Display for JobKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            JobKind::Ping => write!(f, "ping"),
            JobKind::Snooze => write!(f, "snooze"),
            JobKind::DailyRegen => write!(f, "daily_regen"),
            JobKind::HourlySweep => write!(f, "hourly_sweep"),
            JobKind::Maintenance => write!(f, "maintenance"),
        }
    }
}

/// When a job fires.
#[derive(Debug, Clone)]
pub enum Trigger {
    /// Run once at a specific instant.
    Once { at: DateTime<Utc> },
    /// Run on a cron schedule.
    Cron(CronSpec),
}

/// A unit of future work registered with the scheduler.
#[derive(Clone)]
pub struct Job {
    /// Unique identity. Re-adding an id replaces the prior job.
    pub id: String,
    pub kind: JobKind,
    pub trigger: Trigger,
    pub callback: JobCallback,
    /// One bounded retry after this delay when a firing fails.
    pub retry_after: Option<Duration>,
}

impl Job {
    /// Create a one-time job.
    pub fn once(id: impl Into<String>, kind: JobKind, at: DateTime<Utc>, callback: JobCallback) -> Self {
        Self {
            id: id.into(),
            kind,
            trigger: Trigger::Once { at },
            callback,
            retry_after: None,
        }
    }

    /// Create a cron-scheduled job.
    pub fn recurring(id: impl Into<String>, kind: JobKind, spec: CronSpec, callback: JobCallback) -> Self {
        Self {
            id: id.into(),
            kind,
            trigger: Trigger::Cron(spec),
            callback,
            retry_after: None,
        }
    }

    pub fn with_retry(mut self, delay: Duration) -> Self {
        self.retry_after = Some(delay);
        self
    }

    /// First run instant at or after `now`.
    pub fn first_run(&self, now: DateTime<Utc>) -> Option<DateTime<Utc>> {
        match &self.trigger {
            Trigger::Once { at } => Some(*at),
            Trigger::Cron(spec) => spec.next_after(now),
        }
    }

    pub fn is_recurring(&self) -> bool {
        matches!(self.trigger, Trigger::Cron(_))
    }
}

impl std::fmt::Debug for Job {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Job")
            .field("id", &self.id)
            .field("kind", &self.kind)
            .field("trigger", &self.trigger)
            .field("retry_after", &self.retry_after)
            .finish()
    }
}

/// Snapshot of a pending job, for diagnostics.
#[derive(Debug, Clone, Serialize)]
pub struct JobInfo {
    pub id: String,
    pub kind: JobKind,
    pub next_run: DateTime<Utc>,
    pub recurring: bool,
}

// ─── Job identities ───────────────────────────────────────

/// Keyed by `HHMM`, so two slots in the same hour keep distinct ids.
pub fn ping_id(user_id: i64, date: NaiveDate, slot: NaiveTime) -> String {
    format!("ping_{}_{}_{}", user_id, date.format("%Y%m%d"), slot.format("%H%M"))
}

/// Prefix shared by every ping (and ping retry) of a user on a date.
pub fn ping_day_prefix(user_id: i64, date: NaiveDate) -> String {
    format!("ping_{}_{}_", user_id, date.format("%Y%m%d"))
}

pub fn snooze_id(user_id: i64, at: DateTime<Utc>) -> String {
    format!("snooze_{}_{}", user_id, at.timestamp_millis())
}

pub fn daily_regen_id(user_id: i64) -> String {
    format!("daily_schedule_{user_id}")
}

pub fn retry_id(id: &str) -> String {
    format!("{id}{RETRY_SUFFIX}")
}

/// Whether a job id belongs to `user_id`.
pub fn belongs_to_user(id: &str, user_id: i64) -> bool {
    let ping = format!("ping_{user_id}_");
    let snooze = format!("snooze_{user_id}_");
    let regen = daily_regen_id(user_id);
    id.starts_with(&ping)
        || id.starts_with(&snooze)
        || id == regen
        || id.strip_suffix(RETRY_SUFFIX) == Some(regen.as_str())
}
