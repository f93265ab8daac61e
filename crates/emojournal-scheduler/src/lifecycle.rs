//! User lifecycle hooks: the entry points the command layer calls on
//! /start, /pause, /resume, timezone change, snooze and skip.
//!
//! `ScheduleService` owns the composition: it turns persisted daily schedules
//! into Ping jobs, registers the per-user DailyRegen, and wires the hourly
//! sweep and maintenance jobs. Job callbacks hold a `Weak` back-reference so
//! the job table never keeps the service alive.

use chrono::{DateTime, Duration, NaiveDate, Utc};
use chrono_tz::Tz;
use serde::Serialize;
use std::sync::{Arc, Weak};

use crate::cron::CronSpec;
use crate::dispatch::{DispatchOutcome, Dispatcher};
use crate::engine::JobScheduler;
use crate::jobs::{
    HOURLY_SWEEP_ID, Job, JobCallback, JobKind, MAINTENANCE_ID, belongs_to_user, daily_regen_id, job_callback,
    ping_day_prefix, ping_id, snooze_id,
};
use crate::notify::DeliveryLog;
use crate::slots::{self, SlotGenerator};
use crate::summary::{DueUser, WeeklySummarySweep};
use crate::timezone::{TimezoneResolver, local_to_utc};
use emojournal_core::config::{EmoJournalConfig, SchedulerConfig, SummaryConfig};
use emojournal_core::error::{EmoJournalError, Result};
use emojournal_core::traits::{Notifier, SummaryGenerator, UserStore};
use emojournal_core::types::DailySchedule;

const MAINTENANCE_CRON: &str = "30 3 * * *";

/// Outcome of a batch over all active users.
#[derive(Debug, Default, Clone, Copy, Serialize, PartialEq, Eq)]
pub struct BatchReport {
    pub processed: usize,
    pub failed: usize,
}

pub struct ScheduleService {
    scheduler: JobScheduler,
    store: Arc<dyn UserStore>,
    dispatcher: Arc<Dispatcher>,
    sweep: WeeklySummarySweep,
    slots: Arc<dyn SlotGenerator>,
    timezones: Arc<TimezoneResolver>,
    config: SchedulerConfig,
    summary: SummaryConfig,
    this: Weak<ScheduleService>,
}

impl ScheduleService {
    pub fn new(
        scheduler: JobScheduler,
        store: Arc<dyn UserStore>,
        notifier: Arc<dyn Notifier>,
        generator: Arc<dyn SummaryGenerator>,
        config: &EmoJournalConfig,
    ) -> Arc<Self> {
        let slots = slots::from_config(&config.scheduler);
        Self::with_slots(scheduler, store, notifier, generator, slots, config)
    }

    pub fn with_slots(
        scheduler: JobScheduler,
        store: Arc<dyn UserStore>,
        notifier: Arc<dyn Notifier>,
        generator: Arc<dyn SummaryGenerator>,
        slots: Arc<dyn SlotGenerator>,
        config: &EmoJournalConfig,
    ) -> Arc<Self> {
        let clock = scheduler.clock();
        let timezones = Arc::new(TimezoneResolver::from_name(&config.scheduler.default_timezone));
        let dispatcher = Arc::new(Dispatcher::new(
            store.clone(),
            notifier,
            Arc::new(DeliveryLog::new()),
            clock.clone(),
        ));
        let sweep = WeeklySummarySweep::new(
            store.clone(),
            dispatcher.clone(),
            generator,
            timezones.clone(),
            clock,
            config.summary.clone(),
        );
        Arc::new_cyclic(|this| Self {
            scheduler,
            store,
            dispatcher,
            sweep,
            slots,
            timezones,
            config: config.scheduler.clone(),
            summary: config.summary.clone(),
            this: this.clone(),
        })
    }

    pub fn scheduler(&self) -> &JobScheduler {
        &self.scheduler
    }

    pub fn delivery_log(&self) -> &Arc<DeliveryLog> {
        self.dispatcher.log()
    }

    /// Register the process-wide jobs: hourly summary sweep and daily maintenance.
    pub fn start(&self) -> Result<()> {
        let this = self.this.clone();
        self.scheduler.add_recurring(
            HOURLY_SWEEP_ID,
            JobKind::HourlySweep,
            CronSpec::hourly(),
            job_callback(move || {
                let this = this.clone();
                async move {
                    match this.upgrade() {
                        Some(service) => service.run_sweep().await,
                        None => Ok(()),
                    }
                }
            }),
        );

        let spec = CronSpec::parse(MAINTENANCE_CRON, chrono_tz::UTC)
            .ok_or_else(|| EmoJournalError::Scheduler(format!("bad maintenance cron '{MAINTENANCE_CRON}'")))?;
        let this = self.this.clone();
        self.scheduler.add_recurring(
            MAINTENANCE_ID,
            JobKind::Maintenance,
            spec,
            job_callback(move || {
                let this = this.clone();
                async move {
                    match this.upgrade() {
                        Some(service) => service.run_maintenance().await,
                        None => Ok(()),
                    }
                }
            }),
        );

        tracing::info!("⏰ Hourly summary sweep and daily maintenance registered");
        Ok(())
    }

    /// Re-derive every active user's jobs. Called at startup: pending jobs are
    /// in-memory only, persisted schedules are the source of truth.
    pub async fn recover_all(&self) -> Result<BatchReport> {
        let users = self.store.get_active_users().await?;
        let mut report = BatchReport::default();
        for user in &users {
            report.processed += 1;
            if let Err(e) = self.start_user_schedule(user.id).await {
                report.failed += 1;
                tracing::error!("❌ Failed to restore schedule for user {}: {}", user.id, e);
            }
        }
        tracing::info!(
            "🔄 Restored schedules for {} users ({} failed)",
            report.processed - report.failed,
            report.failed
        );
        Ok(report)
    }

    /// Cancel the user's jobs, then enqueue today's remaining Pings, any
    /// already-prepared Pings for tomorrow, and the DailyRegen job.
    pub async fn start_user_schedule(&self, user_id: i64) -> Result<()> {
        let Some(user) = self.store.get_user(user_id).await? else {
            return Err(EmoJournalError::NotFound(format!("user {user_id}")));
        };
        self.stop_user_schedule(user_id);
        if user.paused {
            tracing::info!("⏸️ User {} is paused, nothing scheduled", user_id);
            return Ok(());
        }

        let tz = self.timezones.resolve(&user.timezone);
        let now = self.scheduler.now();
        let today = now.with_timezone(&tz).date_naive();

        let schedule = self.ensure_schedule(user_id, today).await?;
        let mut queued = self.enqueue_pings(&schedule, tz, now);
        if let Some(tomorrow) = today.succ_opt()
            && let Some(slots) = self.store.get_user_schedule(user_id, tomorrow).await?
        {
            let prepared = DailySchedule {
                user_id,
                date_local: tomorrow,
                slots,
            };
            queued += self.enqueue_pings(&prepared, tz, now);
        }

        let next_regen = self.register_regen(user_id, tz)?;
        tracing::info!(
            "📅 Started schedule for user {} ({}): {} pings queued, regen at {}",
            user_id,
            tz,
            queued,
            next_regen
        );
        Ok(())
    }

    /// Cancel every pending job of the user. Safe to call repeatedly.
    pub fn stop_user_schedule(&self, user_id: i64) -> usize {
        let removed = self.scheduler.remove_where(|id| belongs_to_user(id, user_id));
        if removed > 0 {
            tracing::info!("🛑 Stopped schedule for user {} ({} jobs cancelled)", user_id, removed);
        }
        removed
    }

    /// One-off Ping at now + `minutes` (clamped to the configured bounds).
    /// Returns when it will fire.
    pub fn schedule_snooze(&self, user_id: i64, minutes: u32) -> DateTime<Utc> {
        let minutes = minutes.clamp(self.config.snooze_min_minutes, self.config.snooze_max_minutes);
        let mut at = self.scheduler.now() + Duration::minutes(minutes as i64);
        // Distinct snoozes requested in the same instant must not replace each other.
        while self.scheduler.contains(&snooze_id(user_id, at)) {
            at += Duration::milliseconds(1);
        }
        let job = Job::once(snooze_id(user_id, at), JobKind::Snooze, at, self.ping_callback(user_id))
            .with_retry(self.retry_delay());
        self.scheduler.schedule(job);
        tracing::info!("😴 Snoozed user {} for {} minutes (until {})", user_id, minutes, at);
        at
    }

    pub fn snooze_default_minutes(&self) -> u32 {
        self.config.snooze_default_minutes
    }

    /// Cancel today's remaining Pings. DailyRegen and snoozes stay.
    pub async fn skip_today(&self, user_id: i64) -> Result<usize> {
        let Some(user) = self.store.get_user(user_id).await? else {
            tracing::info!("👻 Skip for user {} ignored: user not found", user_id);
            return Ok(0);
        };
        let tz = self.timezones.resolve(&user.timezone);
        let today = self.scheduler.now().with_timezone(&tz).date_naive();
        let prefix = ping_day_prefix(user_id, today);
        let removed = self.scheduler.remove_where(|id| id.starts_with(&prefix));
        tracing::info!("⏭️ Skipped {} remaining pings for user {} today", removed, user_id);
        Ok(removed)
    }

    /// Send a summary immediately, bypassing every gate.
    pub async fn send_test_weekly_summary(&self, user_id: i64) -> bool {
        match self.sweep.send_test(user_id).await {
            Ok(DispatchOutcome::Sent) => true,
            Ok(DispatchOutcome::Disabled) => {
                self.stop_user_schedule(user_id);
                false
            }
            Ok(DispatchOutcome::Skipped) => false,
            Err(e) => {
                tracing::error!("❌ Test summary for user {} failed: {}", user_id, e);
                false
            }
        }
    }

    pub async fn get_users_due_for_summary(&self) -> Result<Vec<DueUser>> {
        self.sweep.users_due().await
    }

    // ─── Job bodies ───────────────────────────────────────────

    fn retry_delay(&self) -> std::time::Duration {
        std::time::Duration::from_secs(self.config.retry_delay_secs)
    }

    fn ping_callback(&self, user_id: i64) -> JobCallback {
        let this = self.this.clone();
        job_callback(move || {
            let this = this.clone();
            async move {
                match this.upgrade() {
                    Some(service) => service.fire_ping(user_id).await,
                    None => Ok(()),
                }
            }
        })
    }

    async fn fire_ping(&self, user_id: i64) -> Result<()> {
        if self.dispatcher.send_ping(user_id).await? == DispatchOutcome::Disabled {
            self.stop_user_schedule(user_id);
        }
        Ok(())
    }

    fn register_regen(&self, user_id: i64, tz: Tz) -> Result<DateTime<Utc>> {
        let spec = CronSpec::daily_at(self.config.regen_hour, self.config.regen_minute, tz).ok_or_else(|| {
            EmoJournalError::Scheduler(format!(
                "bad regen time {}:{}",
                self.config.regen_hour, self.config.regen_minute
            ))
        })?;
        let this = self.this.clone();
        let callback = job_callback(move || {
            let this = this.clone();
            async move {
                match this.upgrade() {
                    Some(service) => service.run_daily_regen(user_id).await,
                    None => Ok(()),
                }
            }
        });
        self.scheduler
            .add_recurring(daily_regen_id(user_id), JobKind::DailyRegen, spec, callback)
            .ok_or_else(|| EmoJournalError::Scheduler(format!("regen for user {user_id} never fires")))
    }

    /// Prepare tomorrow. Also repairs today if its schedule is missing.
    async fn run_daily_regen(&self, user_id: i64) -> Result<()> {
        let user = match self.store.get_user(user_id).await? {
            Some(user) if !user.paused => user,
            _ => {
                tracing::info!("👻 Daily regen for user {} dropped: user gone or paused", user_id);
                self.stop_user_schedule(user_id);
                return Ok(());
            }
        };

        let tz = self.timezones.resolve(&user.timezone);
        let now = self.scheduler.now();
        let today = now.with_timezone(&tz).date_naive();

        let mut queued = 0;
        if self.store.get_user_schedule(user_id, today).await?.is_none() {
            let schedule = self.ensure_schedule(user_id, today).await?;
            queued += self.enqueue_pings(&schedule, tz, now);
        }
        if let Some(tomorrow) = today.succ_opt() {
            let schedule = self.ensure_schedule(user_id, tomorrow).await?;
            queued += self.enqueue_pings(&schedule, tz, now);
        }
        tracing::info!("📅 Daily regen for user {}: {} pings queued", user_id, queued);
        Ok(())
    }

    async fn run_sweep(&self) -> Result<()> {
        let report = self.sweep.run().await?;
        for user_id in report.disabled {
            self.stop_user_schedule(user_id);
        }
        Ok(())
    }

    async fn run_maintenance(&self) -> Result<()> {
        let today = self.scheduler.now().date_naive();
        let schedules_before = today - Duration::days(self.config.schedule_retention_days as i64);
        let records_before = today - Duration::days(self.summary.record_retention_days as i64);
        let schedules = self.store.cleanup_old_schedules(schedules_before).await?;
        let records = self.store.prune_summary_deliveries(records_before).await?;
        tracing::info!(
            "🧹 Maintenance: removed {} old schedules, {} old delivery records",
            schedules,
            records
        );
        Ok(())
    }

    // ─── Helpers ──────────────────────────────────────────────

    /// Load the persisted schedule for `date`, generating and saving one if absent.
    async fn ensure_schedule(&self, user_id: i64, date: NaiveDate) -> Result<DailySchedule> {
        let slots = match self.store.get_user_schedule(user_id, date).await? {
            Some(slots) => slots,
            None => {
                let slots = self.slots.generate_slots(date);
                self.store.save_user_schedule(user_id, date, &slots).await?;
                tracing::debug!("🗓️ Generated schedule for user {} on {}: {:?}", user_id, date, slots);
                slots
            }
        };
        Ok(DailySchedule {
            user_id,
            date_local: date,
            slots,
        })
    }

    /// Enqueue a Ping per slot still in the future. Returns how many were queued.
    fn enqueue_pings(&self, schedule: &DailySchedule, tz: Tz, now: DateTime<Utc>) -> usize {
        let user_id = schedule.user_id;
        let mut queued = 0;
        for slot in &schedule.slots {
            let Some(at) = local_to_utc(tz, schedule.date_local, *slot) else {
                continue;
            };
            if at <= now {
                continue;
            }
            let id = ping_id(user_id, schedule.date_local, *slot);
            let job = Job::once(id, JobKind::Ping, at, self.ping_callback(user_id)).with_retry(self.retry_delay());
            if self.scheduler.schedule(job).is_some() {
                queued += 1;
            }
        }
        queued
    }
}
