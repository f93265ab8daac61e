//! Weekly summary sweep: evaluated hourly across all active users.
//!
//! For each user the current instant is converted into their local time and
//! checked against "Sunday, configured hour, minute < window". Zones with a
//! sub-hour offset are evaluated on their hour-aligned clock (see
//! [`hour_aligned_local`]), so a tick at the top of the UTC hour still lands
//! inside the window for `+05:30` or `+05:45` users. A dedup record
//! per (user, local date) keeps later ticks from sending again, and users with
//! no entries in the lookback window are skipped.

use chrono::{DateTime, Datelike, NaiveDateTime, Timelike, Utc, Weekday};
use serde::Serialize;
use std::sync::Arc;

use crate::clock::Clock;
use crate::dispatch::{DispatchOutcome, Dispatcher};
use crate::notify::MessageKind;
use crate::timezone::{TimezoneResolver, hour_aligned_local};
use emojournal_core::config::SummaryConfig;
use emojournal_core::error::Result;
use emojournal_core::traits::{SummaryGenerator, UserStore};
use emojournal_core::types::{SummaryDeliveryRecord, SummaryKind, User, UserSettings};

/// Result of one sweep pass.
#[derive(Debug, Default, Clone, Serialize, PartialEq, Eq)]
pub struct SweepReport {
    pub checked: usize,
    pub sent: usize,
    pub skipped: usize,
    pub failed: usize,
    /// Users paused during this pass after a permanent delivery failure.
    pub disabled: Vec<i64>,
}

/// Per-user eligibility snapshot, for diagnostics.
#[derive(Debug, Clone, Serialize)]
pub struct DueUser {
    pub user_id: i64,
    pub timezone: String,
    pub local_time: NaiveDateTime,
    pub summary_hour: u32,
    pub enabled: bool,
    pub due: bool,
    pub already_recorded: bool,
}

enum UserOutcome {
    Sent,
    Skipped,
    Disabled,
}

/// Sunday, at `hour`, within the first `window_minutes` of that hour.
pub fn is_due(local: NaiveDateTime, hour: u32, window_minutes: u32) -> bool {
    local.weekday() == Weekday::Sun && local.hour() == hour && local.minute() < window_minutes
}

pub struct WeeklySummarySweep {
    store: Arc<dyn UserStore>,
    dispatcher: Arc<Dispatcher>,
    generator: Arc<dyn SummaryGenerator>,
    timezones: Arc<TimezoneResolver>,
    clock: Arc<dyn Clock>,
    config: SummaryConfig,
}

impl WeeklySummarySweep {
    pub fn new(
        store: Arc<dyn UserStore>,
        dispatcher: Arc<Dispatcher>,
        generator: Arc<dyn SummaryGenerator>,
        timezones: Arc<TimezoneResolver>,
        clock: Arc<dyn Clock>,
        config: SummaryConfig,
    ) -> Self {
        Self {
            store,
            dispatcher,
            generator,
            timezones,
            clock,
            config,
        }
    }

    fn settings_or_default(&self, settings: Option<UserSettings>) -> UserSettings {
        settings.unwrap_or(UserSettings {
            weekly_summary_enabled: self.config.default_enabled,
            summary_time_hour: self.config.default_hour,
        })
    }

    fn local_now(&self, user: &User, now: DateTime<Utc>) -> NaiveDateTime {
        now.with_timezone(&self.timezones.resolve(&user.timezone)).naive_local()
    }

    /// The local clock the eligibility window is checked against.
    fn sweep_local(&self, user: &User, now: DateTime<Utc>) -> NaiveDateTime {
        hour_aligned_local(self.timezones.resolve(&user.timezone), now)
    }

    /// One pass over all active users. A failure for one user is logged and
    /// counted; the pass continues.
    pub async fn run(&self) -> Result<SweepReport> {
        let users = self.store.get_active_users().await?;
        let now = self.clock.now();
        let mut report = SweepReport::default();

        for user in &users {
            report.checked += 1;
            match self.process(user, now).await {
                Ok(UserOutcome::Sent) => report.sent += 1,
                Ok(UserOutcome::Skipped) => report.skipped += 1,
                Ok(UserOutcome::Disabled) => report.disabled.push(user.id),
                Err(e) => {
                    report.failed += 1;
                    tracing::error!("❌ Weekly summary for user {} failed: {}", user.id, e);
                }
            }
        }

        if report.sent > 0 || report.failed > 0 || !report.disabled.is_empty() {
            tracing::info!(
                "📬 Weekly summary sweep: {} checked, {} sent, {} failed, {} disabled",
                report.checked,
                report.sent,
                report.failed,
                report.disabled.len()
            );
        } else {
            tracing::debug!("📬 Weekly summary sweep: {} checked, nothing due", report.checked);
        }
        Ok(report)
    }

    async fn process(&self, user: &User, now: DateTime<Utc>) -> Result<UserOutcome> {
        let settings = self.settings_or_default(self.store.get_user_settings(user.id).await?);
        if !settings.weekly_summary_enabled {
            return Ok(UserOutcome::Skipped);
        }

        let local = self.sweep_local(user, now);
        if !is_due(local, settings.summary_time_hour, self.config.window_minutes) {
            return Ok(UserOutcome::Skipped);
        }

        let local_date = local.date();
        if self
            .store
            .get_summary_delivery(user.id, local_date, SummaryKind::WeeklyAuto)
            .await?
            .is_some()
        {
            tracing::debug!("📭 Weekly summary for user {} already attempted on {}", user.id, local_date);
            return Ok(UserOutcome::Skipped);
        }

        let entries = self.store.get_user_entries(user.id, self.config.lookback_days).await?;
        if entries.is_empty() {
            tracing::info!("📭 Weekly summary for user {} skipped: no entries in {} days", user.id, self.config.lookback_days);
            return Ok(UserOutcome::Skipped);
        }

        let attempt = self.generate_and_send(user, MessageKind::WeeklySummary).await;

        // Recorded on every attempt so a failing user is not retried each tick.
        let record = SummaryDeliveryRecord {
            user_id: user.id,
            local_date,
            kind: SummaryKind::WeeklyAuto,
            success: matches!(attempt, Ok(DispatchOutcome::Sent)),
            recorded_at: self.clock.now(),
        };
        self.store.record_summary_delivery(&record).await?;

        match attempt? {
            DispatchOutcome::Sent => Ok(UserOutcome::Sent),
            DispatchOutcome::Disabled => Ok(UserOutcome::Disabled),
            DispatchOutcome::Skipped => Ok(UserOutcome::Skipped),
        }
    }

    async fn generate_and_send(&self, user: &User, kind: MessageKind) -> Result<DispatchOutcome> {
        let text = self.generator.generate(user.id, self.config.lookback_days).await?;
        self.dispatcher.send_summary(user, &text, kind).await
    }

    /// Eligibility snapshot for every active user at the current instant.
    pub async fn users_due(&self) -> Result<Vec<DueUser>> {
        let now = self.clock.now();
        let mut due = Vec::new();
        for user in self.store.get_active_users().await? {
            let settings = self.settings_or_default(self.store.get_user_settings(user.id).await?);
            let local = self.local_now(&user, now);
            let aligned = self.sweep_local(&user, now);
            let already_recorded = self
                .store
                .get_summary_delivery(user.id, aligned.date(), SummaryKind::WeeklyAuto)
                .await?
                .is_some();
            due.push(DueUser {
                user_id: user.id,
                timezone: self.timezones.resolve(&user.timezone).name().to_string(),
                local_time: local,
                summary_hour: settings.summary_time_hour,
                enabled: settings.weekly_summary_enabled,
                due: settings.weekly_summary_enabled
                    && is_due(aligned, settings.summary_time_hour, self.config.window_minutes),
                already_recorded,
            });
        }
        Ok(due)
    }

    /// Send a summary now, bypassing every gate. Writes no dedup record.
    pub async fn send_test(&self, user_id: i64) -> Result<DispatchOutcome> {
        let Some(user) = self.store.get_user(user_id).await? else {
            tracing::info!("👻 Test summary skipped: user {} not found", user_id);
            return Ok(DispatchOutcome::Skipped);
        };
        self.generate_and_send(&user, MessageKind::TestSummary).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::clock::ManualClock;
    use crate::memory::MemoryStore;
    use crate::notify::DeliveryLog;
    use crate::testing::{CannedSummary, RecordingNotifier};
    use chrono::{NaiveDate, TimeZone};
    use emojournal_core::error::DeliveryError;

    struct Fixture {
        sweep: WeeklySummarySweep,
        store: Arc<MemoryStore>,
        notifier: Arc<RecordingNotifier>,
        clock: Arc<ManualClock>,
    }

    /// Sunday 2026-10-18 at the given Moscow (UTC+3) local time.
    fn sunday_moscow(h: u32, m: u32) -> DateTime<Utc> {
        Utc.with_ymd_and_hms(2026, 10, 18, h - 3, m, 0).unwrap()
    }

    fn fixture_with(generator_fails: bool) -> Fixture {
        let clock = Arc::new(ManualClock::new(sunday_moscow(21, 0)));
        let store = Arc::new(MemoryStore::new(clock.clone()));
        let notifier = Arc::new(RecordingNotifier::new());
        let dispatcher = Arc::new(Dispatcher::new(
            store.clone(),
            notifier.clone(),
            Arc::new(DeliveryLog::new()),
            clock.clone(),
        ));
        let sweep = WeeklySummarySweep::new(
            store.clone(),
            dispatcher,
            Arc::new(CannedSummary { fail: generator_fails }),
            Arc::new(TimezoneResolver::default()),
            clock.clone(),
            SummaryConfig::default(),
        );
        Fixture {
            sweep,
            store,
            notifier,
            clock,
        }
    }

    fn fixture() -> Fixture {
        fixture_with(false)
    }

    fn local(d: u32, h: u32, m: u32) -> NaiveDateTime {
        NaiveDate::from_ymd_opt(2026, 10, d).unwrap().and_hms_opt(h, m, 0).unwrap()
    }

    #[test]
    fn test_is_due_window() {
        assert!(is_due(local(18, 21, 0), 21, 30));
        assert!(is_due(local(18, 21, 7), 21, 30));
        assert!(is_due(local(18, 21, 29), 21, 30));
        assert!(!is_due(local(18, 21, 30), 21, 30));
        assert!(!is_due(local(18, 21, 47), 21, 30));
        assert!(!is_due(local(18, 22, 0), 21, 30));
        // Saturday
        assert!(!is_due(local(17, 21, 7), 21, 30));
    }

    #[tokio::test]
    async fn test_sends_once_per_sunday() {
        let f = fixture();
        f.store.add_user(1, "Europe/Moscow");
        f.store.add_entry(1, &["радость"], 120);

        let report = f.sweep.run().await.unwrap();
        assert_eq!(report.sent, 1);
        assert_eq!(f.notifier.summaries().len(), 1);

        // Same window again: dedup record blocks it.
        f.clock.set(sunday_moscow(21, 10));
        assert_eq!(f.sweep.run().await.unwrap().sent, 0);

        // Next hourly tick is outside the window.
        f.clock.set(sunday_moscow(22, 0));
        assert_eq!(f.sweep.run().await.unwrap().sent, 0);
        assert_eq!(f.notifier.summaries().len(), 1);
    }

    #[tokio::test]
    async fn test_half_hour_zones_get_one_summary() {
        let f = fixture();
        let start = Utc.with_ymd_and_hms(2026, 10, 17, 12, 0, 0).unwrap();
        f.clock.set(start);
        for (id, tz) in [(1, "Europe/Moscow"), (2, "Asia/Kolkata"), (3, "Asia/Kathmandu"), (4, "America/St_Johns")] {
            f.store.add_user(id, tz);
            f.store.add_entry(id, &["радость"], 30);
        }

        // Hourly ticks from Saturday noon UTC through Monday noon UTC.
        for h in 1..=48 {
            f.clock.set(start + chrono::Duration::hours(h));
            f.sweep.run().await.unwrap();
        }

        let mut per_user = std::collections::BTreeMap::new();
        for (user_id, _) in f.notifier.summaries() {
            *per_user.entry(user_id).or_insert(0) += 1;
        }
        assert_eq!(per_user, std::collections::BTreeMap::from([(1, 1), (2, 1), (3, 1), (4, 1)]));
    }

    #[tokio::test]
    async fn test_no_entries_skips_without_record() {
        let f = fixture();
        f.store.add_user(1, "Europe/Moscow");
        let report = f.sweep.run().await.unwrap();
        assert_eq!(report.sent, 0);
        assert_eq!(report.skipped, 1);
        assert!(f.notifier.summaries().is_empty());
        assert_eq!(f.store.delivery_count(), 0);
    }

    #[tokio::test]
    async fn test_respects_settings_and_timezone() {
        let f = fixture();
        // 21:00 Moscow is 03:00 Monday in Tokyo.
        f.store.add_user(1, "Asia/Tokyo");
        f.store.add_entry(1, &["calm"], 60);
        // Disabled.
        f.store.add_user(2, "Europe/Moscow");
        f.store.add_entry(2, &["calm"], 60);
        f.store.set_settings(
            2,
            UserSettings {
                weekly_summary_enabled: false,
                summary_time_hour: 21,
            },
        );
        // Custom hour matching 21:00 Moscow in Berlin (UTC+2 on this date).
        f.store.add_user(3, "Europe/Berlin");
        f.store.add_entry(3, &["calm"], 60);
        f.store.set_settings(
            3,
            UserSettings {
                weekly_summary_enabled: true,
                summary_time_hour: 20,
            },
        );

        let report = f.sweep.run().await.unwrap();
        assert_eq!(report.checked, 3);
        assert_eq!(report.sent, 1);
        assert_eq!(f.notifier.summaries()[0].0, 3);
    }

    #[tokio::test]
    async fn test_invalid_timezone_uses_fallback() {
        let f = fixture();
        f.store.add_user(1, "Mars/Olympus");
        f.store.add_entry(1, &["calm"], 60);
        assert_eq!(f.sweep.run().await.unwrap().sent, 1);
    }

    #[tokio::test]
    async fn test_failed_generation_still_recorded() {
        let f = fixture_with(true);
        f.store.add_user(1, "Europe/Moscow");
        f.store.add_entry(1, &["calm"], 60);

        let report = f.sweep.run().await.unwrap();
        assert_eq!(report.failed, 1);
        let record = f
            .store
            .get_summary_delivery(1, NaiveDate::from_ymd_opt(2026, 10, 18).unwrap(), SummaryKind::WeeklyAuto)
            .await
            .unwrap()
            .unwrap();
        assert!(!record.success);

        // Not retried on a later tick in the window.
        f.clock.set(sunday_moscow(21, 20));
        let report = f.sweep.run().await.unwrap();
        assert_eq!(report.failed, 0);
        assert_eq!(report.skipped, 1);
    }

    #[tokio::test]
    async fn test_one_user_failure_does_not_stop_the_pass() {
        let f = fixture();
        f.store.add_user(1, "Europe/Moscow");
        f.store.break_user(1);
        f.store.add_user(2, "Europe/Moscow");
        f.store.add_entry(2, &["calm"], 60);

        let report = f.sweep.run().await.unwrap();
        assert_eq!(report.failed, 1);
        assert_eq!(report.sent, 1);
        assert_eq!(f.notifier.summaries()[0].0, 2);
    }

    #[tokio::test]
    async fn test_blocked_user_reported_disabled() {
        let f = fixture();
        f.store.add_user(1, "Europe/Moscow");
        f.store.add_entry(1, &["calm"], 60);
        f.notifier.fail_next(DeliveryError::Blocked("Forbidden: bot was blocked by the user".into()));

        let report = f.sweep.run().await.unwrap();
        assert_eq!(report.disabled, vec![1]);
        assert!(f.store.get_user(1).await.unwrap().unwrap().paused);
    }

    #[tokio::test]
    async fn test_users_due_and_send_test() {
        let f = fixture();
        f.store.add_user(1, "Europe/Moscow");
        f.store.add_user(2, "Asia/Tokyo");

        let due = f.sweep.users_due().await.unwrap();
        assert_eq!(due.len(), 2);
        assert!(due[0].due);
        assert!(!due[1].due);
        assert_eq!(due[0].local_time, local(18, 21, 0));

        // No entries, not due: the test send goes out anyway and leaves no record.
        assert_eq!(f.sweep.send_test(2).await.unwrap(), DispatchOutcome::Sent);
        assert_eq!(f.store.delivery_count(), 0);
        assert_eq!(f.sweep.send_test(99).await.unwrap(), DispatchOutcome::Skipped);
    }
}
