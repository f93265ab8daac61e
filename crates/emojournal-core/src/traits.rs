//! Collaborator traits the scheduling engine depends on.
//!
//! The engine never talks to SQLite or Telegram directly; it goes through
//! these seams so that persistence and transport can be swapped or faked.

use async_trait::async_trait;
use chrono::{NaiveDate, NaiveTime};

use crate::error::{DeliveryError, Result};
use crate::types::{Entry, SummaryDeliveryRecord, SummaryKind, User, UserSettings};

/// Persistence operations consumed by the scheduler.
///
/// Every method is a single independent read or write. Implementations must
/// not hold locks across `.await` points.
#[async_trait]
pub trait UserStore: Send + Sync {
    /// All users with `paused = false`.
    async fn get_active_users(&self) -> Result<Vec<User>>;

    async fn get_user(&self, user_id: i64) -> Result<Option<User>>;

    async fn get_user_settings(&self, user_id: i64) -> Result<Option<UserSettings>>;

    /// Overwrites any existing schedule for `(user_id, date)`.
    async fn save_user_schedule(
        &self,
        user_id: i64,
        date: NaiveDate,
        slots: &[NaiveTime],
    ) -> Result<()>;

    async fn get_user_schedule(
        &self,
        user_id: i64,
        date: NaiveDate,
    ) -> Result<Option<Vec<NaiveTime>>>;

    /// Entries from the trailing `days` days, measured in the user's timezone.
    async fn get_user_entries(&self, user_id: i64, days: u32) -> Result<Vec<Entry>>;

    async fn update_user_paused(&self, user_id: i64, paused: bool) -> Result<()>;

    async fn get_summary_delivery(
        &self,
        user_id: i64,
        local_date: NaiveDate,
        kind: SummaryKind,
    ) -> Result<Option<SummaryDeliveryRecord>>;

    async fn record_summary_delivery(&self, record: &SummaryDeliveryRecord) -> Result<()>;

    /// Delete schedules dated strictly before `before`. Returns rows removed.
    async fn cleanup_old_schedules(&self, before: NaiveDate) -> Result<usize>;

    /// Delete delivery records dated strictly before `before`. Returns rows removed.
    async fn prune_summary_deliveries(&self, before: NaiveDate) -> Result<usize>;
}

/// Outbound transport. Rendering of text and buttons belongs here.
#[async_trait]
pub trait Notifier: Send + Sync {
    /// Render and send the check-in prompt.
    async fn send_ping(&self, user_id: i64, chat_id: i64) -> std::result::Result<(), DeliveryError>;

    /// Send a pre-generated weekly rollup.
    async fn send_summary(
        &self,
        user_id: i64,
        chat_id: i64,
        text: &str,
    ) -> std::result::Result<(), DeliveryError>;
}

/// Produces the weekly rollup text for a user.
#[async_trait]
pub trait SummaryGenerator: Send + Sync {
    async fn generate(&self, user_id: i64, days: u32) -> Result<String>;
}
