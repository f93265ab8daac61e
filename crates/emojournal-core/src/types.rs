//! Domain records used by the scheduling engine.

use chrono::{DateTime, NaiveDate, NaiveDateTime, NaiveTime, Utc};
use serde::{Deserialize, Serialize};

/// A registered bot user.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct User {
    /// Stable user identifier (Telegram user id).
    pub id: i64,
    /// Delivery channel identifier (Telegram chat id).
    pub chat_id: i64,
    /// IANA timezone name. Resolved with a fallback, never trusted blindly.
    pub timezone: String,
    /// Paused users receive no pings and no weekly summaries.
    pub paused: bool,
    pub created_at: DateTime<Utc>,
}

/// Per-user preferences for the weekly rollup.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct UserSettings {
    pub weekly_summary_enabled: bool,
    /// Local delivery hour, 0-23.
    pub summary_time_hour: u32,
}

/// A journal entry. Only the fields the scheduler reads are modelled here.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Entry {
    pub id: i64,
    pub user_id: i64,
    /// Wall-clock timestamp in the user's timezone at the time of writing.
    pub ts_local: NaiveDateTime,
    pub emotions: Vec<String>,
    pub cause: Option<String>,
    pub note: Option<String>,
}

/// The slots chosen for one user on one local calendar date.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DailySchedule {
    pub user_id: i64,
    pub date_local: NaiveDate,
    /// Sorted ascending, no duplicates.
    pub slots: Vec<NaiveTime>,
}

/// Which periodic artifact a delivery record deduplicates.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum SummaryKind {
    WeeklyAuto,
}

impl SummaryKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            SummaryKind::WeeklyAuto => "weekly_auto",
        }
    }
}

impl std::fmt::Display for SummaryKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Dedup marker: one weekly summary attempt per user per local date.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SummaryDeliveryRecord {
    pub user_id: i64,
    pub local_date: NaiveDate,
    pub kind: SummaryKind,
    pub success: bool,
    pub recorded_at: DateTime<Utc>,
}
