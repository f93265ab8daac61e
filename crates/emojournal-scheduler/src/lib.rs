//! # EmoJournal Scheduler
//!
//! Timezone-aware check-in pings and weekly summary delivery.
//!
//! ## Design
//! - One in-process job table, driven by a single tokio task
//! - Per-user daily schedules persisted in SQLite, re-derived on restart
//! - Hourly sweep decides weekly summary eligibility from local wall clock
//! - Delivery failures classified: permanent pauses the user, transient retries once
//!
//! ## Architecture
//! ```text
//! ScheduleService (lifecycle hooks)
//!   ├── start_user_schedule → ping_{user}_{date}_{hour} (once, local slot time)
//!   │                       → daily_schedule_{user}     (cron 08:55 local)
//!   ├── schedule_snooze     → snooze_{user}_{millis}    (once, now + N min)
//!   ├── weekly_summary_sweep (cron 0 * * * * UTC) → WeeklySummarySweep
//!   └── maintenance_cleanup  (cron 30 3 * * * UTC) → prune old rows
//!
//! JobScheduler fires → Dispatcher → Notifier (Telegram sendMessage)
//!                        └── DeliveryLog (last 100 attempts)
//! ```

pub mod clock;
pub mod cron;
pub mod digest;
pub mod dispatch;
pub mod engine;
pub mod jobs;
pub mod lifecycle;
pub mod memory;
pub mod notify;
pub mod persistence;
pub mod slots;
pub mod summary;
pub mod telegram;
pub mod timezone;

#[cfg(test)]
mod testing;

pub use clock::{Clock, ManualClock, SystemClock};
pub use cron::CronSpec;
pub use digest::EntryDigest;
pub use dispatch::{DispatchOutcome, Dispatcher};
pub use engine::{JobScheduler, SchedulerStats};
pub use jobs::{Job, JobInfo, JobKind};
pub use lifecycle::{BatchReport, ScheduleService};
pub use memory::MemoryStore;
pub use notify::{DeliveryAttempt, DeliveryLog, DeliveryOutcome, MessageKind};
pub use persistence::SchedulerDb;
pub use slots::{FixedSlots, RandomSlots, SlotGenerator};
pub use summary::{DueUser, SweepReport, WeeklySummarySweep};
pub use telegram::TelegramNotifier;
pub use timezone::TimezoneResolver;
