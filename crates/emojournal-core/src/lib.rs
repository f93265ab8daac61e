//! # EmoJournal Core
//!
//! Shared foundation for the EmoJournal check-in bot: domain types,
//! the error taxonomy, configuration, and the traits that the scheduling
//! engine uses to talk to persistence, delivery and summary generation.

pub mod config;
pub mod error;
pub mod traits;
pub mod types;

pub use config::EmoJournalConfig;
pub use error::{DeliveryError, EmoJournalError, Result};
pub use types::{DailySchedule, Entry, SummaryDeliveryRecord, SummaryKind, User, UserSettings};
