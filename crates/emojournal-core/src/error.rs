//! Error types shared across EmoJournal crates.

use thiserror::Error;

/// Top-level error type.
#[derive(Debug, Error)]
pub enum EmoJournalError {
    #[error("Config error: {0}")]
    Config(String),

    #[error("Database error: {0}")]
    Database(String),

    #[error("Delivery error: {0}")]
    Delivery(#[from] DeliveryError),

    #[error("Scheduler error: {0}")]
    Scheduler(String),

    #[error("Not found: {0}")]
    NotFound(String),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

/// Outcome classification for a failed message delivery.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum DeliveryError {
    /// The user blocked the bot or deactivated their account.
    #[error("blocked by user: {0}")]
    Blocked(String),

    /// The destination chat no longer exists.
    #[error("chat not found: {0}")]
    ChatGone(String),

    /// Network hiccup, rate limit, or server-side failure.
    #[error("transient failure: {0}")]
    Transient(String),
}

impl DeliveryError {
    /// Permanent failures disable the user; transient ones may be retried.
    pub fn is_permanent(&self) -> bool {
        matches!(self, DeliveryError::Blocked(_) | DeliveryError::ChatGone(_))
    }
}

pub type Result<T> = std::result::Result<T, EmoJournalError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_permanent_classification() {
        assert!(DeliveryError::Blocked("403".into()).is_permanent());
        assert!(DeliveryError::ChatGone("400".into()).is_permanent());
        assert!(!DeliveryError::Transient("timeout".into()).is_permanent());
    }

    #[test]
    fn test_delivery_error_converts() {
        let err: EmoJournalError = DeliveryError::Transient("502".into()).into();
        assert!(err.to_string().contains("502"));
    }
}
