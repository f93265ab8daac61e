//! Delivery history: what was sent to whom, and how it went.
//! Lightweight: in-memory ring buffer, kept for the diagnostics endpoint.

use chrono::{DateTime, Utc};
use serde::Serialize;
use std::collections::VecDeque;
use std::sync::Mutex;

use emojournal_core::error::DeliveryError;

const HISTORY_LIMIT: usize = 100;

/// Which template went out.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum MessageKind {
    Ping,
    WeeklySummary,
    TestSummary,
}

/// How a delivery attempt ended.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "status", content = "reason", rename_all = "snake_case")]
pub enum DeliveryOutcome {
    Sent,
    /// Permanently undeliverable; the user was paused.
    Disabled(String),
    /// Failed, may be retried.
    Failed(String),
}

impl From<&DeliveryError> for DeliveryOutcome {
    fn from(e: &DeliveryError) -> Self {
        if e.is_permanent() {
            DeliveryOutcome::Disabled(e.to_string())
        } else {
            DeliveryOutcome::Failed(e.to_string())
        }
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct DeliveryAttempt {
    pub user_id: i64,
    pub kind: MessageKind,
    pub outcome: DeliveryOutcome,
    pub timestamp: DateTime<Utc>,
}

/// Last [`HISTORY_LIMIT`] delivery attempts, oldest first.
#[derive(Debug, Default)]
pub struct DeliveryLog {
    history: Mutex<VecDeque<DeliveryAttempt>>,
}

impl DeliveryLog {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn record(&self, attempt: DeliveryAttempt) {
        let mut history = self.history.lock().unwrap_or_else(|p| p.into_inner());
        history.push_back(attempt);
        // Ring buffer, keep last 100
        while history.len() > HISTORY_LIMIT {
            history.pop_front();
        }
    }

    pub fn history(&self) -> Vec<DeliveryAttempt> {
        self.history
            .lock()
            .unwrap_or_else(|p| p.into_inner())
            .iter()
            .cloned()
            .collect()
    }

    /// Attempts for one user, oldest first.
    pub fn for_user(&self, user_id: i64) -> Vec<DeliveryAttempt> {
        self.history().into_iter().filter(|a| a.user_id == user_id).collect()
    }
}
