//! Shared test doubles.

use async_trait::async_trait;
use std::collections::VecDeque;
use std::sync::Mutex;

use emojournal_core::error::{DeliveryError, EmoJournalError, Result};
use emojournal_core::traits::{Notifier, SummaryGenerator};

/// Records every send; results can be scripted ahead of time.
#[derive(Default)]
pub struct RecordingNotifier {
    pings: Mutex<Vec<i64>>,
    summaries: Mutex<Vec<(i64, String)>>,
    scripted: Mutex<VecDeque<DeliveryError>>,
    always: Mutex<Option<DeliveryError>>,
}

impl RecordingNotifier {
    pub fn new() -> Self {
        Self::default()
    }

    /// Fail the next send (ping or summary) with `error`.
    pub fn fail_next(&self, error: DeliveryError) {
        self.scripted.lock().unwrap().push_back(error);
    }

    /// Fail every send with `error` until cleared with `None`.
    pub fn fail_always(&self, error: Option<DeliveryError>) {
        *self.always.lock().unwrap() = error;
    }

    pub fn pings(&self) -> Vec<i64> {
        self.pings.lock().unwrap().clone()
    }

    pub fn summaries(&self) -> Vec<(i64, String)> {
        self.summaries.lock().unwrap().clone()
    }

    fn outcome(&self) -> std::result::Result<(), DeliveryError> {
        if let Some(e) = self.scripted.lock().unwrap().pop_front() {
            return Err(e);
        }
        match self.always.lock().unwrap().clone() {
            Some(e) => Err(e),
            None => Ok(()),
        }
    }
}

#[async_trait]
impl Notifier for RecordingNotifier {
    async fn send_ping(&self, user_id: i64, _chat_id: i64) -> std::result::Result<(), DeliveryError> {
        self.outcome()?;
        self.pings.lock().unwrap().push(user_id);
        Ok(())
    }

    async fn send_summary(&self, user_id: i64, _chat_id: i64, text: &str) -> std::result::Result<(), DeliveryError> {
        self.outcome()?;
        self.summaries.lock().unwrap().push((user_id, text.to_string()));
        Ok(())
    }
}

/// Summary generator returning a canned text, or failing on demand.
pub struct CannedSummary {
    pub fail: bool,
}

#[async_trait]
impl SummaryGenerator for CannedSummary {
    async fn generate(&self, user_id: i64, days: u32) -> Result<String> {
        if self.fail {
            return Err(EmoJournalError::Scheduler("generator offline".into()));
        }
        Ok(format!("summary for {user_id} over {days} days"))
    }
}
