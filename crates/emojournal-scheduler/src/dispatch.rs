//! Notification dispatch: re-validates the recipient, sends through the
//! configured `Notifier`, and applies the failure policy:
//!
//! - permanent failure (blocked / chat gone) → user paused, warn, no retry
//! - transient failure → error, returned as `Err` so the job retries once
//! - success → info

use chrono::Utc;
use std::sync::Arc;

use crate::clock::Clock;
use crate::notify::{DeliveryAttempt, DeliveryLog, DeliveryOutcome, MessageKind};
use emojournal_core::error::{DeliveryError, Result};
use emojournal_core::traits::{Notifier, UserStore};
use emojournal_core::types::User;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DispatchOutcome {
    Sent,
    /// User missing or paused. Expected under pause/delete races.
    Skipped,
    /// Permanent failure; the user is now paused.
    Disabled,
}

pub struct Dispatcher {
    store: Arc<dyn UserStore>,
    notifier: Arc<dyn Notifier>,
    log: Arc<DeliveryLog>,
    clock: Arc<dyn Clock>,
}

impl Dispatcher {
    pub fn new(
        store: Arc<dyn UserStore>,
        notifier: Arc<dyn Notifier>,
        log: Arc<DeliveryLog>,
        clock: Arc<dyn Clock>,
    ) -> Self {
        Self {
            store,
            notifier,
            log,
            clock,
        }
    }

    pub fn log(&self) -> &Arc<DeliveryLog> {
        &self.log
    }

    /// Deliver the check-in prompt if the user is still eligible.
    pub async fn send_ping(&self, user_id: i64) -> Result<DispatchOutcome> {
        let Some(user) = self.store.get_user(user_id).await? else {
            tracing::info!("👻 Ping for user {} skipped: user no longer exists", user_id);
            return Ok(DispatchOutcome::Skipped);
        };
        if user.paused {
            tracing::info!("⏸️ Ping for user {} skipped: paused", user_id);
            return Ok(DispatchOutcome::Skipped);
        }

        let result = self.notifier.send_ping(user.id, user.chat_id).await;
        self.settle(&user, MessageKind::Ping, result).await
    }

    /// Deliver a rendered summary. Eligibility is the caller's concern.
    pub async fn send_summary(&self, user: &User, text: &str, kind: MessageKind) -> Result<DispatchOutcome> {
        let result = self.notifier.send_summary(user.id, user.chat_id, text).await;
        self.settle(user, kind, result).await
    }

    async fn settle(
        &self,
        user: &User,
        kind: MessageKind,
        result: std::result::Result<(), DeliveryError>,
    ) -> Result<DispatchOutcome> {
        let outcome = match &result {
            Ok(()) => DeliveryOutcome::Sent,
            Err(e) => DeliveryOutcome::from(e),
        };
        self.log.record(DeliveryAttempt {
            user_id: user.id,
            kind,
            outcome,
            timestamp: self.now(),
        });

        match result {
            Ok(()) => {
                tracing::info!("✅ {:?} delivered to user {}", kind, user.id);
                Ok(DispatchOutcome::Sent)
            }
            Err(e) if e.is_permanent() => {
                tracing::warn!("🚫 {:?} to user {} permanently failed ({}), pausing user", kind, user.id, e);
                self.store.update_user_paused(user.id, true).await?;
                Ok(DispatchOutcome::Disabled)
            }
            Err(e) => {
                tracing::error!("❌ {:?} to user {} failed: {}", kind, user.id, e);
                Err(e.into())
            }
        }
    }

    fn now(&self) -> chrono::DateTime<Utc> {
        self.clock.now()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::clock::SystemClock;
    use crate::memory::MemoryStore;
    use crate::testing::RecordingNotifier;
    use emojournal_core::error::EmoJournalError;

    fn setup() -> (Dispatcher, Arc<MemoryStore>, Arc<RecordingNotifier>) {
        let store = Arc::new(MemoryStore::default());
        let notifier = Arc::new(RecordingNotifier::new());
        let dispatcher = Dispatcher::new(
            store.clone(),
            notifier.clone(),
            Arc::new(DeliveryLog::new()),
            Arc::new(SystemClock),
        );
        (dispatcher, store, notifier)
    }

    #[tokio::test]
    async fn test_ping_sent() {
        let (dispatcher, store, notifier) = setup();
        store.add_user(1, "Europe/Moscow");
        assert_eq!(dispatcher.send_ping(1).await.unwrap(), DispatchOutcome::Sent);
        assert_eq!(notifier.pings(), vec![1]);
        assert_eq!(dispatcher.log().for_user(1)[0].outcome, DeliveryOutcome::Sent);
    }

    #[tokio::test]
    async fn test_missing_or_paused_user_is_a_silent_noop() {
        let (dispatcher, store, notifier) = setup();
        assert_eq!(dispatcher.send_ping(42).await.unwrap(), DispatchOutcome::Skipped);

        store.add_user(1, "UTC");
        store.update_user_paused(1, true).await.unwrap();
        assert_eq!(dispatcher.send_ping(1).await.unwrap(), DispatchOutcome::Skipped);
        assert!(notifier.pings().is_empty());
        assert!(dispatcher.log().history().is_empty());
    }

    #[tokio::test]
    async fn test_blocked_pauses_user() {
        let (dispatcher, store, notifier) = setup();
        store.add_user(1, "UTC");
        notifier.fail_next(DeliveryError::Blocked("Forbidden: bot was blocked by the user".into()));

        assert_eq!(dispatcher.send_ping(1).await.unwrap(), DispatchOutcome::Disabled);
        assert!(store.get_user(1).await.unwrap().unwrap().paused);

        // Nothing further goes out.
        assert_eq!(dispatcher.send_ping(1).await.unwrap(), DispatchOutcome::Skipped);
    }

    #[tokio::test]
    async fn test_transient_failure_is_an_error() {
        let (dispatcher, store, notifier) = setup();
        store.add_user(1, "UTC");
        notifier.fail_next(DeliveryError::Transient("502 Bad Gateway".into()));

        let err = dispatcher.send_ping(1).await.unwrap_err();
        assert!(matches!(err, EmoJournalError::Delivery(DeliveryError::Transient(_))));
        assert!(!store.get_user(1).await.unwrap().unwrap().paused);
        assert!(matches!(
            dispatcher.log().for_user(1)[0].outcome,
            DeliveryOutcome::Failed(_)
        ));
    }
}
