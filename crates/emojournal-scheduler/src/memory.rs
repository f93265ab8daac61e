//! In-memory `UserStore`. Backs tests and dry runs; nothing survives a restart.

use async_trait::async_trait;
use chrono::{Duration, NaiveDate, NaiveTime};
use std::collections::{BTreeMap, HashMap};
use std::sync::{Arc, Mutex, MutexGuard};

use crate::clock::{Clock, SystemClock};
use crate::timezone::TimezoneResolver;
use emojournal_core::error::Result;
use emojournal_core::traits::UserStore;
use emojournal_core::types::{Entry, SummaryDeliveryRecord, SummaryKind, User, UserSettings};

#[derive(Default)]
struct State {
    users: BTreeMap<i64, User>,
    settings: HashMap<i64, UserSettings>,
    schedules: HashMap<(i64, NaiveDate), Vec<NaiveTime>>,
    entries: Vec<Entry>,
    deliveries: HashMap<(i64, NaiveDate, SummaryKind), SummaryDeliveryRecord>,
    /// Users whose reads fail, to exercise error paths.
    #[cfg(test)]
    broken: std::collections::HashSet<i64>,
}

pub struct MemoryStore {
    state: Mutex<State>,
    clock: Arc<dyn Clock>,
    timezones: TimezoneResolver,
}

impl MemoryStore {
    pub fn new(clock: Arc<dyn Clock>) -> Self {
        Self {
            state: Mutex::new(State::default()),
            clock,
            timezones: TimezoneResolver::default(),
        }
    }

    fn state(&self) -> MutexGuard<'_, State> {
        self.state.lock().unwrap_or_else(|p| p.into_inner())
    }

    pub fn insert_user(&self, user: User) {
        self.state().users.insert(user.id, user);
    }

    /// Active user with the given zone, created "now".
    pub fn add_user(&self, user_id: i64, timezone: &str) -> User {
        let user = User {
            id: user_id,
            chat_id: user_id * 10,
            timezone: timezone.to_string(),
            paused: false,
            created_at: self.clock.now(),
        };
        self.insert_user(user.clone());
        user
    }

    pub fn remove_user(&self, user_id: i64) {
        self.state().users.remove(&user_id);
    }

    pub fn set_settings(&self, user_id: i64, settings: UserSettings) {
        self.state().settings.insert(user_id, settings);
    }

    /// Append an entry stamped `minutes_ago` before now in the user's zone.
    pub fn add_entry(&self, user_id: i64, emotions: &[&str], minutes_ago: i64) {
        let tz = {
            let state = self.state();
            let name = state.users.get(&user_id).map(|u| u.timezone.clone()).unwrap_or_default();
            drop(state);
            self.timezones.resolve(&name)
        };
        let ts_local = (self.clock.now() - Duration::minutes(minutes_ago))
            .with_timezone(&tz)
            .naive_local();
        let mut state = self.state();
        let id = state.entries.len() as i64 + 1;
        state.entries.push(Entry {
            id,
            user_id,
            ts_local,
            emotions: emotions.iter().map(|e| e.to_string()).collect(),
            cause: None,
            note: None,
        });
    }

    /// Make every read for `user_id` fail with a database error.
    #[cfg(test)]
    pub(crate) fn break_user(&self, user_id: i64) {
        self.state().broken.insert(user_id);
    }

    pub fn delivery_count(&self) -> usize {
        self.state().deliveries.len()
    }

    #[cfg(test)]
    fn check(&self, user_id: i64) -> Result<()> {
        if self.state().broken.contains(&user_id) {
            return Err(emojournal_core::error::EmoJournalError::Database(format!(
                "simulated failure for user {user_id}"
            )));
        }
        Ok(())
    }

    #[cfg(not(test))]
    fn check(&self, _user_id: i64) -> Result<()> {
        Ok(())
    }
}

#[async_trait]
impl UserStore for MemoryStore {
    async fn get_active_users(&self) -> Result<Vec<User>> {
        Ok(self.state().users.values().filter(|u| !u.paused).cloned().collect())
    }

    async fn get_user(&self, user_id: i64) -> Result<Option<User>> {
        self.check(user_id)?;
        Ok(self.state().users.get(&user_id).cloned())
    }

    async fn get_user_settings(&self, user_id: i64) -> Result<Option<UserSettings>> {
        self.check(user_id)?;
        Ok(self.state().settings.get(&user_id).copied())
    }

    async fn save_user_schedule(&self, user_id: i64, date: NaiveDate, slots: &[NaiveTime]) -> Result<()> {
        self.check(user_id)?;
        self.state().schedules.insert((user_id, date), slots.to_vec());
        Ok(())
    }

    async fn get_user_schedule(&self, user_id: i64, date: NaiveDate) -> Result<Option<Vec<NaiveTime>>> {
        self.check(user_id)?;
        Ok(self.state().schedules.get(&(user_id, date)).cloned())
    }

    async fn get_user_entries(&self, user_id: i64, days: u32) -> Result<Vec<Entry>> {
        self.check(user_id)?;
        let Some(user) = self.state().users.get(&user_id).cloned() else {
            return Ok(Vec::new());
        };
        let tz = self.timezones.resolve(&user.timezone);
        let cutoff = (self.clock.now().with_timezone(&tz) - Duration::days(days as i64)).naive_local();
        let mut entries: Vec<Entry> = self
            .state()
            .entries
            .iter()
            .filter(|e| e.user_id == user_id && e.ts_local >= cutoff)
            .cloned()
            .collect();
        entries.sort_by(|a, b| b.ts_local.cmp(&a.ts_local));
        Ok(entries)
    }

    async fn update_user_paused(&self, user_id: i64, paused: bool) -> Result<()> {
        if let Some(user) = self.state().users.get_mut(&user_id) {
            user.paused = paused;
        }
        Ok(())
    }

    async fn get_summary_delivery(
        &self,
        user_id: i64,
        local_date: NaiveDate,
        kind: SummaryKind,
    ) -> Result<Option<SummaryDeliveryRecord>> {
        self.check(user_id)?;
        Ok(self.state().deliveries.get(&(user_id, local_date, kind)).cloned())
    }

    async fn record_summary_delivery(&self, record: &SummaryDeliveryRecord) -> Result<()> {
        let mut state = self.state();
        let key = (record.user_id, record.local_date, record.kind);
        let success = record.success || state.deliveries.get(&key).is_some_and(|r| r.success);
        state.deliveries.insert(
            key,
            SummaryDeliveryRecord {
                success,
                ..record.clone()
            },
        );
        Ok(())
    }

    async fn cleanup_old_schedules(&self, before: NaiveDate) -> Result<usize> {
        let mut state = self.state();
        let n = state.schedules.len();
        state.schedules.retain(|(_, date), _| *date >= before);
        Ok(n - state.schedules.len())
    }

    async fn prune_summary_deliveries(&self, before: NaiveDate) -> Result<usize> {
        let mut state = self.state();
        let n = state.deliveries.len();
        state.deliveries.retain(|(_, date, _), _| *date >= before);
        Ok(n - state.deliveries.len())
    }
}

impl Default for MemoryStore {
    fn default() -> Self {
        Self::new(Arc::new(SystemClock))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::clock::ManualClock;
    use chrono::{TimeZone, Utc};

    #[tokio::test]
    async fn test_entries_respect_lookback() {
        let clock = Arc::new(ManualClock::new(Utc.with_ymd_and_hms(2026, 10, 18, 18, 0, 0).unwrap()));
        let store = MemoryStore::new(clock.clone());
        store.add_user(1, "Europe/Moscow");
        store.add_entry(1, &["calm"], 60);
        store.add_entry(1, &["tired"], 8 * 24 * 60);

        let entries = store.get_user_entries(1, 7).await.unwrap();
        assert_eq!(entries.len(), 1);
        assert_eq!(entries[0].emotions, vec!["calm".to_string()]);
    }

    #[tokio::test]
    async fn test_broken_user_reads_fail() {
        let store = MemoryStore::default();
        store.add_user(1, "UTC");
        store.break_user(1);
        assert!(store.get_user(1).await.is_err());
        assert!(store.get_active_users().await.unwrap().len() == 1);
    }
}
