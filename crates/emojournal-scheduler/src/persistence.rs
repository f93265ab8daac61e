//! SQLite-backed persistence for users, settings, entries, daily schedules
//! and summary dedup records. Survives restarts; the schedule table is what
//! startup recovery reads back.

use async_trait::async_trait;
use chrono::{DateTime, Duration, NaiveDate, NaiveDateTime, NaiveTime, Utc};
use rusqlite::{Connection, OptionalExtension, params};
use std::path::Path;
use std::sync::{Arc, Mutex, MutexGuard};

use crate::clock::{Clock, SystemClock};
use crate::timezone::TimezoneResolver;
use emojournal_core::error::{EmoJournalError, Result};
use emojournal_core::traits::UserStore;
use emojournal_core::types::{Entry, SummaryDeliveryRecord, SummaryKind, User, UserSettings};

const DATE_FMT: &str = "%Y-%m-%d";
const LOCAL_TS_FMT: &str = "%Y-%m-%d %H:%M:%S";
const SLOT_FMT: &str = "%H:%M";

/// SQLite-backed store for everything the scheduler reads and writes.
pub struct SchedulerDb {
    conn: Mutex<Connection>,
    clock: Arc<dyn Clock>,
    timezones: TimezoneResolver,
}

impl SchedulerDb {
    /// Open or create the database file.
    pub fn open(path: &Path) -> Result<Self> {
        if let Some(parent) = path.parent()
            && !parent.as_os_str().is_empty()
        {
            std::fs::create_dir_all(parent)?;
        }
        let conn = Connection::open(path).map_err(|e| db_err("DB open", e))?;
        Self::from_connection(conn)
    }

    /// Private in-memory database, for tests and dry runs.
    pub fn open_in_memory() -> Result<Self> {
        let conn = Connection::open_in_memory().map_err(|e| db_err("DB open", e))?;
        Self::from_connection(conn)
    }

    fn from_connection(conn: Connection) -> Result<Self> {
        let db = Self {
            conn: Mutex::new(conn),
            clock: Arc::new(SystemClock),
            timezones: TimezoneResolver::default(),
        };
        db.migrate()?;
        Ok(db)
    }

    /// Use `clock` for "now" (entry cutoffs, timestamps).
    pub fn with_clock(mut self, clock: Arc<dyn Clock>) -> Self {
        self.clock = clock;
        self
    }

    /// Fallback zone for users whose stored timezone is invalid.
    pub fn with_timezones(mut self, timezones: TimezoneResolver) -> Self {
        self.timezones = timezones;
        self
    }

    fn conn(&self) -> MutexGuard<'_, Connection> {
        self.conn.lock().unwrap_or_else(|p| p.into_inner())
    }

    /// Run migrations to create tables.
    fn migrate(&self) -> Result<()> {
        self.conn()
            .execute_batch(
                "
            CREATE TABLE IF NOT EXISTS users (
                id INTEGER PRIMARY KEY,
                chat_id INTEGER NOT NULL UNIQUE,
                timezone TEXT NOT NULL DEFAULT 'Europe/Moscow',
                paused INTEGER NOT NULL DEFAULT 0,
                created_at TEXT NOT NULL,
                last_activity TEXT NOT NULL
            );

            CREATE TABLE IF NOT EXISTS user_settings (
                user_id INTEGER PRIMARY KEY,
                weekly_summary_enabled INTEGER NOT NULL DEFAULT 1,
                summary_time_hour INTEGER NOT NULL DEFAULT 21
            );

            -- ts_local is the user's wall clock at write time
            CREATE TABLE IF NOT EXISTS entries (
                id INTEGER PRIMARY KEY AUTOINCREMENT,
                user_id INTEGER NOT NULL,
                ts_local TEXT NOT NULL,
                emotions TEXT NOT NULL DEFAULT '[]',   -- JSON array
                cause TEXT,
                note TEXT,
                created_at TEXT NOT NULL
            );
            CREATE INDEX IF NOT EXISTS idx_entries_user_date ON entries(user_id, ts_local);

            CREATE TABLE IF NOT EXISTS schedules (
                id INTEGER PRIMARY KEY AUTOINCREMENT,
                user_id INTEGER NOT NULL,
                date_local TEXT NOT NULL,
                times_local TEXT NOT NULL,             -- JSON array of HH:MM
                created_at TEXT NOT NULL,
                UNIQUE (user_id, date_local)
            );

            CREATE TABLE IF NOT EXISTS summary_deliveries (
                user_id INTEGER NOT NULL,
                local_date TEXT NOT NULL,
                kind TEXT NOT NULL,
                success INTEGER NOT NULL,
                recorded_at TEXT NOT NULL,
                PRIMARY KEY (user_id, local_date, kind)
            );
         ",
            )
            .map_err(|e| db_err("Migration", e))
    }

    // ─── Users ────────────────────────────────────────────────

    pub fn create_user(&self, user_id: i64, chat_id: i64, timezone: &str) -> Result<User> {
        let now = self.clock.now();
        self.conn()
            .execute(
                "INSERT INTO users (id, chat_id, timezone, paused, created_at, last_activity)
                 VALUES (?1, ?2, ?3, 0, ?4, ?4)",
                params![user_id, chat_id, timezone, now.to_rfc3339()],
            )
            .map_err(|e| db_err("Create user", e))?;
        tracing::info!("👤 Created user {} (chat {})", user_id, chat_id);
        Ok(User {
            id: user_id,
            chat_id,
            timezone: timezone.to_string(),
            paused: false,
            created_at: now,
        })
    }

    pub fn update_user_timezone(&self, user_id: i64, timezone: &str) -> Result<()> {
        let changed = self
            .conn()
            .execute(
                "UPDATE users SET timezone = ?1, last_activity = ?2 WHERE id = ?3",
                params![timezone, self.clock.now().to_rfc3339(), user_id],
            )
            .map_err(|e| db_err("Update timezone", e))?;
        if changed == 0 {
            return Err(EmoJournalError::NotFound(format!("user {user_id}")));
        }
        Ok(())
    }

    pub fn save_user_settings(&self, user_id: i64, settings: UserSettings) -> Result<()> {
        self.conn()
            .execute(
                "INSERT OR REPLACE INTO user_settings (user_id, weekly_summary_enabled, summary_time_hour)
                 VALUES (?1, ?2, ?3)",
                params![user_id, settings.weekly_summary_enabled as i32, settings.summary_time_hour],
            )
            .map_err(|e| db_err("Save settings", e))?;
        Ok(())
    }

    /// Remove the user and everything keyed by them.
    pub fn delete_user_data(&self, user_id: i64) -> Result<()> {
        let mut conn = self.conn();
        let tx = conn.transaction().map_err(|e| db_err("Delete user", e))?;
        for sql in [
            "DELETE FROM entries WHERE user_id = ?1",
            "DELETE FROM schedules WHERE user_id = ?1",
            "DELETE FROM summary_deliveries WHERE user_id = ?1",
            "DELETE FROM user_settings WHERE user_id = ?1",
            "DELETE FROM users WHERE id = ?1",
        ] {
            // Dropping `tx` on error rolls the whole delete back.
            tx.execute(sql, params![user_id]).map_err(|e| db_err("Delete user", e))?;
        }
        tx.commit().map_err(|e| db_err("Delete user", e))?;
        tracing::info!("🗑️ Deleted all data for user {}", user_id);
        Ok(())
    }

    // ─── Entries ──────────────────────────────────────────────

    /// Record an entry stamped with the user's current local time.
    pub fn create_entry(
        &self,
        user_id: i64,
        emotions: &[String],
        cause: Option<&str>,
        note: Option<&str>,
    ) -> Result<Entry> {
        let user = self
            .load_user(user_id)?
            .ok_or_else(|| EmoJournalError::NotFound(format!("user {user_id}")))?;
        let now = self.clock.now();
        let ts_local = now.with_timezone(&self.timezones.resolve(&user.timezone)).naive_local();
        let emotions_json = serde_json::to_string(emotions)
            .map_err(|e| EmoJournalError::Database(format!("Encode emotions: {e}")))?;

        let conn = self.conn();
        conn.execute(
            "INSERT INTO entries (user_id, ts_local, emotions, cause, note, created_at)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6)",
            params![
                user_id,
                ts_local.format(LOCAL_TS_FMT).to_string(),
                emotions_json,
                cause,
                note,
                now.to_rfc3339(),
            ],
        )
        .map_err(|e| db_err("Create entry", e))?;
        let id = conn.last_insert_rowid();
        conn.execute(
            "UPDATE users SET last_activity = ?1 WHERE id = ?2",
            params![now.to_rfc3339(), user_id],
        )
        .map_err(|e| db_err("Touch user", e))?;

        Ok(Entry {
            id,
            user_id,
            ts_local,
            emotions: emotions.to_vec(),
            cause: cause.map(str::to_string),
            note: note.map(str::to_string),
        })
    }

    fn load_user(&self, user_id: i64) -> Result<Option<User>> {
        self.conn()
            .query_row(
                "SELECT id, chat_id, timezone, paused, created_at FROM users WHERE id = ?1",
                params![user_id],
                row_to_user,
            )
            .optional()
            .map_err(|e| db_err("Get user", e))
    }

    /// Number of stored schedule rows for a user (all dates).
    pub fn count_schedules(&self, user_id: i64) -> Result<usize> {
        self.conn()
            .query_row(
                "SELECT COUNT(*) FROM schedules WHERE user_id = ?1",
                params![user_id],
                |row| row.get::<_, i64>(0),
            )
            .map(|n| n as usize)
            .map_err(|e| db_err("Count schedules", e))
    }
}

#[async_trait]
impl UserStore for SchedulerDb {
    async fn get_active_users(&self) -> Result<Vec<User>> {
        let conn = self.conn();
        let mut stmt = conn
            .prepare("SELECT id, chat_id, timezone, paused, created_at FROM users WHERE paused = 0 ORDER BY id")
            .map_err(|e| db_err("Active users", e))?;
        let users = stmt
            .query_map([], row_to_user)
            .map_err(|e| db_err("Active users", e))?
            .collect::<std::result::Result<Vec<_>, _>>()
            .map_err(|e| db_err("Active users", e))?;
        Ok(users)
    }

    async fn get_user(&self, user_id: i64) -> Result<Option<User>> {
        self.load_user(user_id)
    }

    async fn get_user_settings(&self, user_id: i64) -> Result<Option<UserSettings>> {
        self.conn()
            .query_row(
                "SELECT weekly_summary_enabled, summary_time_hour FROM user_settings WHERE user_id = ?1",
                params![user_id],
                |row| {
                    Ok(UserSettings {
                        weekly_summary_enabled: row.get::<_, i32>(0)? != 0,
                        summary_time_hour: row.get(1)?,
                    })
                },
            )
            .optional()
            .map_err(|e| db_err("Get settings", e))
    }

    async fn save_user_schedule(&self, user_id: i64, date: NaiveDate, slots: &[NaiveTime]) -> Result<()> {
        let times: Vec<String> = slots.iter().map(|t| t.format(SLOT_FMT).to_string()).collect();
        let times_json = serde_json::to_string(&times)
            .map_err(|e| EmoJournalError::Database(format!("Encode schedule: {e}")))?;
        self.conn()
            .execute(
                "INSERT OR REPLACE INTO schedules (user_id, date_local, times_local, created_at)
                 VALUES (?1, ?2, ?3, ?4)",
                params![
                    user_id,
                    date.format(DATE_FMT).to_string(),
                    times_json,
                    self.clock.now().to_rfc3339(),
                ],
            )
            .map_err(|e| db_err("Save schedule", e))?;
        Ok(())
    }

    async fn get_user_schedule(&self, user_id: i64, date: NaiveDate) -> Result<Option<Vec<NaiveTime>>> {
        let raw: Option<String> = self
            .conn()
            .query_row(
                "SELECT times_local FROM schedules WHERE user_id = ?1 AND date_local = ?2",
                params![user_id, date.format(DATE_FMT).to_string()],
                |row| row.get(0),
            )
            .optional()
            .map_err(|e| db_err("Get schedule", e))?;
        let Some(raw) = raw else {
            return Ok(None);
        };

        let times: Vec<String> = serde_json::from_str(&raw)
            .map_err(|e| EmoJournalError::Database(format!("Corrupt schedule for user {user_id} on {date}: {e}")))?;
        let mut slots = times
            .iter()
            .map(|t| NaiveTime::parse_from_str(t, SLOT_FMT))
            .collect::<std::result::Result<Vec<_>, _>>()
            .map_err(|e| EmoJournalError::Database(format!("Corrupt slot for user {user_id} on {date}: {e}")))?;
        slots.sort_unstable();
        slots.dedup();
        Ok(Some(slots))
    }

    async fn get_user_entries(&self, user_id: i64, days: u32) -> Result<Vec<Entry>> {
        let Some(user) = self.load_user(user_id)? else {
            return Ok(Vec::new());
        };
        let tz = self.timezones.resolve(&user.timezone);
        let cutoff = (self.clock.now().with_timezone(&tz) - Duration::days(days as i64)).naive_local();

        let conn = self.conn();
        let mut stmt = conn
            .prepare(
                "SELECT id, user_id, ts_local, emotions, cause, note FROM entries
                 WHERE user_id = ?1 AND ts_local >= ?2 ORDER BY ts_local DESC",
            )
            .map_err(|e| db_err("Get entries", e))?;
        let rows = stmt
            .query_map(params![user_id, cutoff.format(LOCAL_TS_FMT).to_string()], |row| {
                let ts: String = row.get(2)?;
                let emotions: String = row.get(3)?;
                Ok((
                    row.get::<_, i64>(0)?,
                    row.get::<_, i64>(1)?,
                    ts,
                    emotions,
                    row.get::<_, Option<String>>(4)?,
                    row.get::<_, Option<String>>(5)?,
                ))
            })
            .map_err(|e| db_err("Get entries", e))?;

        let mut entries = Vec::new();
        for row in rows {
            let (id, user_id, ts, emotions, cause, note) = row.map_err(|e| db_err("Get entries", e))?;
            let Ok(ts_local) = NaiveDateTime::parse_from_str(&ts, LOCAL_TS_FMT) else {
                tracing::warn!("⚠️ Skipping entry {} with unreadable timestamp '{}'", id, ts);
                continue;
            };
            let emotions = match serde_json::from_str(&emotions) {
                Ok(list) => list,
                Err(e) => {
                    tracing::warn!("⚠️ Entry {} of user {} has unreadable emotions: {}", id, user_id, e);
                    Vec::new()
                }
            };
            entries.push(Entry {
                id,
                user_id,
                ts_local,
                emotions,
                cause,
                note,
            });
        }
        Ok(entries)
    }

    async fn update_user_paused(&self, user_id: i64, paused: bool) -> Result<()> {
        self.conn()
            .execute(
                "UPDATE users SET paused = ?1, last_activity = ?2 WHERE id = ?3",
                params![paused as i32, self.clock.now().to_rfc3339(), user_id],
            )
            .map_err(|e| db_err("Update paused", e))?;
        tracing::info!("⏸️ User {} paused = {}", user_id, paused);
        Ok(())
    }

    async fn get_summary_delivery(
        &self,
        user_id: i64,
        local_date: NaiveDate,
        kind: SummaryKind,
    ) -> Result<Option<SummaryDeliveryRecord>> {
        self.conn()
            .query_row(
                "SELECT success, recorded_at FROM summary_deliveries
                 WHERE user_id = ?1 AND local_date = ?2 AND kind = ?3",
                params![user_id, local_date.format(DATE_FMT).to_string(), kind.as_str()],
                |row| {
                    let success = row.get::<_, i32>(0)? != 0;
                    let recorded_at: String = row.get(1)?;
                    Ok(SummaryDeliveryRecord {
                        user_id,
                        local_date,
                        kind,
                        success,
                        recorded_at: parse_instant(&recorded_at),
                    })
                },
            )
            .optional()
            .map_err(|e| db_err("Get summary delivery", e))
    }

    async fn record_summary_delivery(&self, record: &SummaryDeliveryRecord) -> Result<()> {
        // A successful record is never downgraded by a later failed attempt.
        self.conn()
            .execute(
                "INSERT INTO summary_deliveries (user_id, local_date, kind, success, recorded_at)
                 VALUES (?1, ?2, ?3, ?4, ?5)
                 ON CONFLICT (user_id, local_date, kind) DO UPDATE SET
                    success = MAX(success, excluded.success),
                    recorded_at = excluded.recorded_at",
                params![
                    record.user_id,
                    record.local_date.format(DATE_FMT).to_string(),
                    record.kind.as_str(),
                    record.success as i32,
                    record.recorded_at.to_rfc3339(),
                ],
            )
            .map_err(|e| db_err("Record summary delivery", e))?;
        Ok(())
    }

    async fn cleanup_old_schedules(&self, before: NaiveDate) -> Result<usize> {
        self.conn()
            .execute(
                "DELETE FROM schedules WHERE date_local < ?1",
                params![before.format(DATE_FMT).to_string()],
            )
            .map_err(|e| db_err("Cleanup schedules", e))
    }

    async fn prune_summary_deliveries(&self, before: NaiveDate) -> Result<usize> {
        self.conn()
            .execute(
                "DELETE FROM summary_deliveries WHERE local_date < ?1",
                params![before.format(DATE_FMT).to_string()],
            )
            .map_err(|e| db_err("Prune summary deliveries", e))
    }
}

fn row_to_user(row: &rusqlite::Row<'_>) -> rusqlite::Result<User> {
    let created_at: String = row.get(4)?;
    Ok(User {
        id: row.get(0)?,
        chat_id: row.get(1)?,
        timezone: row.get(2)?,
        paused: row.get::<_, i32>(3)? != 0,
        created_at: parse_instant(&created_at),
    })
}

fn parse_instant(s: &str) -> DateTime<Utc> {
    DateTime::parse_from_rfc3339(s)
        .map(|t| t.with_timezone(&Utc))
        .unwrap_or_default()
}

fn db_err(context: &str, e: rusqlite::Error) -> EmoJournalError {
    EmoJournalError::Database(format!("{context}: {e}"))
}
