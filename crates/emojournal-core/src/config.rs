//! EmoJournal configuration system.

use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};

use crate::error::{EmoJournalError, Result};

/// Root configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EmoJournalConfig {
    #[serde(default = "default_database_path")]
    pub database_path: String,
    #[serde(default)]
    pub telegram: TelegramConfig,
    #[serde(default)]
    pub http: HttpConfig,
    #[serde(default)]
    pub scheduler: SchedulerConfig,
    #[serde(default)]
    pub summary: SummaryConfig,
}

fn default_database_path() -> String { "~/.emojournal/emojournal.db".into() }

impl Default for EmoJournalConfig {
    fn default() -> Self {
        Self {
            database_path: default_database_path(),
            telegram: TelegramConfig::default(),
            http: HttpConfig::default(),
            scheduler: SchedulerConfig::default(),
            summary: SummaryConfig::default(),
        }
    }
}

impl EmoJournalConfig {
    /// Load config from the default path (~/.emojournal/config.toml).
    pub fn load() -> Result<Self> {
        let path = Self::default_path();
        if path.exists() {
            Self::load_from(&path)
        } else {
            Ok(Self::default().with_env_overrides())
        }
    }

    /// Load config from a specific path.
    pub fn load_from(path: &Path) -> Result<Self> {
        let content = std::fs::read_to_string(path)
            .map_err(|e| EmoJournalError::Config(format!("Failed to read config: {e}")))?;
        let config: Self = toml::from_str(&content)
            .map_err(|e| EmoJournalError::Config(format!("Failed to parse config: {e}")))?;
        Ok(config.with_env_overrides())
    }

    /// Save config to the default path.
    pub fn save(&self) -> Result<()> {
        let path = Self::default_path();
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)?;
        }
        let content = toml::to_string_pretty(self)
            .map_err(|e| EmoJournalError::Config(format!("Failed to serialize config: {e}")))?;
        std::fs::write(&path, content)?;
        Ok(())
    }

    /// Apply `TELEGRAM_BOT_TOKEN` / `EMOJOURNAL_DB_PATH` when set.
    pub fn with_env_overrides(mut self) -> Self {
        if let Ok(token) = std::env::var("TELEGRAM_BOT_TOKEN")
            && !token.is_empty() {
                self.telegram.bot_token = token;
            }
        if let Ok(path) = std::env::var("EMOJOURNAL_DB_PATH")
            && !path.is_empty() {
                self.database_path = path;
            }
        self
    }

    /// Reject values the scheduler cannot work with.
    pub fn validate(&self) -> Result<()> {
        let s = &self.scheduler;
        if s.daily_hours.is_empty() {
            return Err(EmoJournalError::Config("scheduler.daily_hours must not be empty".into()));
        }
        if let Some(h) = s.daily_hours.iter().find(|h| **h > 23) {
            return Err(EmoJournalError::Config(format!("scheduler.daily_hours: invalid hour {h}")));
        }
        if s.regen_hour > 23 || s.regen_minute > 59 {
            return Err(EmoJournalError::Config(format!(
                "scheduler regen time {:02}:{:02} is not a valid time",
                s.regen_hour, s.regen_minute
            )));
        }
        if s.snooze_min_minutes < 1
            || s.snooze_max_minutes > 120
            || s.snooze_min_minutes > s.snooze_max_minutes
        {
            return Err(EmoJournalError::Config(format!(
                "snooze bounds {}..={} must lie within 1..=120",
                s.snooze_min_minutes, s.snooze_max_minutes
            )));
        }
        if s.random_window_start_hour >= s.random_window_end_hour || s.random_window_end_hour > 24 {
            return Err(EmoJournalError::Config("random slot window is empty".into()));
        }
        if s.default_timezone.parse::<chrono_tz::Tz>().is_err() {
            return Err(EmoJournalError::Config(format!(
                "unknown default_timezone '{}'",
                s.default_timezone
            )));
        }
        let m = &self.summary;
        if m.default_hour > 23 {
            return Err(EmoJournalError::Config(format!("summary.default_hour: invalid hour {}", m.default_hour)));
        }
        if m.window_minutes == 0 || m.window_minutes >= 60 {
            return Err(EmoJournalError::Config("summary.window_minutes must be in 1..60".into()));
        }
        Ok(())
    }

    /// Get the default config path.
    pub fn default_path() -> PathBuf {
        Self::home_dir().join("config.toml")
    }

    /// Get the EmoJournal home directory.
    pub fn home_dir() -> PathBuf {
        dirs::home_dir()
            .unwrap_or_else(|| PathBuf::from("."))
            .join(".emojournal")
    }
}

/// Telegram Bot API settings.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TelegramConfig {
    #[serde(default)]
    pub bot_token: String,
    #[serde(default = "default_api_base")]
    pub api_base: String,
    #[serde(default = "default_timeout_secs")]
    pub timeout_secs: u64,
}

fn default_api_base() -> String { "https://api.telegram.org".into() }
fn default_timeout_secs() -> u64 { 10 }

impl Default for TelegramConfig {
    fn default() -> Self {
        Self {
            bot_token: String::new(),
            api_base: default_api_base(),
            timeout_secs: default_timeout_secs(),
        }
    }
}

/// Diagnostics HTTP endpoint.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct HttpConfig {
    #[serde(default = "bool_true")]
    pub enabled: bool,
    #[serde(default = "default_bind")]
    pub bind: String,
}

fn bool_true() -> bool { true }
fn default_bind() -> String { "127.0.0.1:8088".into() }

impl Default for HttpConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            bind: default_bind(),
        }
    }
}

/// How daily slots are chosen.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "lowercase")]
pub enum SlotPolicy {
    #[default]
    Fixed,
    Random,
}

/// Ping scheduling settings.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SchedulerConfig {
    #[serde(default = "default_daily_hours")]
    pub daily_hours: Vec<u32>,
    #[serde(default)]
    pub slot_policy: SlotPolicy,
    #[serde(default = "default_regen_hour")]
    pub regen_hour: u32,
    #[serde(default = "default_regen_minute")]
    pub regen_minute: u32,
    #[serde(default = "default_timezone")]
    pub default_timezone: String,
    #[serde(default = "default_snooze")]
    pub snooze_default_minutes: u32,
    #[serde(default = "default_snooze_min")]
    pub snooze_min_minutes: u32,
    #[serde(default = "default_snooze_max")]
    pub snooze_max_minutes: u32,
    #[serde(default = "default_retry_delay")]
    pub retry_delay_secs: u64,
    /// Concurrent instances allowed per recurring job id.
    #[serde(default = "default_max_instances")]
    pub max_instances: usize,
    #[serde(default = "default_schedule_retention")]
    pub schedule_retention_days: u32,
    #[serde(default = "default_window_start")]
    pub random_window_start_hour: u32,
    #[serde(default = "default_window_end")]
    pub random_window_end_hour: u32,
    #[serde(default = "default_min_gap")]
    pub random_min_gap_minutes: u32,
    #[serde(default = "default_max_attempts")]
    pub random_max_attempts: u32,
}

fn default_daily_hours() -> Vec<u32> { vec![9, 13, 17, 21] }
fn default_regen_hour() -> u32 { 8 }
fn default_regen_minute() -> u32 { 55 }
fn default_timezone() -> String { "Europe/Moscow".into() }
fn default_snooze() -> u32 { 15 }
fn default_snooze_min() -> u32 { 1 }
fn default_snooze_max() -> u32 { 120 }
fn default_retry_delay() -> u64 { 60 }
fn default_max_instances() -> usize { 3 }
fn default_schedule_retention() -> u32 { 7 }
fn default_window_start() -> u32 { 9 }
fn default_window_end() -> u32 { 23 }
fn default_min_gap() -> u32 { 120 }
fn default_max_attempts() -> u32 { 100 }

impl Default for SchedulerConfig {
    fn default() -> Self {
        Self {
            daily_hours: default_daily_hours(),
            slot_policy: SlotPolicy::default(),
            regen_hour: default_regen_hour(),
            regen_minute: default_regen_minute(),
            default_timezone: default_timezone(),
            snooze_default_minutes: default_snooze(),
            snooze_min_minutes: default_snooze_min(),
            snooze_max_minutes: default_snooze_max(),
            retry_delay_secs: default_retry_delay(),
            max_instances: default_max_instances(),
            schedule_retention_days: default_schedule_retention(),
            random_window_start_hour: default_window_start(),
            random_window_end_hour: default_window_end(),
            random_min_gap_minutes: default_min_gap(),
            random_max_attempts: default_max_attempts(),
        }
    }
}

/// Weekly rollup settings.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SummaryConfig {
    #[serde(default = "default_summary_hour")]
    pub default_hour: u32,
    #[serde(default = "bool_true")]
    pub default_enabled: bool,
    /// Eligible minutes past the delivery hour. Tied to the hourly sweep cadence.
    #[serde(default = "default_window_minutes")]
    pub window_minutes: u32,
    #[serde(default = "default_lookback_days")]
    pub lookback_days: u32,
    #[serde(default = "default_record_retention")]
    pub record_retention_days: u32,
}

fn default_summary_hour() -> u32 { 21 }
fn default_window_minutes() -> u32 { 30 }
fn default_lookback_days() -> u32 { 7 }
fn default_record_retention() -> u32 { 2 }

impl Default for SummaryConfig {
    fn default() -> Self {
        Self {
            default_hour: default_summary_hour(),
            default_enabled: true,
            window_minutes: default_window_minutes(),
            lookback_days: default_lookback_days(),
            record_retention_days: default_record_retention(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_config() {
        let config = EmoJournalConfig::default();
        assert_eq!(config.scheduler.daily_hours, vec![9, 13, 17, 21]);
        assert_eq!(config.scheduler.default_timezone, "Europe/Moscow");
        assert_eq!(config.scheduler.snooze_default_minutes, 15);
        assert_eq!(config.scheduler.retry_delay_secs, 60);
        assert_eq!(config.summary.default_hour, 21);
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_config_from_toml() {
        let toml_str = r#"
            database_path = "/tmp/emo.db"

            [scheduler]
            daily_hours = [10, 18]
            slot_policy = "random"
            default_timezone = "Asia/Tokyo"

            [summary]
            default_hour = 20
        "#;

        let config: EmoJournalConfig = toml::from_str(toml_str).unwrap();
        assert_eq!(config.database_path, "/tmp/emo.db");
        assert_eq!(config.scheduler.daily_hours, vec![10, 18]);
        assert_eq!(config.scheduler.slot_policy, SlotPolicy::Random);
        assert_eq!(config.scheduler.regen_minute, 55);
        assert_eq!(config.summary.default_hour, 20);
        assert_eq!(config.summary.window_minutes, 30);
    }

    #[test]
    fn test_config_missing_fields_use_defaults() {
        let config: EmoJournalConfig = toml::from_str("").unwrap();
        assert_eq!(config.http.bind, "127.0.0.1:8088");
        assert_eq!(config.telegram.api_base, "https://api.telegram.org");
        assert_eq!(config.scheduler.slot_policy, SlotPolicy::Fixed);
    }

    #[test]
    fn test_validate_rejects_bad_values() {
        let mut config = EmoJournalConfig::default();
        config.scheduler.daily_hours = vec![9, 24];
        assert!(config.validate().is_err());

        let mut config = EmoJournalConfig::default();
        config.scheduler.default_timezone = "Mars/Olympus".into();
        assert!(config.validate().is_err());

        let mut config = EmoJournalConfig::default();
        config.scheduler.snooze_max_minutes = 500;
        assert!(config.validate().is_err());

        let mut config = EmoJournalConfig::default();
        config.summary.window_minutes = 0;
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_home_dir() {
        let home = EmoJournalConfig::home_dir();
        assert!(home.to_string_lossy().contains("emojournal"));
    }
}
