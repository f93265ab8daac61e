//! # EmoJournal
//!
//! Check-in and weekly summary scheduler for the EmoJournal Telegram bot.
//!
//! Usage:
//!   emojournal                          # Run the scheduler (same as `run`)
//!   emojournal -c ./config.toml run     # Custom config file
//!   emojournal due                      # Print weekly summary eligibility as JSON
//!   emojournal test-summary 42          # Send a summary to user 42 right now

mod http;

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Instant;
use tracing_subscriber::EnvFilter;

use emojournal_core::EmoJournalConfig;
use emojournal_scheduler::{
    EntryDigest, JobScheduler, ScheduleService, SchedulerDb, SystemClock, TelegramNotifier, TimezoneResolver,
};

#[derive(Parser)]
#[command(name = "emojournal", version, about = "🌟 EmoJournal: check-in and weekly summary scheduler")]
struct Cli {
    /// Config file (default: ~/.emojournal/config.toml)
    #[arg(short, long, global = true)]
    config: Option<String>,

    /// Verbose logging
    #[arg(short, long, global = true)]
    verbose: bool,

    #[command(subcommand)]
    command: Option<Command>,
}

#[derive(Subcommand)]
enum Command {
    /// Start the scheduler and wait for Ctrl-C
    Run,
    /// Print which users are due for the weekly summary right now
    Due,
    /// Send a weekly summary to one user immediately
    TestSummary {
        /// Telegram user id
        user_id: i64,
    },
}

fn expand_path(p: &str) -> PathBuf {
    PathBuf::from(shellexpand::tilde(p).to_string())
}

fn load_config(path: Option<&str>) -> Result<EmoJournalConfig> {
    let config = match path {
        Some(p) => {
            let path = expand_path(p);
            EmoJournalConfig::load_from(&path).with_context(|| format!("loading {}", path.display()))?
        }
        None => EmoJournalConfig::load()?,
    };
    config.validate()?;
    Ok(config)
}

fn build_service(config: &EmoJournalConfig) -> Result<Arc<ScheduleService>> {
    let db_path = expand_path(&config.database_path);
    let store = Arc::new(
        SchedulerDb::open(&db_path)
            .with_context(|| format!("opening database {}", db_path.display()))?
            .with_timezones(TimezoneResolver::from_name(&config.scheduler.default_timezone)),
    );
    tracing::info!("🗄️ Database: {}", db_path.display());

    let notifier = Arc::new(TelegramNotifier::new(&config.telegram)?);
    let generator = Arc::new(EntryDigest::new(store.clone()));
    let scheduler = JobScheduler::new(Arc::new(SystemClock), config.scheduler.max_instances);

    Ok(ScheduleService::new(scheduler, store, notifier, generator, config))
}

async fn run(config: EmoJournalConfig) -> Result<()> {
    let service = build_service(&config)?;
    service.start()?;

    let report = service.recover_all().await?;
    tracing::info!(
        "♻️ Recovered schedules for {} users ({} failed)",
        report.processed,
        report.failed
    );

    let driver = service.scheduler().start();

    if config.http.enabled {
        let state = Arc::new(http::AppState {
            service: service.clone(),
            start_time: Instant::now(),
        });
        let bind = config.http.bind.clone();
        tokio::spawn(async move {
            if let Err(e) = http::serve(&bind, state).await {
                tracing::error!("❌ Diagnostics server stopped: {}", e);
            }
        });
    }

    tracing::info!("🌟 EmoJournal scheduler running. Press Ctrl-C to stop.");
    tokio::signal::ctrl_c().await?;

    tracing::info!("🛑 Shutting down");
    service.scheduler().shutdown();
    driver.await?;
    Ok(())
}

async fn print_due(config: EmoJournalConfig) -> Result<()> {
    let service = build_service(&config)?;
    let due = service.get_users_due_for_summary().await?;
    println!("{}", serde_json::to_string_pretty(&due)?);
    Ok(())
}

async fn test_summary(config: EmoJournalConfig, user_id: i64) -> Result<()> {
    let service = build_service(&config)?;
    if service.send_test_weekly_summary(user_id).await {
        println!("✅ Test summary sent to user {user_id}");
        Ok(())
    } else {
        anyhow::bail!("test summary for user {user_id} was not delivered")
    }
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    let filter = if cli.verbose {
        "emojournal=debug,emojournal_scheduler=debug,tower_http=debug"
    } else {
        "emojournal=info,emojournal_scheduler=info"
    };
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(filter)))
        .with_target(false)
        .init();

    let config = load_config(cli.config.as_deref())?;

    match cli.command.unwrap_or(Command::Run) {
        Command::Run => run(config).await,
        Command::Due => print_due(config).await,
        Command::TestSummary { user_id } => test_summary(config, user_id).await,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_cli_defaults_to_run() {
        let cli = Cli::try_parse_from(["emojournal"]).unwrap();
        assert!(cli.command.is_none());
        assert!(!cli.verbose);
    }

    #[test]
    fn test_cli_test_summary_with_global_flags() {
        let cli = Cli::try_parse_from(["emojournal", "test-summary", "42", "-v", "--config", "/tmp/ej.toml"]).unwrap();
        assert!(cli.verbose);
        assert_eq!(cli.config.as_deref(), Some("/tmp/ej.toml"));
        assert!(matches!(cli.command, Some(Command::TestSummary { user_id: 42 })));
    }

    #[test]
    fn test_expand_path_tilde() {
        let expanded = expand_path("~/x.db");
        assert!(!expanded.to_string_lossy().starts_with('~'));
    }
}
