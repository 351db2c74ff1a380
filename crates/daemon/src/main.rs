use std::path::PathBuf;
use std::process::ExitCode;
use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use tablevault_daemon::config::{self, Config};
use tablevault_daemon::display::backup_line;
use tablevault_daemon::{BackupManager, BackupScheduler};
use tracing::{error, info};
use tracing_subscriber::EnvFilter;

const AUTO_BACKUP_HOURS: u64 = 6;
const AUTO_CLEANUP_HOURS: u64 = 24;

#[derive(Parser)]
#[command(name = "tablevault")]
#[command(about = "Full database dumps with retention and scheduling")]
#[command(version)]
struct Cli {
    /// Path to a TOML config file
    #[arg(long, global = true)]
    config: Option<PathBuf>,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand)]
enum Command {
    /// Create a full backup now
    Create,

    /// List backups, newest first
    List,

    /// Replay a backup file into the database
    Restore {
        /// Backup filename inside the output directory
        filename: String,
    },

    /// Delete backups older than the retention window
    Clean,

    /// Back up every N hours until interrupted
    Schedule {
        #[arg(default_value_t = 24.0)]
        hours: f64,
    },

    /// Back up now, then every 6 hours, with daily cleanup, until interrupted
    Auto,
}

#[tokio::main]
async fn main() -> ExitCode {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")))
        .init();

    let cli = Cli::parse();
    match run(cli).await {
        Ok(()) => ExitCode::SUCCESS,
        Err(e) => {
            eprintln!("error: {e:#}");
            ExitCode::FAILURE
        }
    }
}

async fn run(cli: Cli) -> Result<()> {
    let cfg = match &cli.config {
        Some(path) => {
            info!(?path, "loading config file");
            config::load_config(path)?
        }
        None => Config::default(),
    };

    let backup_config = config::backup_config(&cfg)?;
    let database_url = config::database_url(&cfg)
        .context("no database configured: set DATABASE_URL or [database].url")?;
    let executor = tablevault_executor::connect(&database_url).await?;

    let manager = Arc::new(BackupManager::new(backup_config, executor));
    manager.initialize()?;

    match cli.command {
        Command::Create => {
            let info = manager.create_full_backup().await.context("backup failed")?;
            println!("Backup created: {}", info.filename);
        }
        Command::List => {
            let backups = manager.list_backups()?;
            if backups.is_empty() {
                println!("No backups found.");
            }
            for backup in &backups {
                println!("{}", backup_line(backup));
            }
        }
        Command::Restore { filename } => {
            manager
                .restore_from_backup(&filename)
                .await
                .with_context(|| format!("restore from {filename} failed"))?;
            println!("Restored from {filename}");
        }
        Command::Clean => {
            let removed = manager.clean_old_backups().await?;
            println!("Removed {removed} expired backup(s)");
        }
        Command::Schedule { hours } => {
            let scheduler = BackupScheduler::new(manager.clone());
            scheduler.schedule_backups(hours_to_duration(hours)?)?;
            println!("Backing up every {hours} hour(s); press Ctrl-C to stop");
            wait_for_interrupt(&scheduler).await?;
        }
        Command::Auto => {
            match manager.create_full_backup().await {
                Ok(info) => println!("Backup created: {}", info.filename),
                Err(e) => error!(error = %format!("{e:#}"), "initial backup failed"),
            }
            let scheduler = BackupScheduler::new(manager.clone());
            scheduler.schedule_backups(Duration::from_secs(AUTO_BACKUP_HOURS * 3600))?;
            scheduler.schedule_cleanup(Duration::from_secs(AUTO_CLEANUP_HOURS * 3600))?;
            println!(
                "Backing up every {AUTO_BACKUP_HOURS} hours, cleaning every {AUTO_CLEANUP_HOURS} hours; press Ctrl-C to stop"
            );
            wait_for_interrupt(&scheduler).await?;
        }
    }
    Ok(())
}

fn hours_to_duration(hours: f64) -> Result<Duration> {
    Duration::try_from_secs_f64(hours * 3600.0).with_context(|| format!("invalid interval: {hours} hours"))
}

async fn wait_for_interrupt(scheduler: &BackupScheduler) -> Result<()> {
    tokio::signal::ctrl_c().await.context("listen for ctrl-c")?;
    info!("interrupt received, stopping scheduler");
    scheduler.shutdown().await;
    Ok(())
}
