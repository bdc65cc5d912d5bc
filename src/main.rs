use std::path::PathBuf;

use clap::{Parser, Subcommand};

use reminder_sync::config::Config;
use reminder_sync::daemon::{self, Runtime};
use reminder_sync::error::Result;
use reminder_sync::maintenance;
use reminder_sync::reminders::now_ts;

#[derive(Parser, Debug)]
#[command(name = "reminder-sync")]
#[command(about = "Local-first reminder cache, remote sync and notification dispatcher")]
#[command(version)]
struct Cli {
    /// JSON config file; convention defaults are used when omitted.
    #[arg(long, global = true, env = "REMINDER_SYNC_CONFIG")]
    config: Option<PathBuf>,

    /// Overrides `database.sqlite_path` from the config.
    #[arg(long, global = true)]
    db: Option<String>,

    #[command(subcommand)]
    command: Option<Command>,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Run the dispatcher and the sync jobs until interrupted (default).
    Run,
    /// One push-then-pull cycle.
    Sync,
    /// Delete local rows whose remote counterpart no longer exists.
    SweepZombies,
    /// One dispatcher tick.
    Tick,
    /// Silence every active constant reminder of a chat.
    StopConstant {
        #[arg(long)]
        chat_id: String,
    },
    /// Pull every remote reminder, finalized ones included.
    Import,
    /// Remove remote copies sharing chat, title and schedule.
    DedupeRemote {
        #[arg(long)]
        dry_run: bool,
    },
    /// Snapshot the local database.
    Backup {
        #[arg(long)]
        dir: Option<PathBuf>,
    },
    /// Re-queue rows the remote rejected.
    RetryFailed,
    /// Drop finalized synced reminders older than the retention window.
    Purge,
    /// Print row counts per sync status.
    Status,
}

#[tokio::main]
async fn main() -> Result<()> {
    reminder_sync::logging::init_tracing("reminder_sync");
    let cli = Cli::parse();

    let mut config = Config::load(cli.config.as_deref())?;
    if let Some(db) = cli.db {
        config.database.sqlite_path = Some(db);
    }

    match cli.command.unwrap_or(Command::Run) {
        Command::Run => daemon::run(config).await,
        command => run_once(command, &config).await,
    }
}

async fn run_once(command: Command, config: &Config) -> Result<()> {
    let runtime = Runtime::from_config(config).await?;
    match command {
        Command::Run => return daemon::run(config.clone()).await,
        Command::Sync => {
            let report = runtime.require_sync()?.engine.run_cycle().await?;
            println!("{report:#?}");
        }
        Command::SweepZombies => {
            let report = runtime.require_sync()?.reconciler.sweep().await?;
            println!("{report:#?}");
        }
        Command::Tick => {
            let report = runtime.dispatcher.tick().await?;
            println!("{report:#?}");
        }
        Command::StopConstant { chat_id } => {
            let report = runtime.dispatcher.stop_constant(&chat_id).completed().await?;
            println!("{report:#?}");
        }
        Command::Import => {
            let report = maintenance::import_all(&runtime.require_sync()?.engine).await?;
            println!("{report:#?}");
        }
        Command::DedupeRemote { dry_run } => {
            let report = maintenance::dedupe_remote(
                runtime.require_sync()?.remote.as_ref(),
                &runtime.store,
                config.remote_page_size(),
                dry_run,
            )
            .await?;
            println!("{report:#?}");
        }
        Command::Backup { dir } => {
            let dir = dir.unwrap_or_else(reminder_sync::runtime_paths::default_backup_dir);
            let path = maintenance::backup_local(&runtime.store, &dir, now_ts()).await?;
            println!("{}", path.display());
        }
        Command::RetryFailed => {
            let requeued = runtime.store.retry_failed().await?;
            println!("requeued {requeued} reminders");
        }
        Command::Purge => {
            let purged = runtime
                .store
                .purge_finalized(now_ts() - config.retention_keep_seconds())
                .await?;
            println!("purged {purged} reminders");
        }
        Command::Status => {
            let counts = runtime.store.count_by_status().await?;
            println!("{counts:#?}");
        }
    }
    Ok(())
}
