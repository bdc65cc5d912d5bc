use std::future::Future;
use std::sync::Arc;

use tracing::{info, warn};

use crate::config::Config;
use crate::dispatch::{ChatLedger, ReminderDispatcher};
use crate::error::{ReminderSyncError, Result};
use crate::jobs::{DispatchJob, RetentionJob, SyncJob, ZombieSweepJob};
use crate::notifier::{MemoryNotifier, Notifier, TelegramNotifier};
use crate::reminders::ReminderStore;
use crate::remote::{RemoteStore, RestRemoteStore};
use crate::scheduler::Scheduler;
use crate::sync::{SyncEngine, ZombieReconciler};

/// Everything one process needs, wired from a single [`Config`].
pub struct Runtime {
    pub store: Arc<ReminderStore>,
    pub notifier: Arc<dyn Notifier>,
    pub dispatcher: Arc<ReminderDispatcher>,
    /// `None` when no remote is configured; the process then runs local-only.
    pub sync: Option<SyncParts>,
}

pub struct SyncParts {
    pub remote: Arc<dyn RemoteStore>,
    pub engine: Arc<SyncEngine>,
    pub reconciler: Arc<ZombieReconciler>,
}

impl Runtime {
    pub async fn from_config(config: &Config) -> Result<Self> {
        let store = Arc::new(ReminderStore::new(config.sqlite_path()).await?);
        Ok(Self::assemble(
            config,
            store,
            remote_from_config(config)?,
            notifier_from_config(config)?,
        ))
    }

    /// Wires already-built backends; tests use this with the in-memory doubles.
    pub fn assemble(
        config: &Config,
        store: Arc<ReminderStore>,
        remote: Option<Arc<dyn RemoteStore>>,
        notifier: Arc<dyn Notifier>,
    ) -> Self {
        let sync = remote.map(|remote| {
            let engine = Arc::new(
                SyncEngine::new(Arc::clone(&store), Arc::clone(&remote))
                    .with_page_size(config.remote_page_size())
                    .with_pull_window(config.pull_window_seconds()),
            );
            let reconciler = Arc::new(
                ZombieReconciler::new(Arc::clone(&store), Arc::clone(&remote), engine.cycle_lock())
                    .with_batch_size(config.zombie_batch_size()),
            );
            SyncParts {
                remote,
                engine,
                reconciler,
            }
        });
        let ledger = ChatLedger::new(
            config.chat_state_capacity(),
            config.chat_state_idle_seconds(),
        );
        let dispatcher = Arc::new(ReminderDispatcher::with_ledger(
            Arc::clone(&store),
            Arc::clone(&notifier),
            ledger,
        ));
        Self {
            store,
            notifier,
            dispatcher,
            sync,
        }
    }

    /// Remote-facing commands refuse to run without a configured remote.
    pub fn require_sync(&self) -> Result<&SyncParts> {
        self.sync.as_ref().ok_or_else(|| {
            ReminderSyncError::Config(
                "remote.base_url is not configured; this command needs the remote store"
                    .to_string(),
            )
        })
    }

    pub fn scheduler(&self, config: &Config) -> Scheduler {
        let mut scheduler = Scheduler::new();
        scheduler.register_job(Arc::new(DispatchJob::new(
            Arc::clone(&self.dispatcher),
            config.tick_interval(),
        )));
        if let Some(sync) = &self.sync {
            scheduler.register_job(Arc::new(SyncJob::new(
                Arc::clone(&sync.engine),
                config.push_interval(),
            )));
            if let Some(every) = config.zombie_sweep_interval() {
                scheduler.register_job(Arc::new(ZombieSweepJob::new(
                    Arc::clone(&sync.reconciler),
                    every,
                )));
            }
        }
        scheduler.register_job(Arc::new(RetentionJob::new(
            Arc::clone(&self.store),
            config.retention_interval(),
            config.retention_keep_seconds(),
        )));
        scheduler
    }
}

fn remote_from_config(config: &Config) -> Result<Option<Arc<dyn RemoteStore>>> {
    if config.remote.base_url.is_some() {
        return Ok(Some(Arc::new(RestRemoteStore::from_config(config)?)));
    }
    warn!("remote.base_url is not set; running local-only without sync");
    Ok(None)
}

fn notifier_from_config(config: &Config) -> Result<Arc<dyn Notifier>> {
    if config.notifier.bot_token.is_some() {
        return Ok(Arc::new(TelegramNotifier::from_config(config)?));
    }
    warn!("no bot token configured; notifications are only recorded in memory");
    Ok(Arc::new(MemoryNotifier::new()))
}

pub async fn run(config: Config) -> Result<()> {
    run_with_shutdown(config, async {
        if let Err(err) = tokio::signal::ctrl_c().await {
            warn!(error = %err, "could not listen for ctrl-c; running until killed");
            futures::future::pending::<()>().await;
        }
    })
    .await
}

pub async fn run_with_shutdown<F>(config: Config, shutdown: F) -> Result<()>
where
    F: Future<Output = ()> + Send + 'static,
{
    info!(
        git_sha = crate::GIT_SHA,
        db = %config.sqlite_path(),
        "starting reminder-sync daemon"
    );
    let runtime = Runtime::from_config(&config).await?;
    let mut scheduler = runtime.scheduler(&config);
    info!(jobs = ?scheduler.job_names(), "scheduler configured");
    scheduler.start();

    shutdown.await;

    info!("shutdown requested; waiting for running jobs");
    scheduler.stop().await;
    info!("reminder-sync daemon stopped");
    Ok(())
}
