use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use tracing::info;

use crate::dispatch::ReminderDispatcher;
use crate::error::Result;
use crate::interfaces::scheduler::ScheduledJob;
use crate::reminders::{now_ts, ReminderStore};
use crate::sync::{SyncEngine, ZombieReconciler};

/// Push then pull.
pub struct SyncJob {
    engine: Arc<SyncEngine>,
    interval: Duration,
}

impl SyncJob {
    pub fn new(engine: Arc<SyncEngine>, interval: Duration) -> Self {
        Self { engine, interval }
    }
}

#[async_trait]
impl ScheduledJob for SyncJob {
    fn name(&self) -> &str {
        "sync"
    }

    fn interval(&self) -> Duration {
        self.interval
    }

    async fn run(&self) -> Result<()> {
        self.engine.run_cycle().await?;
        Ok(())
    }
}

pub struct DispatchJob {
    dispatcher: Arc<ReminderDispatcher>,
    interval: Duration,
}

impl DispatchJob {
    pub fn new(dispatcher: Arc<ReminderDispatcher>, interval: Duration) -> Self {
        Self {
            dispatcher,
            interval,
        }
    }
}

#[async_trait]
impl ScheduledJob for DispatchJob {
    fn name(&self) -> &str {
        "dispatch"
    }

    fn interval(&self) -> Duration {
        self.interval
    }

    async fn run(&self) -> Result<()> {
        self.dispatcher.tick().await?;
        Ok(())
    }
}

/// Full remote id listing; only registered when a sweep interval is configured.
pub struct ZombieSweepJob {
    reconciler: Arc<ZombieReconciler>,
    interval: Duration,
}

impl ZombieSweepJob {
    pub fn new(reconciler: Arc<ZombieReconciler>, interval: Duration) -> Self {
        Self {
            reconciler,
            interval,
        }
    }
}

#[async_trait]
impl ScheduledJob for ZombieSweepJob {
    fn name(&self) -> &str {
        "zombie-sweep"
    }

    fn interval(&self) -> Duration {
        self.interval
    }

    fn run_at_start(&self) -> bool {
        false
    }

    async fn run(&self) -> Result<()> {
        self.reconciler.sweep().await?;
        Ok(())
    }
}

pub struct RetentionJob {
    store: Arc<ReminderStore>,
    interval: Duration,
    keep_seconds: i64,
}

impl RetentionJob {
    pub fn new(store: Arc<ReminderStore>, interval: Duration, keep_seconds: i64) -> Self {
        Self {
            store,
            interval,
            keep_seconds,
        }
    }
}

#[async_trait]
impl ScheduledJob for RetentionJob {
    fn name(&self) -> &str {
        "retention"
    }

    fn interval(&self) -> Duration {
        self.interval
    }

    fn run_at_start(&self) -> bool {
        false
    }

    async fn run(&self) -> Result<()> {
        let purged = self
            .store
            .purge_finalized(now_ts() - self.keep_seconds)
            .await?;
        if purged > 0 {
            info!(purged, "finalized reminders purged");
        }
        Ok(())
    }
}
