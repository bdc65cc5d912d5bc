use std::sync::Arc;

use tracing::{info, warn};

use super::CycleLock;
use crate::error::Result;
use crate::reminders::{ReminderId, ReminderStore};
use crate::remote::RemoteStore;

/// SQLite caps bound parameters per statement; deletes stay under it.
pub const DEFAULT_ZOMBIE_BATCH: usize = 900;

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct ZombieReport {
    pub remote_ids: usize,
    pub linked_locally: usize,
    pub zombies: usize,
    pub deleted: usize,
    pub failed_batches: usize,
}

/// Removes local rows whose remote counterpart disappeared outside this engine.
pub struct ZombieReconciler {
    store: Arc<ReminderStore>,
    remote: Arc<dyn RemoteStore>,
    batch_size: usize,
    lock: CycleLock,
}

impl ZombieReconciler {
    pub fn new(store: Arc<ReminderStore>, remote: Arc<dyn RemoteStore>, lock: CycleLock) -> Self {
        Self {
            store,
            remote,
            batch_size: DEFAULT_ZOMBIE_BATCH,
            lock,
        }
    }

    pub fn with_batch_size(mut self, batch_size: usize) -> Self {
        self.batch_size = batch_size.max(1);
        self
    }

    /// Lists every remote id, then deletes linked local rows missing from that set. Aborts
    /// without touching local data when the listing fails.
    pub async fn sweep(&self) -> Result<ZombieReport> {
        let _guard = self.lock.lock().await;

        let remote_ids = self.remote.list_all_ids().await?;
        let links = self.store.list_remote_links().await?;
        let zombies: Vec<ReminderId> = links
            .iter()
            .filter(|(_, remote_id)| !remote_ids.contains(remote_id))
            .map(|(id, _)| *id)
            .collect();

        let mut report = ZombieReport {
            remote_ids: remote_ids.len(),
            linked_locally: links.len(),
            zombies: zombies.len(),
            ..ZombieReport::default()
        };
        if zombies.is_empty() {
            info!(remote_ids = report.remote_ids, "no zombie reminders found");
            return Ok(report);
        }

        for batch in zombies.chunks(self.batch_size) {
            match self.store.delete_local_batch(batch.to_vec()).await {
                Ok(deleted) => report.deleted += deleted,
                Err(err) => {
                    report.failed_batches += 1;
                    warn!(batch = batch.len(), error = %err, "zombie batch delete failed");
                }
            }
        }
        info!(
            zombies = report.zombies,
            deleted = report.deleted,
            failed_batches = report.failed_batches,
            "zombie sweep finished"
        );
        Ok(report)
    }
}
