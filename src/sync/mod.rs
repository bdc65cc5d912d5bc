//! Bidirectional reconciliation between the local cache and the remote store.
//!
//! A cycle pushes first and pulls second, so a row accepted remotely during the push already
//! carries its remote id when the pull sees it. Per-record failures are counted and logged; the
//! batch always runs to the end.

use std::sync::Arc;

use tokio::sync::Mutex;
use tracing::{debug, info, warn};

use crate::error::Result;
use crate::reminders::{
    now_ts, PullOutcome, PushCompletion, Reminder, ReminderStore, SyncStatus,
};
use crate::remote::{Page, RemoteFilter, RemoteStore, RemoteUpdate};

mod zombies;

pub use zombies::{ZombieReconciler, ZombieReport};

/// Serializes push/pull cycles against zombie sweeps so a sweep never sees a remote id that was
/// created after its id listing.
pub type CycleLock = Arc<Mutex<()>>;

pub const DEFAULT_PAGE_SIZE: usize = 1000;
pub const DEFAULT_PULL_WINDOW_SECONDS: i64 = 30 * 86_400;

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct BatchReport {
    pub attempted: usize,
    pub succeeded: usize,
    pub failed: usize,
}

impl BatchReport {
    fn success(&mut self) {
        self.attempted += 1;
        self.succeeded += 1;
    }

    fn failure(&mut self) {
        self.attempted += 1;
        self.failed += 1;
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct PushReport {
    pub creates: BatchReport,
    pub updates: BatchReport,
    pub deletes: BatchReport,
    /// Rows moved to `failed` because the remote refused them.
    pub rejected: usize,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct PullReport {
    pub fetched: usize,
    pub inserted: usize,
    pub merged: usize,
    pub unchanged: usize,
    pub skipped_pending: usize,
    pub skipped_deleted: usize,
    pub failed: usize,
}

impl PullReport {
    fn record(&mut self, outcome: PullOutcome) {
        match outcome {
            PullOutcome::Inserted(_) => self.inserted += 1,
            PullOutcome::Merged(_) => self.merged += 1,
            PullOutcome::Unchanged(_) => self.unchanged += 1,
            PullOutcome::SkippedLocalPending(_) => self.skipped_pending += 1,
            PullOutcome::SkippedDeleted => self.skipped_deleted += 1,
        }
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct SyncReport {
    pub push: PushReport,
    pub pull: PullReport,
}

pub struct SyncEngine {
    store: Arc<ReminderStore>,
    remote: Arc<dyn RemoteStore>,
    page_size: usize,
    pull_window_seconds: i64,
    lock: CycleLock,
}

impl SyncEngine {
    pub fn new(store: Arc<ReminderStore>, remote: Arc<dyn RemoteStore>) -> Self {
        Self {
            store,
            remote,
            page_size: DEFAULT_PAGE_SIZE,
            pull_window_seconds: DEFAULT_PULL_WINDOW_SECONDS,
            lock: Arc::new(Mutex::new(())),
        }
    }

    pub fn with_page_size(mut self, page_size: usize) -> Self {
        self.page_size = page_size.max(1);
        self
    }

    pub fn with_pull_window(mut self, seconds: i64) -> Self {
        self.pull_window_seconds = seconds;
        self
    }

    pub fn cycle_lock(&self) -> CycleLock {
        Arc::clone(&self.lock)
    }

    pub fn store(&self) -> &Arc<ReminderStore> {
        &self.store
    }

    pub fn remote(&self) -> &Arc<dyn RemoteStore> {
        &self.remote
    }

    /// One push/pull cycle.
    pub async fn run_cycle(&self) -> Result<SyncReport> {
        let _guard = self.lock.lock().await;
        let push = self.push_pending_unlocked().await?;
        let pull = self.pull_unlocked(self.pending_filter(now_ts())).await?;
        info!(
            created = push.creates.succeeded,
            updated = push.updates.succeeded,
            deleted = push.deletes.succeeded,
            rejected = push.rejected,
            pulled = pull.fetched,
            inserted = pull.inserted,
            merged = pull.merged,
            "sync cycle finished"
        );
        Ok(SyncReport { push, pull })
    }

    pub async fn push_pending(&self) -> Result<PushReport> {
        let _guard = self.lock.lock().await;
        self.push_pending_unlocked().await
    }

    pub async fn pull_remote(&self) -> Result<PullReport> {
        let _guard = self.lock.lock().await;
        self.pull_unlocked(self.pending_filter(now_ts())).await
    }

    /// Pulls every remote row matching `filter` through the regular merge rules.
    pub async fn pull_matching(&self, filter: RemoteFilter) -> Result<PullReport> {
        let _guard = self.lock.lock().await;
        self.pull_unlocked(filter).await
    }

    fn pending_filter(&self, now: i64) -> RemoteFilter {
        RemoteFilter::pending_since(now - self.pull_window_seconds)
    }

    async fn push_pending_unlocked(&self) -> Result<PushReport> {
        let mut report = PushReport::default();

        for reminder in self.store.list_by_status(SyncStatus::Pending).await? {
            self.push_create(&reminder, &mut report).await;
        }
        for reminder in self.store.list_by_status(SyncStatus::PendingUpdate).await? {
            self.push_update(&reminder, &mut report).await;
        }
        self.push_deletions(&mut report).await?;

        Ok(report)
    }

    async fn push_create(&self, reminder: &Reminder, report: &mut PushReport) {
        let snapshot = reminder.fields();
        let remote_id = match self.remote.create(&snapshot).await {
            Ok(remote_id) => remote_id,
            Err(err) => {
                report.creates.failure();
                self.handle_push_error(reminder, &err, report).await;
                return;
            }
        };

        match self
            .store
            .complete_push(reminder.id, snapshot, remote_id)
            .await
        {
            Ok(completion) => {
                report.creates.success();
                log_completion(reminder, remote_id, &completion);
            }
            Err(err) => {
                report.creates.failure();
                tracing::error!(
                    reminder_id = reminder.id,
                    remote_id,
                    error = %err,
                    "remote create succeeded but the local link was not recorded"
                );
            }
        }
    }

    async fn push_update(&self, reminder: &Reminder, report: &mut PushReport) {
        let Some(remote_id) = reminder.remote_id else {
            report.updates.failure();
            warn!(reminder_id = reminder.id, "pending_update row has no remote id");
            return;
        };
        let dirty = match self.store.dirty_fields(reminder.id).await {
            Ok(dirty) => dirty,
            Err(err) => {
                report.updates.failure();
                warn!(reminder_id = reminder.id, error = %err, "could not read dirty fields");
                return;
            }
        };

        let snapshot = reminder.fields();
        let update = RemoteUpdate::from_dirty(snapshot.clone(), dirty);
        if let Err(err) = self.remote.update(remote_id, &update).await {
            report.updates.failure();
            self.handle_push_error(reminder, &err, report).await;
            return;
        }

        match self
            .store
            .complete_push(reminder.id, snapshot, remote_id)
            .await
        {
            Ok(completion) => {
                report.updates.success();
                log_completion(reminder, remote_id, &completion);
            }
            Err(err) => {
                report.updates.failure();
                warn!(reminder_id = reminder.id, remote_id, error = %err, "could not record pushed update");
            }
        }
    }

    async fn handle_push_error(
        &self,
        reminder: &Reminder,
        err: &crate::error::ReminderSyncError,
        report: &mut PushReport,
    ) {
        if !err.is_rejection() {
            warn!(reminder_id = reminder.id, error = %err, "push deferred to next cycle");
            return;
        }
        report.rejected += 1;
        warn!(reminder_id = reminder.id, error = %err, "remote rejected reminder; marking failed");
        if let Err(mark_err) = self.store.mark_failed(reminder.id).await {
            warn!(reminder_id = reminder.id, error = %mark_err, "could not mark reminder failed");
        }
    }

    async fn push_deletions(&self, report: &mut PushReport) -> Result<()> {
        for deletion in self.store.list_pending_deletions().await? {
            let Some(remote_id) = deletion.remote_id else {
                // Nothing to delete remotely.
                match self.store.remove_pending_deletion(deletion.id).await {
                    Ok(_) => report.deletes.success(),
                    Err(_) => report.deletes.failure(),
                }
                continue;
            };

            match self.remote.delete(remote_id).await {
                Ok(()) => match self.store.remove_pending_deletion(deletion.id).await {
                    Ok(_) => {
                        report.deletes.success();
                        debug!(remote_id, local_id = deletion.local_id, "remote deletion confirmed");
                    }
                    Err(err) => {
                        report.deletes.failure();
                        warn!(remote_id, error = %err, "could not clear pending deletion");
                    }
                },
                Err(err) => {
                    report.deletes.failure();
                    if err.is_rejection() {
                        report.rejected += 1;
                    }
                    warn!(remote_id, local_id = deletion.local_id, error = %err, "remote deletion failed; kept queued");
                }
            }
        }
        Ok(())
    }

    async fn pull_unlocked(&self, filter: RemoteFilter) -> Result<PullReport> {
        let mut report = PullReport::default();
        let mut page = Page::first(self.page_size);
        loop {
            let rows = self.remote.list_pending(&filter, page).await?;
            let fetched = rows.len();
            report.fetched += fetched;

            for row in rows {
                let remote = match row {
                    Ok(remote) => remote,
                    Err(err) => {
                        report.failed += 1;
                        warn!(error = %err, "skipping unreadable remote row");
                        continue;
                    }
                };
                let remote_id = remote.id;
                match self.store.apply_remote(remote).await {
                    Ok(outcome) => {
                        if let PullOutcome::SkippedLocalPending(reminder_id) = outcome {
                            debug!(reminder_id, remote_id, "local change pending; remote copy skipped");
                        }
                        report.record(outcome);
                    }
                    Err(err) => {
                        report.failed += 1;
                        warn!(remote_id, error = %err, "could not apply remote row");
                    }
                }
            }

            if fetched < page.limit {
                break;
            }
            page = page.next();
        }
        Ok(report)
    }
}

fn log_completion(reminder: &Reminder, remote_id: i64, completion: &PushCompletion) {
    match completion {
        PushCompletion::Synced => {
            debug!(reminder_id = reminder.id, remote_id, "reminder synced")
        }
        PushCompletion::StillDirty(fields) => debug!(
            reminder_id = reminder.id,
            remote_id,
            changed = fields.len(),
            "reminder changed during push; stays pending_update"
        ),
        PushCompletion::Orphaned => info!(
            reminder_id = reminder.id,
            remote_id,
            "reminder deleted during push; remote copy queued for deletion"
        ),
    }
}
