//! Operator tasks: full import, remote duplicate cleanup and local backups.

use std::collections::BTreeMap;
use std::path::{Path, PathBuf};

use chrono::{DateTime, Utc};
use futures::future::join_all;
use tracing::{info, warn};

use crate::error::{ReminderSyncError, Result};
use crate::reminders::{ReminderStore, RemoteId, RemoteReminder};
use crate::remote::{Page, RemoteFilter, RemoteStore};
use crate::sync::{PullReport, SyncEngine};

pub const DEDUPE_CHUNK: usize = 100;

/// Pulls every remote row, finalized or not, through the regular merge rules.
pub async fn import_all(engine: &SyncEngine) -> Result<PullReport> {
    let report = engine.pull_matching(RemoteFilter::everything()).await?;
    info!(
        fetched = report.fetched,
        inserted = report.inserted,
        merged = report.merged,
        "full import finished"
    );
    Ok(report)
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct DedupeReport {
    pub scanned: usize,
    pub duplicate_groups: usize,
    pub duplicates: Vec<RemoteId>,
    pub deleted: usize,
    pub failed: usize,
    pub local_removed: usize,
    pub dry_run: bool,
}

/// Remote rows sharing chat, title and schedule are copies of one reminder. The oldest copy
/// (by `created_at`, then id) survives.
pub async fn dedupe_remote(
    remote: &dyn RemoteStore,
    store: &ReminderStore,
    page_size: usize,
    dry_run: bool,
) -> Result<DedupeReport> {
    let rows = fetch_all(remote, page_size).await?;
    let mut groups: BTreeMap<(String, String, Option<i64>), Vec<RemoteReminder>> = BTreeMap::new();
    for row in &rows {
        groups
            .entry((
                row.fields.chat_id.clone(),
                row.fields.title.clone(),
                row.fields.scheduled_at,
            ))
            .or_default()
            .push(row.clone());
    }

    let mut report = DedupeReport {
        scanned: rows.len(),
        dry_run,
        ..DedupeReport::default()
    };
    for copies in groups.values_mut() {
        if copies.len() < 2 {
            continue;
        }
        report.duplicate_groups += 1;
        copies.sort_by_key(|copy| (copy.fields.created_at, copy.id));
        report
            .duplicates
            .extend(copies.iter().skip(1).map(|copy| copy.id));
    }

    if dry_run || report.duplicates.is_empty() {
        info!(
            scanned = report.scanned,
            duplicates = report.duplicates.len(),
            dry_run,
            "remote duplicate scan finished"
        );
        return Ok(report);
    }

    for chunk in report.duplicates.clone().chunks(DEDUPE_CHUNK) {
        let results = join_all(chunk.iter().map(|id| async move { (*id, remote.delete(*id).await) })).await;
        for (remote_id, result) in results {
            match result {
                Ok(()) => {
                    report.deleted += 1;
                    if remove_local_copy(store, remote_id).await? {
                        report.local_removed += 1;
                    }
                }
                Err(err) => {
                    report.failed += 1;
                    warn!(remote_id, error = %err, "could not delete remote duplicate");
                }
            }
        }
    }
    info!(
        deleted = report.deleted,
        failed = report.failed,
        local_removed = report.local_removed,
        "remote duplicates removed"
    );
    Ok(report)
}

async fn remove_local_copy(store: &ReminderStore, remote_id: RemoteId) -> Result<bool> {
    match store.find_by_remote_id(remote_id).await? {
        Some(local) => Ok(store.delete_local_batch(vec![local.id]).await? > 0),
        None => Ok(false),
    }
}

async fn fetch_all(remote: &dyn RemoteStore, page_size: usize) -> Result<Vec<RemoteReminder>> {
    let filter = RemoteFilter::everything();
    let mut rows = Vec::new();
    let mut page = Page::first(page_size.max(1));
    loop {
        let batch = remote.list_pending(&filter, page).await?;
        let fetched = batch.len();
        for row in batch {
            match row {
                Ok(row) => rows.push(row),
                Err(err) => warn!(error = %err, "unreadable remote row left out of dedupe"),
            }
        }
        if fetched < page.limit {
            return Ok(rows);
        }
        page = page.next();
    }
}

pub fn backup_file_name(now: i64) -> Result<String> {
    let at = DateTime::<Utc>::from_timestamp(now, 0)
        .ok_or_else(|| ReminderSyncError::Runtime(format!("timestamp {now} is out of range")))?;
    Ok(format!("reminders_{}.db", at.format("%Y%m%d_%H%M%S")))
}

/// Snapshots the local database into `dir` and returns the written path.
pub async fn backup_local(store: &ReminderStore, dir: &Path, now: i64) -> Result<PathBuf> {
    let target = dir.join(backup_file_name(now)?);
    if target.exists() {
        return Err(ReminderSyncError::Runtime(format!(
            "backup {} already exists",
            target.display()
        )));
    }
    store.backup_to(&target).await?;
    info!(path = %target.display(), "local backup written");
    Ok(target)
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;

    use crate::reminders::ReminderFields;
    use crate::remote::InMemoryRemoteStore;

    fn fields(title: &str, created_at: i64) -> ReminderFields {
        ReminderFields {
            chat_id: "c1".to_string(),
            owner: "ana".to_string(),
            title: title.to_string(),
            description: None,
            scheduled_at: Some(1_900_000_000),
            created_at,
            notified: true,
            constant_notify: false,
            notify_stopped: false,
            repeat: false,
            repeat_unit: None,
            repeat_count: None,
            recurrence_created: false,
        }
    }

    #[test]
    fn backup_names_are_timestamped() {
        assert_eq!(
            backup_file_name(1_735_689_600).expect("name"),
            "reminders_20250101_000000.db"
        );
    }

    #[tokio::test]
    async fn dedupe_keeps_the_oldest_copy() {
        let dir = tempfile::tempdir().expect("temp dir");
        let store = Arc::new(
            ReminderStore::new(dir.path().join("dedupe.db").to_string_lossy())
                .await
                .expect("store"),
        );
        let remote = Arc::new(InMemoryRemoteStore::new());
        let newer = remote.seed(fields("Vet", 200)).await;
        let oldest = remote.seed(fields("Vet", 100)).await;
        let unrelated = remote.seed(fields("Groceries", 50)).await;

        let engine = SyncEngine::new(store.clone(), remote.clone());
        let imported = import_all(&engine).await.expect("import");
        assert_eq!(imported.inserted, 3);

        let dry = dedupe_remote(remote.as_ref(), &store, 2, true)
            .await
            .expect("dry run");
        assert_eq!(dry.duplicates, vec![newer]);
        assert_eq!(remote.len().await, 3);

        let report = dedupe_remote(remote.as_ref(), &store, 2, false)
            .await
            .expect("dedupe");
        assert_eq!(report.deleted, 1);
        assert_eq!(report.local_removed, 1);
        assert!(remote.get(newer).await.is_none());
        assert!(remote.get(oldest).await.is_some());
        assert!(remote.get(unrelated).await.is_some());
        assert!(store.find_by_remote_id(newer).await.expect("find").is_none());
    }

    #[tokio::test]
    async fn backup_refuses_to_overwrite() {
        let dir = tempfile::tempdir().expect("temp dir");
        let store = ReminderStore::new(dir.path().join("live.db").to_string_lossy())
            .await
            .expect("store");
        let backups = dir.path().join("backups");

        let path = backup_local(&store, &backups, 1_735_689_600)
            .await
            .expect("backup");
        assert!(path.exists());
        assert!(backup_local(&store, &backups, 1_735_689_600).await.is_err());
    }
}
