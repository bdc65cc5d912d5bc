use std::collections::BTreeSet;
use std::path::Path;
use std::time::{SystemTime, UNIX_EPOCH};

use diesel::prelude::*;
use diesel_async::RunQueryDsl;

use crate::db::{self, SqlitePool, SqlitePooledConn};
use crate::error::{ReminderSyncError, Result};

pub mod model;
pub mod notification_fsm;
pub mod recurrence;
mod schema;
mod tx;

pub use model::{
    NewReminder, PendingDeletion, Reminder, ReminderField, ReminderFields, ReminderId,
    ReminderPatch, RemoteId, RemoteReminder, RepeatSpec, RepeatUnit, SyncStatus, MAX_REPEAT_COUNT,
    REMINDERS_TABLE,
};
use schema::{pending_deletions, reminder_dirty_fields, reminders};

#[derive(Queryable)]
pub(crate) struct ReminderRow {
    id: i32,
    remote_id: Option<i64>,
    chat_id: String,
    owner: String,
    title: String,
    description: Option<String>,
    scheduled_at: Option<i64>,
    created_at: i64,
    notified: bool,
    constant_notify: bool,
    notify_stopped: bool,
    repeat: bool,
    repeat_unit: Option<String>,
    repeat_count: Option<i32>,
    recurrence_created: bool,
    sync_status: String,
    last_updated: i64,
}

#[derive(Insertable)]
#[diesel(table_name = reminders)]
pub(crate) struct NewReminderRow {
    remote_id: Option<i64>,
    chat_id: String,
    owner: String,
    title: String,
    description: Option<String>,
    scheduled_at: Option<i64>,
    created_at: i64,
    notified: bool,
    constant_notify: bool,
    notify_stopped: bool,
    repeat: bool,
    repeat_unit: Option<String>,
    repeat_count: Option<i32>,
    recurrence_created: bool,
    sync_status: String,
    last_updated: i64,
}

impl NewReminderRow {
    fn from_fields(
        fields: &ReminderFields,
        remote_id: Option<RemoteId>,
        status: SyncStatus,
        now: i64,
    ) -> Self {
        Self {
            remote_id,
            chat_id: fields.chat_id.clone(),
            owner: fields.owner.clone(),
            title: fields.title.clone(),
            description: fields.description.clone(),
            scheduled_at: fields.scheduled_at,
            created_at: fields.created_at,
            notified: fields.notified,
            constant_notify: fields.constant_notify,
            notify_stopped: fields.notify_stopped,
            repeat: fields.repeat,
            repeat_unit: fields.repeat_unit.map(|unit| unit.as_str().to_string()),
            repeat_count: fields.repeat_count.map(count_column),
            recurrence_created: fields.recurrence_created,
            sync_status: status.as_str().to_string(),
            last_updated: now,
        }
    }
}

#[derive(Queryable)]
struct PendingDeletionRow {
    id: i32,
    table_name: String,
    local_id: i32,
    remote_id: Option<i64>,
    deleted_at: i64,
}

/// Result of recording a successful remote create or update.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum PushCompletion {
    Synced,
    /// The row changed locally while the request was in flight.
    StillDirty(BTreeSet<ReminderField>),
    /// The row was deleted locally meanwhile; the remote copy is queued for deletion.
    Orphaned,
}

/// What a pulled remote row did to the local cache.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PullOutcome {
    Inserted(ReminderId),
    Merged(ReminderId),
    Unchanged(ReminderId),
    SkippedLocalPending(ReminderId),
    SkippedDeleted,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct StatusCounts {
    pub pending: i64,
    pub pending_update: i64,
    pub synced: i64,
    pub failed: i64,
}

/// Durable local cache of reminders. Every write is one short `IMMEDIATE` transaction; callers
/// must treat an `Err` as "nothing was written" and retry.
#[derive(Clone)]
pub struct ReminderStore {
    pool: SqlitePool,
}

impl ReminderStore {
    pub async fn new(sqlite_path: impl AsRef<str>) -> Result<Self> {
        let pool = db::open_pool(sqlite_path.as_ref()).await?;
        Ok(Self { pool })
    }

    pub async fn create(&self, new: &NewReminder) -> Result<Reminder> {
        if new.chat_id.trim().is_empty() {
            return Err(ReminderSyncError::Runtime("chat_id is required".to_string()));
        }
        if new.title.trim().is_empty() {
            return Err(ReminderSyncError::Runtime("title is required".to_string()));
        }
        if let Some(spec) = new.repeat {
            spec.checked()?;
        }

        let now = now_ts();
        let fields = ReminderFields {
            chat_id: new.chat_id.clone(),
            owner: new.owner.clone(),
            title: new.title.clone(),
            description: new.description.clone(),
            scheduled_at: new.scheduled_at,
            created_at: now,
            notified: false,
            constant_notify: new.constant_notify,
            notify_stopped: false,
            repeat: new.repeat.is_some(),
            repeat_unit: new.repeat.map(|spec| spec.unit),
            repeat_count: new.repeat.map(|spec| spec.count),
            recurrence_created: false,
        };
        let row = NewReminderRow::from_fields(&fields, None, SyncStatus::Pending, now);

        let mut conn = self.conn().await?;
        let inserted = db::write_tx(&mut conn, move |conn| tx::insert_reminder(conn, &row)).await?;
        map_row_checked(inserted)
    }

    pub async fn get(&self, id: ReminderId) -> Result<Option<Reminder>> {
        let mut conn = self.conn().await?;
        let row = reminders::table
            .filter(reminders::id.eq(id))
            .first::<ReminderRow>(&mut conn)
            .await
            .optional()
            .map_err(|e| ReminderSyncError::Runtime(e.to_string()))?;
        row.map(map_row_checked).transpose()
    }

    /// Applies a partial edit. Returns `false` when the row does not exist.
    pub async fn update(&self, id: ReminderId, patch: ReminderPatch) -> Result<bool> {
        if let Some(Some(spec)) = patch.repeat {
            spec.checked()?;
        }
        let now = now_ts();
        let mut conn = self.conn().await?;
        db::write_tx(&mut conn, move |conn| tx::apply_patch(conn, id, &patch, now)).await
    }

    /// Removes the row and, when it has a remote counterpart, queues the remote deletion.
    pub async fn delete(&self, id: ReminderId) -> Result<bool> {
        let now = now_ts();
        let mut conn = self.conn().await?;
        db::write_tx(&mut conn, move |conn| tx::delete_with_tombstone(conn, id, now)).await
    }

    /// Rows still owed a notification: never notified, or constant and not yet stopped.
    pub async fn list_due(&self) -> Result<Vec<Reminder>> {
        let mut conn = self.conn().await?;
        let rows: Vec<ReminderRow> = reminders::table
            .filter(
                reminders::notified.eq(false).or(reminders::constant_notify
                    .eq(true)
                    .and(reminders::notify_stopped.eq(false))),
            )
            .order((reminders::scheduled_at.asc(), reminders::id.asc()))
            .load(&mut conn)
            .await
            .map_err(|e| ReminderSyncError::Runtime(e.to_string()))?;
        rows.into_iter().map(map_row_checked).collect()
    }

    /// Notified repeating rows whose next occurrence does not exist yet, e.g. after a crash
    /// between the notification mark and the spawn.
    pub async fn list_unspawned_recurrences(&self) -> Result<Vec<Reminder>> {
        let mut conn = self.conn().await?;
        let rows: Vec<ReminderRow> = reminders::table
            .filter(reminders::repeat.eq(true))
            .filter(reminders::notified.eq(true))
            .filter(reminders::recurrence_created.eq(false))
            .order(reminders::id.asc())
            .load(&mut conn)
            .await
            .map_err(|e| ReminderSyncError::Runtime(e.to_string()))?;
        rows.into_iter().map(map_row_checked).collect()
    }

    pub async fn list_by_chat(&self, chat_id: &str) -> Result<Vec<Reminder>> {
        let mut conn = self.conn().await?;
        let rows: Vec<ReminderRow> = reminders::table
            .filter(reminders::chat_id.eq(chat_id))
            .order((reminders::scheduled_at.asc(), reminders::id.asc()))
            .load(&mut conn)
            .await
            .map_err(|e| ReminderSyncError::Runtime(e.to_string()))?;
        rows.into_iter().map(map_row_checked).collect()
    }

    pub async fn mark_notified(&self, id: ReminderId) -> Result<bool> {
        self.raise_flag(id, ReminderField::Notified).await
    }

    pub async fn mark_recurrence_created(&self, id: ReminderId) -> Result<bool> {
        self.raise_flag(id, ReminderField::RecurrenceCreated).await
    }

    /// Creates the next occurrence of `id` and raises its `recurrence_created` guard in the same
    /// transaction. Returns `None` when the row is gone, does not repeat, or already spawned.
    pub async fn spawn_recurrence(&self, id: ReminderId, next_at: i64) -> Result<Option<Reminder>> {
        let now = now_ts();
        let mut conn = self.conn().await?;
        let child =
            db::write_tx(&mut conn, move |conn| tx::spawn_recurrence(conn, id, next_at, now))
                .await?;
        child.map(map_row_checked).transpose()
    }

    /// Silences every notified, still-active constant reminder of a chat in one transaction.
    pub async fn stop_constant_for_chat(&self, chat_id: &str) -> Result<Vec<ReminderId>> {
        let now = now_ts();
        let chat_id = chat_id.to_string();
        let mut conn = self.conn().await?;
        db::write_tx(&mut conn, move |conn| tx::stop_constant(conn, &chat_id, now)).await
    }

    pub async fn list_by_status(&self, status: SyncStatus) -> Result<Vec<Reminder>> {
        let mut conn = self.conn().await?;
        let rows: Vec<ReminderRow> = reminders::table
            .filter(reminders::sync_status.eq(status.as_str()))
            .order(reminders::id.asc())
            .load(&mut conn)
            .await
            .map_err(|e| ReminderSyncError::Runtime(e.to_string()))?;
        rows.into_iter().map(map_row_checked).collect()
    }

    pub async fn find_by_remote_id(&self, remote_id: RemoteId) -> Result<Option<Reminder>> {
        let mut conn = self.conn().await?;
        let row = reminders::table
            .filter(reminders::remote_id.eq(Some(remote_id)))
            .first::<ReminderRow>(&mut conn)
            .await
            .optional()
            .map_err(|e| ReminderSyncError::Runtime(e.to_string()))?;
        row.map(map_row_checked).transpose()
    }

    /// Fields edited locally since the last confirmed push.
    pub async fn dirty_fields(&self, id: ReminderId) -> Result<BTreeSet<ReminderField>> {
        let mut conn = self.conn().await?;
        let names: Vec<String> = reminder_dirty_fields::table
            .filter(reminder_dirty_fields::reminder_id.eq(id))
            .select(reminder_dirty_fields::field)
            .load(&mut conn)
            .await
            .map_err(|e| ReminderSyncError::Runtime(e.to_string()))?;
        names.iter().map(|name| name.parse()).collect()
    }

    /// Records a remote create/update that carried `snapshot`. The row is re-read so that edits
    /// made during the network call stay dirty.
    pub async fn complete_push(
        &self,
        id: ReminderId,
        snapshot: ReminderFields,
        remote_id: RemoteId,
    ) -> Result<PushCompletion> {
        let now = now_ts();
        let mut conn = self.conn().await?;
        db::write_tx(&mut conn, move |conn| {
            tx::complete_push(conn, id, &snapshot, remote_id, now)
        })
        .await
    }

    pub async fn mark_failed(&self, id: ReminderId) -> Result<bool> {
        let mut conn = self.conn().await?;
        db::write_tx(&mut conn, move |conn| tx::mark_failed(conn, id)).await
    }

    pub async fn list_pending_deletions(&self) -> Result<Vec<PendingDeletion>> {
        let mut conn = self.conn().await?;
        let rows: Vec<PendingDeletionRow> = pending_deletions::table
            .order(pending_deletions::id.asc())
            .load(&mut conn)
            .await
            .map_err(|e| ReminderSyncError::Runtime(e.to_string()))?;
        Ok(rows
            .into_iter()
            .map(|row| PendingDeletion {
                id: row.id,
                table: row.table_name,
                local_id: row.local_id,
                remote_id: row.remote_id,
                deleted_at: row.deleted_at,
            })
            .collect())
    }

    pub async fn remove_pending_deletion(&self, id: i32) -> Result<bool> {
        let mut conn = self.conn().await?;
        db::write_tx(&mut conn, move |conn| tx::remove_pending_deletion(conn, id)).await
    }

    /// Folds one remote row into the cache: local pending edits win, tombstoned ids are not
    /// resurrected, monotonic flags never go back to false.
    pub async fn apply_remote(&self, remote: RemoteReminder) -> Result<PullOutcome> {
        let now = now_ts();
        let mut conn = self.conn().await?;
        db::write_tx(&mut conn, move |conn| tx::apply_remote(conn, &remote, now)).await
    }

    /// `(local id, remote id)` for every row the remote has accepted.
    pub async fn list_remote_links(&self) -> Result<Vec<(ReminderId, RemoteId)>> {
        let mut conn = self.conn().await?;
        let rows: Vec<(i32, Option<i64>)> = reminders::table
            .filter(reminders::remote_id.is_not_null())
            .select((reminders::id, reminders::remote_id))
            .order(reminders::id.asc())
            .load(&mut conn)
            .await
            .map_err(|e| ReminderSyncError::Runtime(e.to_string()))?;
        Ok(rows
            .into_iter()
            .filter_map(|(id, remote_id)| remote_id.map(|remote_id| (id, remote_id)))
            .collect())
    }

    /// Deletes rows without queueing remote deletions.
    pub async fn delete_local_batch(&self, ids: Vec<ReminderId>) -> Result<usize> {
        if ids.is_empty() {
            return Ok(0);
        }
        let mut conn = self.conn().await?;
        db::write_tx(&mut conn, move |conn| tx::delete_local_batch(conn, &ids)).await
    }

    /// Drops synced rows in a terminal notification state that were last touched before
    /// `older_than`. Repeating rows are kept until their next occurrence exists.
    pub async fn purge_finalized(&self, older_than: i64) -> Result<usize> {
        let mut conn = self.conn().await?;
        db::write_tx(&mut conn, move |conn| tx::purge_finalized(conn, older_than)).await
    }

    pub async fn retry_failed(&self) -> Result<usize> {
        let mut conn = self.conn().await?;
        db::write_tx(&mut conn, tx::retry_failed).await
    }

    pub async fn count_by_status(&self) -> Result<StatusCounts> {
        let mut conn = self.conn().await?;
        let rows: Vec<(String, i64)> = reminders::table
            .group_by(reminders::sync_status)
            .select((reminders::sync_status, diesel::dsl::count_star()))
            .load(&mut conn)
            .await
            .map_err(|e| ReminderSyncError::Runtime(e.to_string()))?;

        let mut counts = StatusCounts::default();
        for (status, count) in rows {
            match status.parse::<SyncStatus>()? {
                SyncStatus::Pending => counts.pending = count,
                SyncStatus::PendingUpdate => counts.pending_update = count,
                SyncStatus::Synced => counts.synced = count,
                SyncStatus::Failed => counts.failed = count,
            }
        }
        Ok(counts)
    }

    /// Writes a consistent copy of the database to `target` with `VACUUM INTO`.
    pub async fn backup_to(&self, target: &Path) -> Result<()> {
        let target = target
            .to_str()
            .ok_or_else(|| ReminderSyncError::Runtime("backup path is not UTF-8".to_string()))?;
        db::ensure_parent_dir(target)?;
        let statement = format!("VACUUM INTO '{}'", target.replace('\'', "''"));
        let mut conn = self.conn().await?;
        diesel::sql_query(statement)
            .execute(&mut conn)
            .await
            .map_err(|e| ReminderSyncError::Runtime(e.to_string()))?;
        Ok(())
    }

    async fn raise_flag(&self, id: ReminderId, field: ReminderField) -> Result<bool> {
        let now = now_ts();
        let mut conn = self.conn().await?;
        db::write_tx(&mut conn, move |conn| tx::raise_flag(conn, id, field, now)).await
    }

    async fn conn(&self) -> Result<SqlitePooledConn<'_>> {
        db::checkout(&self.pool).await
    }
}

/// Row mapping for transaction bodies. Unknown enum text degrades to defaults so a single bad
/// row cannot poison a write; async reads go through `map_row_checked` instead.
pub(crate) fn map_row(row: ReminderRow) -> Reminder {
    Reminder {
        id: row.id,
        remote_id: row.remote_id,
        chat_id: row.chat_id,
        owner: row.owner,
        title: row.title,
        description: row.description,
        scheduled_at: row.scheduled_at,
        created_at: row.created_at,
        notified: row.notified,
        constant_notify: row.constant_notify,
        notify_stopped: row.notify_stopped,
        repeat: row.repeat,
        repeat_unit: row.repeat_unit.as_deref().and_then(|unit| unit.parse().ok()),
        repeat_count: row
            .repeat_count
            .and_then(|count| u32::try_from(count).ok()),
        recurrence_created: row.recurrence_created,
        sync_status: row.sync_status.parse().unwrap_or(SyncStatus::Failed),
        last_updated: row.last_updated,
    }
}

/// Counts are bounded by [`MAX_REPEAT_COUNT`] before they reach the store.
fn count_column(count: u32) -> i32 {
    i32::try_from(count).unwrap_or(i32::MAX)
}

fn map_row_checked(row: ReminderRow) -> Result<Reminder> {
    row.sync_status.parse::<SyncStatus>()?;
    if let Some(unit) = row.repeat_unit.as_deref() {
        unit.parse::<RepeatUnit>()?;
    }
    Ok(map_row(row))
}

pub fn now_ts() -> i64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .unwrap_or_default()
        .as_secs() as i64
}
