//! Blocking bodies of the store's write transactions. Every function here runs inside one
//! `BEGIN IMMEDIATE` transaction opened by `db::write_tx`.

use std::collections::BTreeSet;

use diesel::prelude::*;
use diesel::sqlite::SqliteConnection;

use super::model::{
    ReminderField, ReminderFields, ReminderId, ReminderPatch, RemoteId, RemoteReminder,
    SyncStatus, REMINDERS_TABLE,
};
use super::schema::{pending_deletions, reminder_dirty_fields, reminders};
use super::{count_column, map_row, NewReminderRow, PullOutcome, PushCompletion, ReminderRow};
use crate::reminders::notification_fsm::NotificationState;

pub(super) fn load(conn: &mut SqliteConnection, id: ReminderId) -> QueryResult<Option<ReminderRow>> {
    reminders::table
        .filter(reminders::id.eq(id))
        .first::<ReminderRow>(conn)
        .optional()
}

pub(super) fn insert_reminder(
    conn: &mut SqliteConnection,
    row: &NewReminderRow,
) -> QueryResult<ReminderRow> {
    diesel::insert_into(reminders::table)
        .values(row)
        .execute(conn)?;
    reminders::table
        .order(reminders::id.desc())
        .first::<ReminderRow>(conn)
}

fn write_fields(
    conn: &mut SqliteConnection,
    id: ReminderId,
    fields: &ReminderFields,
    status: SyncStatus,
    now: i64,
) -> QueryResult<usize> {
    diesel::update(reminders::table.filter(reminders::id.eq(id)))
        .set((
            reminders::chat_id.eq(fields.chat_id.clone()),
            reminders::owner.eq(fields.owner.clone()),
            reminders::title.eq(fields.title.clone()),
            reminders::description.eq(fields.description.clone()),
            reminders::scheduled_at.eq(fields.scheduled_at),
            reminders::created_at.eq(fields.created_at),
            reminders::notified.eq(fields.notified),
            reminders::constant_notify.eq(fields.constant_notify),
            reminders::notify_stopped.eq(fields.notify_stopped),
            reminders::repeat.eq(fields.repeat),
            reminders::repeat_unit.eq(fields.repeat_unit.map(|unit| unit.as_str().to_string())),
            reminders::repeat_count.eq(fields.repeat_count.map(count_column)),
            reminders::recurrence_created.eq(fields.recurrence_created),
            reminders::sync_status.eq(status.as_str()),
            reminders::last_updated.eq(now),
        ))
        .execute(conn)
}

fn set_status(conn: &mut SqliteConnection, id: ReminderId, status: SyncStatus) -> QueryResult<usize> {
    diesel::update(reminders::table.filter(reminders::id.eq(id)))
        .set(reminders::sync_status.eq(status.as_str()))
        .execute(conn)
}

fn mark_dirty(
    conn: &mut SqliteConnection,
    id: ReminderId,
    fields: &BTreeSet<ReminderField>,
) -> QueryResult<()> {
    for field in fields {
        diesel::insert_or_ignore_into(reminder_dirty_fields::table)
            .values((
                reminder_dirty_fields::reminder_id.eq(id),
                reminder_dirty_fields::field.eq(field.as_str()),
            ))
            .execute(conn)?;
    }
    Ok(())
}

fn clear_dirty(conn: &mut SqliteConnection, ids: &[ReminderId]) -> QueryResult<usize> {
    diesel::delete(
        reminder_dirty_fields::table.filter(reminder_dirty_fields::reminder_id.eq_any(ids)),
    )
    .execute(conn)
}

fn insert_tombstone(
    conn: &mut SqliteConnection,
    local_id: ReminderId,
    remote_id: RemoteId,
    now: i64,
) -> QueryResult<usize> {
    diesel::insert_into(pending_deletions::table)
        .values((
            pending_deletions::table_name.eq(REMINDERS_TABLE),
            pending_deletions::local_id.eq(local_id),
            pending_deletions::remote_id.eq(Some(remote_id)),
            pending_deletions::deleted_at.eq(now),
        ))
        .execute(conn)
}

/// Writes `after` over the row, moves the sync status and records the dirty fields. Returns the
/// fields that actually changed; an empty set means nothing was written.
fn write_local_edit(
    conn: &mut SqliteConnection,
    current: &super::Reminder,
    after: &ReminderFields,
    now: i64,
) -> QueryResult<BTreeSet<ReminderField>> {
    let changed = current.fields().changed_fields(after);
    if changed.is_empty() {
        return Ok(changed);
    }
    let status = current
        .sync_status
        .after_local_edit(current.remote_id.is_some());
    write_fields(conn, current.id, after, status, now)?;
    mark_dirty(conn, current.id, &changed)?;
    Ok(changed)
}

pub(super) fn apply_patch(
    conn: &mut SqliteConnection,
    id: ReminderId,
    patch: &ReminderPatch,
    now: i64,
) -> QueryResult<bool> {
    let Some(row) = load(conn, id)? else {
        return Ok(false);
    };
    let current = map_row(row);
    let mut after = current.fields();
    patch.apply(&mut after);
    write_local_edit(conn, &current, &after, now)?;
    Ok(true)
}

pub(super) fn raise_flag(
    conn: &mut SqliteConnection,
    id: ReminderId,
    field: ReminderField,
    now: i64,
) -> QueryResult<bool> {
    let Some(row) = load(conn, id)? else {
        return Ok(false);
    };
    let current = map_row(row);
    let mut after = current.fields();
    match field {
        ReminderField::Notified => after.notified = true,
        ReminderField::NotifyStopped => after.notify_stopped = true,
        ReminderField::RecurrenceCreated => after.recurrence_created = true,
        _ => return Ok(true),
    }
    write_local_edit(conn, &current, &after, now)?;
    Ok(true)
}

pub(super) fn delete_with_tombstone(
    conn: &mut SqliteConnection,
    id: ReminderId,
    now: i64,
) -> QueryResult<bool> {
    let Some(row) = load(conn, id)? else {
        return Ok(false);
    };
    diesel::delete(reminders::table.filter(reminders::id.eq(id))).execute(conn)?;
    clear_dirty(conn, &[id])?;
    if let Some(remote_id) = row.remote_id {
        insert_tombstone(conn, id, remote_id, now)?;
    }
    Ok(true)
}

pub(super) fn spawn_recurrence(
    conn: &mut SqliteConnection,
    id: ReminderId,
    next_at: i64,
    now: i64,
) -> QueryResult<Option<ReminderRow>> {
    let Some(row) = load(conn, id)? else {
        return Ok(None);
    };
    let parent = map_row(row);
    if !parent.repeat || parent.recurrence_created {
        return Ok(None);
    }

    let mut child_fields = parent.fields();
    child_fields.scheduled_at = Some(next_at);
    child_fields.created_at = now;
    child_fields.notified = false;
    child_fields.notify_stopped = false;
    child_fields.recurrence_created = false;
    let child = insert_reminder(
        conn,
        &NewReminderRow::from_fields(&child_fields, None, SyncStatus::Pending, now),
    )?;

    let mut parent_after = parent.fields();
    parent_after.recurrence_created = true;
    write_local_edit(conn, &parent, &parent_after, now)?;
    Ok(Some(child))
}

pub(super) fn stop_constant(
    conn: &mut SqliteConnection,
    chat_id: &str,
    now: i64,
) -> QueryResult<Vec<ReminderId>> {
    let rows: Vec<ReminderRow> = reminders::table
        .filter(reminders::chat_id.eq(chat_id))
        .filter(reminders::constant_notify.eq(true))
        .filter(reminders::notify_stopped.eq(false))
        .filter(reminders::notified.eq(true))
        .load(conn)?;

    let mut stopped = Vec::with_capacity(rows.len());
    for row in rows {
        let current = map_row(row);
        let mut after = current.fields();
        after.notify_stopped = true;
        write_local_edit(conn, &current, &after, now)?;
        stopped.push(current.id);
    }
    Ok(stopped)
}

pub(super) fn complete_push(
    conn: &mut SqliteConnection,
    id: ReminderId,
    snapshot: &ReminderFields,
    remote_id: RemoteId,
    now: i64,
) -> QueryResult<PushCompletion> {
    let Some(row) = load(conn, id)? else {
        // Deleted locally while the request was in flight: queue the remote copy for deletion.
        let queued: i64 = pending_deletions::table
            .filter(pending_deletions::remote_id.eq(Some(remote_id)))
            .count()
            .get_result(conn)?;
        if queued == 0 {
            insert_tombstone(conn, id, remote_id, now)?;
        }
        return Ok(PushCompletion::Orphaned);
    };
    let current = map_row(row);
    if current.remote_id.is_none() {
        diesel::update(reminders::table.filter(reminders::id.eq(id)))
            .set(reminders::remote_id.eq(Some(remote_id)))
            .execute(conn)?;
    }

    clear_dirty(conn, &[id])?;
    let changed = snapshot.changed_fields(&current.fields());
    if changed.is_empty() {
        set_status(conn, id, SyncStatus::Synced)?;
        Ok(PushCompletion::Synced)
    } else {
        set_status(conn, id, SyncStatus::PendingUpdate)?;
        mark_dirty(conn, id, &changed)?;
        Ok(PushCompletion::StillDirty(changed))
    }
}

pub(super) fn mark_failed(conn: &mut SqliteConnection, id: ReminderId) -> QueryResult<bool> {
    Ok(set_status(conn, id, SyncStatus::Failed)? > 0)
}

pub(super) fn remove_pending_deletion(conn: &mut SqliteConnection, id: i32) -> QueryResult<bool> {
    diesel::delete(pending_deletions::table.filter(pending_deletions::id.eq(id)))
        .execute(conn)
        .map(|deleted| deleted > 0)
}

pub(super) fn apply_remote(
    conn: &mut SqliteConnection,
    remote: &RemoteReminder,
    now: i64,
) -> QueryResult<PullOutcome> {
    let existing = reminders::table
        .filter(reminders::remote_id.eq(Some(remote.id)))
        .first::<ReminderRow>(conn)
        .optional()?;

    if let Some(row) = existing {
        let local = map_row(row);
        if local.sync_status != SyncStatus::Synced {
            return Ok(PullOutcome::SkippedLocalPending(local.id));
        }
        let current = local.fields();
        let merged = current.merged_with_remote(&remote.fields);
        if merged == current {
            return Ok(PullOutcome::Unchanged(local.id));
        }
        write_fields(conn, local.id, &merged, SyncStatus::Synced, now)?;
        return Ok(PullOutcome::Merged(local.id));
    }

    let tombstones: i64 = pending_deletions::table
        .filter(pending_deletions::remote_id.eq(Some(remote.id)))
        .count()
        .get_result(conn)?;
    if tombstones > 0 {
        return Ok(PullOutcome::SkippedDeleted);
    }

    let inserted = insert_reminder(
        conn,
        &NewReminderRow::from_fields(&remote.fields, Some(remote.id), SyncStatus::Synced, now),
    )?;
    Ok(PullOutcome::Inserted(inserted.id))
}

pub(super) fn delete_local_batch(
    conn: &mut SqliteConnection,
    ids: &[ReminderId],
) -> QueryResult<usize> {
    let deleted = diesel::delete(reminders::table.filter(reminders::id.eq_any(ids))).execute(conn)?;
    clear_dirty(conn, ids)?;
    Ok(deleted)
}

pub(super) fn purge_finalized(conn: &mut SqliteConnection, cutoff: i64) -> QueryResult<usize> {
    let candidates: Vec<ReminderRow> = reminders::table
        .filter(reminders::sync_status.eq(SyncStatus::Synced.as_str()))
        .filter(reminders::last_updated.lt(cutoff))
        .load(conn)?;

    let ids: Vec<ReminderId> = candidates
        .into_iter()
        .map(map_row)
        .filter(|reminder| NotificationState::of(reminder).is_terminal())
        .filter(|reminder| !reminder.repeat || reminder.recurrence_created)
        .map(|reminder| reminder.id)
        .collect();
    if ids.is_empty() {
        return Ok(0);
    }
    delete_local_batch(conn, &ids)
}

pub(super) fn retry_failed(conn: &mut SqliteConnection) -> QueryResult<usize> {
    let never_created = diesel::update(
        reminders::table
            .filter(reminders::sync_status.eq(SyncStatus::Failed.as_str()))
            .filter(reminders::remote_id.is_null()),
    )
    .set(reminders::sync_status.eq(SyncStatus::Pending.as_str()))
    .execute(conn)?;
    let rejected_updates = diesel::update(
        reminders::table
            .filter(reminders::sync_status.eq(SyncStatus::Failed.as_str()))
            .filter(reminders::remote_id.is_not_null()),
    )
    .set(reminders::sync_status.eq(SyncStatus::PendingUpdate.as_str()))
    .execute(conn)?;
    Ok(never_created + rejected_updates)
}
