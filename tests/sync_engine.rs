use std::collections::BTreeSet;
use std::sync::Arc;
use std::time::Duration;

use httpmock::Method::GET;
use httpmock::MockServer;
use serde_json::json;
use tempfile::tempdir;

use reminder_sync::reminders::{
    now_ts, NewReminder, PullOutcome, ReminderField, ReminderFields, ReminderPatch,
    ReminderStore, RemoteReminder, SyncStatus,
};
use reminder_sync::remote::{
    InMemoryRemoteStore, InjectedFailure, RemoteFilter, RemoteOp, RemoteStore, RemoteUpdate,
    RestRemoteStore,
};
use reminder_sync::sync::{SyncEngine, ZombieReconciler};

async fn setup(dir: &tempfile::TempDir) -> (Arc<ReminderStore>, Arc<InMemoryRemoteStore>, SyncEngine) {
    let db_path = dir.path().join("sync.db");
    let store = Arc::new(ReminderStore::new(db_path.to_string_lossy()).await.unwrap());
    let remote = Arc::new(InMemoryRemoteStore::new());
    let engine = SyncEngine::new(store.clone(), remote.clone());
    (store, remote, engine)
}

fn future_reminder(title: &str) -> NewReminder {
    NewReminder::new("chat-1", "ana", title).scheduled_at(now_ts() + 3_600)
}

fn remote_fields(title: &str, scheduled_at: i64) -> ReminderFields {
    ReminderFields {
        chat_id: "chat-1".to_string(),
        owner: "ana".to_string(),
        title: title.to_string(),
        description: None,
        scheduled_at: Some(scheduled_at),
        created_at: now_ts() - 120,
        notified: false,
        constant_notify: false,
        notify_stopped: false,
        repeat: false,
        repeat_unit: None,
        repeat_count: None,
        recurrence_created: false,
    }
}

#[tokio::test]
async fn push_creates_once_and_links_remote_id() {
    let dir = tempdir().unwrap();
    let (store, remote, engine) = setup(&dir).await;
    let local = store.create(&future_reminder("Dentist")).await.unwrap();

    let first = engine.run_cycle().await.unwrap();
    assert_eq!(first.push.creates.succeeded, 1);
    let second = engine.run_cycle().await.unwrap();
    assert_eq!(second.push.creates.attempted, 0);

    assert_eq!(remote.calls(RemoteOp::Create).await, 1);
    assert_eq!(remote.len().await, 1);
    let synced = store.get(local.id).await.unwrap().unwrap();
    assert_eq!(synced.sync_status, SyncStatus::Synced);
    let remote_id = synced.remote_id.unwrap();
    assert_eq!(remote.get(remote_id).await.unwrap().title, "Dentist");
}

#[tokio::test]
async fn outage_leaves_rows_pending_for_the_next_cycle() {
    let dir = tempdir().unwrap();
    let (store, remote, engine) = setup(&dir).await;
    let local = store.create(&future_reminder("Renew passport")).await.unwrap();

    remote
        .set_failure(RemoteOp::Create, Some(InjectedFailure::Unavailable))
        .await;
    let report = engine.push_pending().await.unwrap();
    assert_eq!(report.creates.failed, 1);
    assert_eq!(report.rejected, 0);
    let row = store.get(local.id).await.unwrap().unwrap();
    assert_eq!(row.sync_status, SyncStatus::Pending);
    assert!(row.remote_id.is_none());

    remote.set_failure(RemoteOp::Create, None).await;
    engine.push_pending().await.unwrap();
    let row = store.get(local.id).await.unwrap().unwrap();
    assert_eq!(row.sync_status, SyncStatus::Synced);
    assert!(row.remote_id.is_some());
}

#[tokio::test]
async fn rejected_rows_are_marked_failed_and_can_be_retried() {
    let dir = tempdir().unwrap();
    let (store, remote, engine) = setup(&dir).await;
    let local = store.create(&future_reminder("Bad row")).await.unwrap();

    remote
        .set_failure(RemoteOp::Create, Some(InjectedFailure::Rejected))
        .await;
    let report = engine.push_pending().await.unwrap();
    assert_eq!(report.rejected, 1);
    assert_eq!(
        store.get(local.id).await.unwrap().unwrap().sync_status,
        SyncStatus::Failed
    );

    // Failed rows stay out of later pushes.
    remote.set_failure(RemoteOp::Create, None).await;
    engine.push_pending().await.unwrap();
    assert_eq!(remote.calls(RemoteOp::Create).await, 1);

    assert_eq!(store.retry_failed().await.unwrap(), 1);
    engine.push_pending().await.unwrap();
    assert_eq!(
        store.get(local.id).await.unwrap().unwrap().sync_status,
        SyncStatus::Synced
    );
}

#[tokio::test]
async fn updates_send_only_changed_fields() {
    let dir = tempdir().unwrap();
    let (store, remote, engine) = setup(&dir).await;
    let local = store.create(&future_reminder("Gym")).await.unwrap();
    engine.run_cycle().await.unwrap();
    let remote_id = store.get(local.id).await.unwrap().unwrap().remote_id.unwrap();

    // Another client edits the description while we change the title.
    let mut theirs = remote.get(remote_id).await.unwrap();
    theirs.description = Some("bring towel".to_string());
    remote
        .update(
            remote_id,
            &RemoteUpdate::from_dirty(theirs, BTreeSet::from([ReminderField::Description])),
        )
        .await
        .unwrap();

    store
        .update(
            local.id,
            ReminderPatch {
                title: Some("Gym (legs)".to_string()),
                ..ReminderPatch::default()
            },
        )
        .await
        .unwrap();
    assert_eq!(
        store.dirty_fields(local.id).await.unwrap(),
        BTreeSet::from([ReminderField::Title])
    );
    assert_eq!(
        store.get(local.id).await.unwrap().unwrap().sync_status,
        SyncStatus::PendingUpdate
    );

    let report = engine.push_pending().await.unwrap();
    assert_eq!(report.updates.succeeded, 1);
    let merged = remote.get(remote_id).await.unwrap();
    assert_eq!(merged.title, "Gym (legs)");
    assert_eq!(merged.description.as_deref(), Some("bring towel"));
    assert!(store.dirty_fields(local.id).await.unwrap().is_empty());
}

#[tokio::test]
async fn pull_inserts_remote_rows_and_keeps_local_monotonic_flags() {
    let dir = tempdir().unwrap();
    let (store, remote, engine) = setup(&dir).await;
    let local = store.create(&future_reminder("Standup")).await.unwrap();
    engine.run_cycle().await.unwrap();
    let remote_id = store.get(local.id).await.unwrap().unwrap().remote_id.unwrap();

    store.mark_notified(local.id).await.unwrap();
    engine.push_pending().await.unwrap();
    assert!(remote.get(remote_id).await.unwrap().notified);

    // A stale remote copy must not un-notify the local row.
    let mut stale = store.get(local.id).await.unwrap().unwrap().fields();
    stale.notified = false;
    stale.title = "Standup (moved)".to_string();
    let outcome = store
        .apply_remote(RemoteReminder {
            id: remote_id,
            fields: stale,
        })
        .await
        .unwrap();
    assert_eq!(outcome, PullOutcome::Merged(local.id));
    let merged = store.get(local.id).await.unwrap().unwrap();
    assert!(merged.notified);
    assert_eq!(merged.title, "Standup (moved)");

    let mut other = merged.fields();
    other.title = "From phone".to_string();
    other.notified = false;
    remote.seed(other).await;
    let report = engine.pull_remote().await.unwrap();
    assert_eq!(report.inserted, 1);
    assert_eq!(store.list_by_chat("chat-1").await.unwrap().len(), 2);
}

#[tokio::test]
async fn pull_never_overwrites_pending_local_changes() {
    let dir = tempdir().unwrap();
    let (store, remote, engine) = setup(&dir).await;
    let local = store.create(&future_reminder("Call mom")).await.unwrap();
    engine.run_cycle().await.unwrap();
    let remote_id = store.get(local.id).await.unwrap().unwrap().remote_id.unwrap();

    store
        .update(
            local.id,
            ReminderPatch {
                title: Some("Call mom tonight".to_string()),
                ..ReminderPatch::default()
            },
        )
        .await
        .unwrap();

    remote
        .set_failure(RemoteOp::Update, Some(InjectedFailure::Unavailable))
        .await;
    let report = engine.run_cycle().await.unwrap();
    assert_eq!(report.push.updates.failed, 1);
    assert_eq!(report.pull.skipped_pending, 1);
    assert_eq!(
        store.get(local.id).await.unwrap().unwrap().title,
        "Call mom tonight"
    );
    assert_eq!(remote.get(remote_id).await.unwrap().title, "Call mom");

    remote.set_failure(RemoteOp::Update, None).await;
    engine.run_cycle().await.unwrap();
    assert_eq!(
        remote.get(remote_id).await.unwrap().title,
        "Call mom tonight"
    );
    assert_eq!(
        store.get(local.id).await.unwrap().unwrap().sync_status,
        SyncStatus::Synced
    );
}

#[tokio::test]
async fn deletions_reach_the_remote_and_are_not_resurrected() {
    let dir = tempdir().unwrap();
    let (store, remote, engine) = setup(&dir).await;
    let local = store.create(&future_reminder("Old task")).await.unwrap();
    engine.run_cycle().await.unwrap();
    let remote_id = store.get(local.id).await.unwrap().unwrap().remote_id.unwrap();

    remote
        .set_failure(RemoteOp::Delete, Some(InjectedFailure::Unavailable))
        .await;
    assert!(store.delete(local.id).await.unwrap());
    let report = engine.run_cycle().await.unwrap();
    assert_eq!(report.push.deletes.failed, 1);
    assert_eq!(report.pull.skipped_deleted, 1);
    assert!(store.find_by_remote_id(remote_id).await.unwrap().is_none());
    assert_eq!(store.list_pending_deletions().await.unwrap().len(), 1);

    remote.set_failure(RemoteOp::Delete, None).await;
    engine.run_cycle().await.unwrap();
    assert!(remote.get(remote_id).await.is_none());
    assert!(store.list_pending_deletions().await.unwrap().is_empty());
}

#[tokio::test]
async fn deleting_an_unsynced_row_never_calls_the_remote() {
    let dir = tempdir().unwrap();
    let (store, remote, engine) = setup(&dir).await;
    let local = store.create(&future_reminder("Draft")).await.unwrap();
    store.delete(local.id).await.unwrap();

    engine.run_cycle().await.unwrap();
    assert_eq!(remote.calls(RemoteOp::Create).await, 0);
    assert_eq!(remote.calls(RemoteOp::Delete).await, 0);
    assert!(remote.is_empty().await);
}

#[tokio::test]
async fn pull_window_ignores_old_and_finalized_rows() {
    let dir = tempdir().unwrap();
    let (store, remote, engine) = setup(&dir).await;
    let engine = engine.with_pull_window(86_400);

    let recent = remote_fields("Recent", now_ts() - 60);
    remote.seed(recent.clone()).await;

    let mut ancient = recent.clone();
    ancient.title = "Ancient".to_string();
    ancient.scheduled_at = Some(now_ts() - 10 * 86_400);
    remote.seed(ancient).await;

    let mut done = recent.clone();
    done.title = "Done".to_string();
    done.notified = true;
    remote.seed(done).await;

    let report = engine.pull_remote().await.unwrap();
    assert_eq!(report.inserted, 1);
    let titles: Vec<_> = store
        .list_by_chat("chat-1")
        .await
        .unwrap()
        .into_iter()
        .map(|reminder| reminder.title)
        .collect();
    assert_eq!(titles, vec!["Recent".to_string()]);

    let all = engine.pull_matching(RemoteFilter::everything()).await.unwrap();
    assert_eq!(all.inserted, 2);
}

#[tokio::test]
async fn zombie_sweep_removes_rows_deleted_remotely() {
    let dir = tempdir().unwrap();
    let (store, remote, engine) = setup(&dir).await;
    let kept = store.create(&future_reminder("Kept")).await.unwrap();
    let gone = store.create(&future_reminder("Gone")).await.unwrap();
    engine.push_pending().await.unwrap();
    let unsynced = store.create(&future_reminder("Local only")).await.unwrap();

    let gone_remote = store.get(gone.id).await.unwrap().unwrap().remote_id.unwrap();
    assert!(remote.remove(gone_remote).await);

    let reconciler = ZombieReconciler::new(store.clone(), remote.clone(), engine.cycle_lock())
        .with_batch_size(1);
    let report = reconciler.sweep().await.unwrap();
    assert_eq!(report.zombies, 1);
    assert_eq!(report.deleted, 1);
    assert!(store.get(gone.id).await.unwrap().is_none());
    assert!(store.get(kept.id).await.unwrap().is_some());
    assert!(store.get(unsynced.id).await.unwrap().is_some());
}

#[tokio::test]
async fn zombie_sweep_aborts_when_listing_fails() {
    let dir = tempdir().unwrap();
    let (store, remote, engine) = setup(&dir).await;
    let local = store.create(&future_reminder("Kept")).await.unwrap();
    engine.push_pending().await.unwrap();

    remote
        .set_failure(RemoteOp::ListAllIds, Some(InjectedFailure::Unavailable))
        .await;
    let reconciler = ZombieReconciler::new(store.clone(), remote.clone(), engine.cycle_lock());
    assert!(reconciler.sweep().await.is_err());
    assert!(store.get(local.id).await.unwrap().is_some());
}

#[tokio::test]
async fn one_rejected_create_does_not_hold_back_the_batch() {
    let dir = tempdir().unwrap();
    let (store, remote, engine) = setup(&dir).await;
    let first = store.create(&future_reminder("Groceries")).await.unwrap();
    let poison = store.create(&future_reminder("Poison")).await.unwrap();
    let last = store.create(&future_reminder("Laundry")).await.unwrap();

    remote
        .set_title_failure("Poison", Some(InjectedFailure::Rejected))
        .await;
    let report = engine.push_pending().await.unwrap();
    assert_eq!(report.creates.attempted, 3);
    assert_eq!(report.creates.succeeded, 2);
    assert_eq!(report.rejected, 1);

    for id in [first.id, last.id] {
        let row = store.get(id).await.unwrap().unwrap();
        assert_eq!(row.sync_status, SyncStatus::Synced);
        assert!(row.remote_id.is_some());
    }
    let row = store.get(poison.id).await.unwrap().unwrap();
    assert_eq!(row.sync_status, SyncStatus::Failed);
    assert!(row.remote_id.is_none());
    assert_eq!(remote.len().await, 2);
}

#[tokio::test]
async fn one_failed_update_leaves_the_others_synced() {
    let dir = tempdir().unwrap();
    let (store, remote, engine) = setup(&dir).await;
    let stuck = store.create(&future_reminder("Stuck")).await.unwrap();
    let fine = store.create(&future_reminder("Fine")).await.unwrap();
    engine.push_pending().await.unwrap();
    let stuck_remote = store.get(stuck.id).await.unwrap().unwrap().remote_id.unwrap();
    let fine_remote = store.get(fine.id).await.unwrap().unwrap().remote_id.unwrap();

    for id in [stuck.id, fine.id] {
        store
            .update(
                id,
                ReminderPatch {
                    description: Some(Some("edited".to_string())),
                    ..ReminderPatch::default()
                },
            )
            .await
            .unwrap();
    }
    remote
        .set_row_failure(stuck_remote, Some(InjectedFailure::Unavailable))
        .await;

    let report = engine.push_pending().await.unwrap();
    assert_eq!(report.updates.succeeded, 1);
    assert_eq!(report.updates.failed, 1);
    assert_eq!(
        store.get(stuck.id).await.unwrap().unwrap().sync_status,
        SyncStatus::PendingUpdate
    );
    assert_eq!(
        store.get(fine.id).await.unwrap().unwrap().sync_status,
        SyncStatus::Synced
    );
    assert_eq!(
        remote.get(fine_remote).await.unwrap().description.as_deref(),
        Some("edited")
    );
    assert!(remote.get(stuck_remote).await.unwrap().description.is_none());
}

#[tokio::test]
async fn one_failed_delete_stays_queued_while_the_others_clear() {
    let dir = tempdir().unwrap();
    let (store, remote, engine) = setup(&dir).await;
    let stuck = store.create(&future_reminder("Stuck")).await.unwrap();
    let gone = store.create(&future_reminder("Gone")).await.unwrap();
    engine.push_pending().await.unwrap();
    let stuck_remote = store.get(stuck.id).await.unwrap().unwrap().remote_id.unwrap();
    let gone_remote = store.get(gone.id).await.unwrap().unwrap().remote_id.unwrap();

    store.delete(stuck.id).await.unwrap();
    store.delete(gone.id).await.unwrap();
    remote
        .set_row_failure(stuck_remote, Some(InjectedFailure::Unavailable))
        .await;

    let report = engine.push_pending().await.unwrap();
    assert_eq!(report.deletes.succeeded, 1);
    assert_eq!(report.deletes.failed, 1);
    assert!(remote.get(gone_remote).await.is_none());
    assert!(remote.get(stuck_remote).await.is_some());
    let queued = store.list_pending_deletions().await.unwrap();
    assert_eq!(queued.len(), 1);
    assert_eq!(queued[0].remote_id, Some(stuck_remote));
}

#[tokio::test]
async fn second_zombie_sweep_finds_nothing() {
    let dir = tempdir().unwrap();
    let (store, remote, engine) = setup(&dir).await;
    let kept = store.create(&future_reminder("Kept")).await.unwrap();
    let gone = store.create(&future_reminder("Gone")).await.unwrap();
    engine.push_pending().await.unwrap();
    let gone_remote = store.get(gone.id).await.unwrap().unwrap().remote_id.unwrap();
    remote.remove(gone_remote).await;

    let reconciler = ZombieReconciler::new(store.clone(), remote.clone(), engine.cycle_lock());
    assert_eq!(reconciler.sweep().await.unwrap().deleted, 1);

    let again = reconciler.sweep().await.unwrap();
    assert_eq!(again.zombies, 0);
    assert_eq!(again.deleted, 0);
    assert_eq!(again.linked_locally, 1);
    assert!(store.get(kept.id).await.unwrap().is_some());
}

#[tokio::test]
async fn malformed_remote_rows_do_not_block_the_pull() {
    let dir = tempdir().unwrap();
    let db_path = dir.path().join("rest.db");
    let store = Arc::new(ReminderStore::new(db_path.to_string_lossy()).await.unwrap());
    let server = MockServer::start_async().await;
    server
        .mock_async(|when, then| {
            when.method(GET)
                .path("/rest/v1/reminders")
                .query_param("select", "*");
            then.status(200).json_body(json!([
                {"id": 1, "chat_id": "c1", "owner": "ana", "title": "good",
                 "created_at": "2025-01-01T10:00:00Z"},
                {"id": 2, "chat_id": "c1", "owner": "ana", "title": "bad",
                 "created_at": "2025-01-01T10:00:00Z", "repeat": true,
                 "repeat_unit": "fortnight", "repeat_count": 1}
            ]));
        })
        .await;
    let remote = Arc::new(
        RestRemoteStore::new(&server.base_url(), "reminders", None, Duration::from_secs(5), 50)
            .unwrap(),
    );
    let engine = SyncEngine::new(store.clone(), remote).with_page_size(50);

    let report = engine.pull_remote().await.unwrap();
    assert_eq!(report.fetched, 2);
    assert_eq!(report.inserted, 1);
    assert_eq!(report.failed, 1);
    let local = store.find_by_remote_id(1).await.unwrap().unwrap();
    assert_eq!(local.title, "good");
    assert!(store.find_by_remote_id(2).await.unwrap().is_none());
}
