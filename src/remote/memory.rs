use std::collections::{BTreeMap, HashMap, HashSet};

use async_trait::async_trait;
use tokio::sync::Mutex;

use super::{Page, RemoteFilter, RemoteStore, RemoteUpdate};
use crate::error::{ReminderSyncError, Result};
use crate::reminders::{ReminderFields, RemoteId, RemoteReminder};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum RemoteOp {
    Create,
    Update,
    Delete,
    ListPending,
    ListAllIds,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum InjectedFailure {
    Unavailable,
    Rejected,
}

#[derive(Default)]
struct RemoteState {
    rows: BTreeMap<RemoteId, ReminderFields>,
    next_id: RemoteId,
    failures: HashMap<RemoteOp, InjectedFailure>,
    title_failures: HashMap<String, InjectedFailure>,
    row_failures: HashMap<RemoteId, InjectedFailure>,
    calls: HashMap<RemoteOp, usize>,
}

/// Process-local remote store for tests. Failures can be injected per operation or per record.
#[derive(Default)]
pub struct InMemoryRemoteStore {
    state: Mutex<RemoteState>,
}

impl InMemoryRemoteStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Makes every later call of `op` fail until cleared with `None`.
    pub async fn set_failure(&self, op: RemoteOp, failure: Option<InjectedFailure>) {
        let mut state = self.state.lock().await;
        match failure {
            Some(failure) => {
                state.failures.insert(op, failure);
            }
            None => {
                state.failures.remove(&op);
            }
        }
    }

    /// Fails creates of rows with this title.
    pub async fn set_title_failure(&self, title: &str, failure: Option<InjectedFailure>) {
        let mut state = self.state.lock().await;
        match failure {
            Some(failure) => {
                state.title_failures.insert(title.to_string(), failure);
            }
            None => {
                state.title_failures.remove(title);
            }
        }
    }

    /// Fails updates and deletes of one remote row.
    pub async fn set_row_failure(&self, remote_id: RemoteId, failure: Option<InjectedFailure>) {
        let mut state = self.state.lock().await;
        match failure {
            Some(failure) => {
                state.row_failures.insert(remote_id, failure);
            }
            None => {
                state.row_failures.remove(&remote_id);
            }
        }
    }

    pub async fn calls(&self, op: RemoteOp) -> usize {
        self.state.lock().await.calls.get(&op).copied().unwrap_or(0)
    }

    /// Inserts a row as if another client had written it.
    pub async fn seed(&self, fields: ReminderFields) -> RemoteId {
        let mut state = self.state.lock().await;
        insert_row(&mut state, fields)
    }

    /// Removes a row behind the engine's back.
    pub async fn remove(&self, remote_id: RemoteId) -> bool {
        self.state.lock().await.rows.remove(&remote_id).is_some()
    }

    pub async fn get(&self, remote_id: RemoteId) -> Option<ReminderFields> {
        self.state.lock().await.rows.get(&remote_id).cloned()
    }

    pub async fn len(&self) -> usize {
        self.state.lock().await.rows.len()
    }

    pub async fn is_empty(&self) -> bool {
        self.len().await == 0
    }
}

fn insert_row(state: &mut RemoteState, fields: ReminderFields) -> RemoteId {
    state.next_id += 1;
    let id = state.next_id;
    state.rows.insert(id, fields);
    id
}

fn enter(state: &mut RemoteState, op: RemoteOp) -> Result<()> {
    *state.calls.entry(op).or_insert(0) += 1;
    injected(state.failures.get(&op), &format!("{op:?}"))
}

fn injected(failure: Option<&InjectedFailure>, what: &str) -> Result<()> {
    match failure {
        Some(InjectedFailure::Unavailable) => Err(ReminderSyncError::RemoteUnavailable(format!(
            "injected {what} outage"
        ))),
        Some(InjectedFailure::Rejected) => Err(ReminderSyncError::RemoteRejected(format!(
            "injected {what} rejection"
        ))),
        None => Ok(()),
    }
}

#[async_trait]
impl RemoteStore for InMemoryRemoteStore {
    async fn create(&self, fields: &ReminderFields) -> Result<RemoteId> {
        let mut state = self.state.lock().await;
        enter(&mut state, RemoteOp::Create)?;
        injected(
            state.title_failures.get(&fields.title),
            &format!("create of {:?}", fields.title),
        )?;
        Ok(insert_row(&mut state, fields.clone()))
    }

    async fn update(&self, remote_id: RemoteId, update: &RemoteUpdate) -> Result<()> {
        let mut state = self.state.lock().await;
        enter(&mut state, RemoteOp::Update)?;
        injected(
            state.row_failures.get(&remote_id),
            &format!("update of row {remote_id}"),
        )?;
        let row = state.rows.get_mut(&remote_id).ok_or_else(|| {
            ReminderSyncError::RemoteRejected(format!("remote row {remote_id} does not exist"))
        })?;
        update.apply_to(row);
        Ok(())
    }

    async fn delete(&self, remote_id: RemoteId) -> Result<()> {
        let mut state = self.state.lock().await;
        enter(&mut state, RemoteOp::Delete)?;
        injected(
            state.row_failures.get(&remote_id),
            &format!("delete of row {remote_id}"),
        )?;
        state.rows.remove(&remote_id);
        Ok(())
    }

    async fn list_pending(
        &self,
        filter: &RemoteFilter,
        page: Page,
    ) -> Result<Vec<Result<RemoteReminder>>> {
        let mut state = self.state.lock().await;
        enter(&mut state, RemoteOp::ListPending)?;
        Ok(state
            .rows
            .iter()
            .filter(|(_, fields)| filter.matches(fields))
            .skip(page.offset)
            .take(page.limit)
            .map(|(id, fields)| {
                Ok(RemoteReminder {
                    id: *id,
                    fields: fields.clone(),
                })
            })
            .collect())
    }

    async fn list_all_ids(&self) -> Result<HashSet<RemoteId>> {
        let mut state = self.state.lock().await;
        enter(&mut state, RemoteOp::ListAllIds)?;
        Ok(state.rows.keys().copied().collect())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn fields(title: &str) -> ReminderFields {
        ReminderFields {
            chat_id: "c1".to_string(),
            owner: "ana".to_string(),
            title: title.to_string(),
            description: None,
            scheduled_at: None,
            created_at: 0,
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
    async fn injected_failures_surface_as_taxonomy_errors() {
        let remote = InMemoryRemoteStore::new();
        remote
            .set_failure(RemoteOp::Create, Some(InjectedFailure::Unavailable))
            .await;
        let err = remote.create(&fields("a")).await.expect_err("outage");
        assert!(err.is_transient());

        remote
            .set_failure(RemoteOp::Create, Some(InjectedFailure::Rejected))
            .await;
        let err = remote.create(&fields("a")).await.expect_err("rejection");
        assert!(err.is_rejection());

        remote.set_failure(RemoteOp::Create, None).await;
        let id = remote.create(&fields("a")).await.expect("create");
        assert_eq!(remote.calls(RemoteOp::Create).await, 3);
        assert_eq!(remote.get(id).await.map(|row| row.title), Some("a".to_string()));
    }

    #[tokio::test]
    async fn record_failures_only_hit_their_record() {
        let remote = InMemoryRemoteStore::new();
        remote
            .set_title_failure("poison", Some(InjectedFailure::Rejected))
            .await;
        assert!(remote.create(&fields("poison")).await.expect_err("poisoned").is_rejection());
        let id = remote.create(&fields("fine")).await.expect("create");

        remote
            .set_row_failure(id, Some(InjectedFailure::Unavailable))
            .await;
        assert!(remote.delete(id).await.expect_err("row outage").is_transient());
        remote.set_row_failure(id, None).await;
        remote.delete(id).await.expect("delete");
        assert!(remote.is_empty().await);
    }

    #[tokio::test]
    async fn pages_follow_id_order() {
        let remote = InMemoryRemoteStore::new();
        for title in ["a", "b", "c"] {
            remote.seed(fields(title)).await;
        }
        let filter = RemoteFilter::everything();
        let first = remote
            .list_pending(&filter, Page::first(2))
            .await
            .expect("first page");
        let second = remote
            .list_pending(&filter, Page::first(2).next())
            .await
            .expect("second page");
        assert_eq!(first.len(), 2);
        assert_eq!(second.len(), 1);
        assert_eq!(second[0].as_ref().expect("row").fields.title, "c");

        assert!(remote.update(99, &RemoteUpdate::from_dirty(fields("x"), Default::default())).await.is_err());
        remote.delete(99).await.expect("missing delete is a success");
    }
}
