use std::sync::Arc;

use futures::future::join_all;
use tokio::task::JoinHandle;
use tracing::{info, warn};

use super::SharedLedger;
use crate::error::{ReminderSyncError, Result};
use crate::notifier::{render_stopped, Notifier};
use crate::reminders::{ReminderId, ReminderStore};

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct StopReport {
    pub chat_id: String,
    pub stopped: Vec<ReminderId>,
    pub edits_attempted: usize,
    pub edits_succeeded: usize,
}

/// Completion signal of a background stop-constant run.
pub struct StopHandle {
    chat_id: String,
    handle: JoinHandle<Result<StopReport>>,
}

impl StopHandle {
    pub fn chat_id(&self) -> &str {
        &self.chat_id
    }

    pub async fn completed(self) -> Result<StopReport> {
        self.handle
            .await
            .map_err(|e| ReminderSyncError::Runtime(format!("stop task for {}: {e}", self.chat_id)))?
    }
}

/// Silences a chat's active constant reminders in one local transaction, then edits the
/// messages already sent for them. Runs on its own task; edits are best effort.
pub fn spawn_stop_constant(
    store: Arc<ReminderStore>,
    notifier: Arc<dyn Notifier>,
    ledger: SharedLedger,
    chat_id: &str,
) -> StopHandle {
    let task_chat_id = chat_id.to_string();
    let handle = tokio::spawn(async move {
        let stopped = store.stop_constant_for_chat(&task_chat_id).await?;
        let state = ledger.lock().await.take(&task_chat_id);

        let targets: Vec<_> = state
            .map(|state| {
                state
                    .messages
                    .into_values()
                    .filter(|sent| stopped.contains(&sent.reminder_id))
                    .collect()
            })
            .unwrap_or_default();

        let edits = targets.iter().map(|sent| {
            let notifier = Arc::clone(&notifier);
            let chat_id = task_chat_id.clone();
            async move {
                notifier
                    .edit(&chat_id, sent.message_id, &render_stopped(&sent.title))
                    .await
                    .map_err(|err| (sent.message_id, err))
            }
        });
        let results = join_all(edits).await;

        let mut report = StopReport {
            chat_id: task_chat_id.clone(),
            stopped,
            edits_attempted: results.len(),
            edits_succeeded: 0,
        };
        for result in results {
            match result {
                Ok(()) => report.edits_succeeded += 1,
                Err((message_id, err)) => {
                    warn!(chat_id = %task_chat_id, message_id, error = %err, "could not edit stopped reminder message");
                }
            }
        }
        info!(
            chat_id = %task_chat_id,
            stopped = report.stopped.len(),
            edited = report.edits_succeeded,
            "constant reminders stopped"
        );
        Ok(report)
    });

    StopHandle {
        chat_id: chat_id.to_string(),
        handle,
    }
}
