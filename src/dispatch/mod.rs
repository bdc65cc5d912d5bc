//! Turns due reminders into notifications.
//!
//! A tick lists due rows, re-reads each one right before sending, sends, durably marks it
//! notified and spawns the next occurrence of repeating reminders. A reminder that fails is
//! logged and retried on the next tick. Delivery is at-least-once: a crash between the send
//! and the mark repeats the send.

use std::sync::Arc;

use tokio::sync::Mutex;
use tracing::{debug, info, warn};

use crate::error::{ReminderSyncError, Result};
use crate::notifier::{buttons_for, render_reminder, Notifier};
use crate::reminders::notification_fsm::{transition, NotificationEvent, NotificationState};
use crate::reminders::recurrence::next_for_spec;
use crate::reminders::{now_ts, Reminder, ReminderId, ReminderStore};

mod ledger;
mod stop;

pub use ledger::{ChatLedger, ChatState, SentNotification};
pub use stop::{spawn_stop_constant, StopHandle, StopReport};

pub type SharedLedger = Arc<Mutex<ChatLedger>>;

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct TickReport {
    pub due: usize,
    pub not_yet_due: usize,
    pub sent: usize,
    pub skipped: usize,
    pub failed: usize,
    pub recurrences: usize,
}

#[derive(Debug, Clone, PartialEq, Eq)]
enum DispatchOutcome {
    Sent { child: Option<ReminderId> },
    Skipped,
}

pub struct ReminderDispatcher {
    store: Arc<ReminderStore>,
    notifier: Arc<dyn Notifier>,
    ledger: SharedLedger,
}

impl ReminderDispatcher {
    pub fn new(store: Arc<ReminderStore>, notifier: Arc<dyn Notifier>) -> Self {
        Self::with_ledger(store, notifier, ChatLedger::default())
    }

    pub fn with_ledger(
        store: Arc<ReminderStore>,
        notifier: Arc<dyn Notifier>,
        ledger: ChatLedger,
    ) -> Self {
        Self {
            store,
            notifier,
            ledger: Arc::new(Mutex::new(ledger)),
        }
    }

    pub fn ledger(&self) -> SharedLedger {
        Arc::clone(&self.ledger)
    }

    /// Starts the background stop-constant task for a chat.
    pub fn stop_constant(&self, chat_id: &str) -> StopHandle {
        spawn_stop_constant(
            Arc::clone(&self.store),
            Arc::clone(&self.notifier),
            self.ledger(),
            chat_id,
        )
    }

    pub async fn tick(&self) -> Result<TickReport> {
        self.tick_at(now_ts()).await
    }

    pub async fn tick_at(&self, now: i64) -> Result<TickReport> {
        let due = self.store.list_due().await?;
        let mut report = TickReport {
            due: due.len(),
            ..TickReport::default()
        };

        for reminder in due {
            if !reminder.is_due(now) {
                report.not_yet_due += 1;
                continue;
            }
            match self.dispatch(reminder.id, now).await {
                Ok(DispatchOutcome::Sent { child }) => {
                    report.sent += 1;
                    if child.is_some() {
                        report.recurrences += 1;
                    }
                }
                Ok(DispatchOutcome::Skipped) => report.skipped += 1,
                Err(err) => {
                    report.failed += 1;
                    warn!(
                        reminder_id = reminder.id,
                        chat_id = %reminder.chat_id,
                        error = %err,
                        "reminder dispatch failed; retrying next tick"
                    );
                }
            }
        }

        for reminder in self.store.list_unspawned_recurrences().await? {
            match self.spawn_next(&reminder).await {
                Ok(Some(_)) => report.recurrences += 1,
                Ok(None) => {}
                Err(err) => {
                    report.failed += 1;
                    warn!(reminder_id = reminder.id, error = %err, "could not create next occurrence");
                }
            }
        }

        let evicted = self.ledger.lock().await.evict_idle(now);
        if report.sent > 0 || report.failed > 0 || evicted > 0 {
            info!(
                sent = report.sent,
                failed = report.failed,
                recurrences = report.recurrences,
                evicted_chats = evicted,
                "dispatch tick finished"
            );
        }
        Ok(report)
    }

    async fn dispatch(&self, id: ReminderId, now: i64) -> Result<DispatchOutcome> {
        // Fresh read so a stop committed after `list_due` still prevents the send.
        let Some(reminder) = self.store.get(id).await? else {
            return Ok(DispatchOutcome::Skipped);
        };
        let state = NotificationState::of(&reminder);
        if !state.accepts_dispatch() || !reminder.is_due(now) {
            debug!(reminder_id = id, ?state, "reminder no longer dispatchable");
            return Ok(DispatchOutcome::Skipped);
        }
        let event = NotificationEvent::dispatch_for(&reminder);
        if transition(state, event).is_none() {
            return Ok(DispatchOutcome::Skipped);
        }

        let sent = self
            .notifier
            .send(
                &reminder.chat_id,
                &render_reminder(&reminder),
                &buttons_for(&reminder),
            )
            .await?;
        self.store.mark_notified(id).await?;
        self.ledger.lock().await.record(
            &reminder.chat_id,
            SentNotification {
                reminder_id: id,
                message_id: sent.message_id,
                title: reminder.title.clone(),
            },
            now,
        );
        debug!(reminder_id = id, message_id = sent.message_id, "reminder notified");

        let child = if reminder.repeat && !reminder.recurrence_created {
            self.spawn_next(&reminder).await?
        } else {
            None
        };
        Ok(DispatchOutcome::Sent { child })
    }

    /// A row that can never produce a next occurrence gets its guard raised, so it is reported
    /// once instead of on every tick.
    async fn spawn_next(&self, reminder: &Reminder) -> Result<Option<ReminderId>> {
        let next = match next_scheduled_at(reminder) {
            Ok(next) => next,
            Err(err) => {
                warn!(
                    reminder_id = reminder.id,
                    error = %err,
                    "reminder cannot recur; no further occurrences will be created"
                );
                self.store.mark_recurrence_created(reminder.id).await?;
                return Ok(None);
            }
        };
        let child = self.store.spawn_recurrence(reminder.id, next).await?;
        if let Some(child) = &child {
            info!(
                reminder_id = reminder.id,
                child_id = child.id,
                scheduled_at = next,
                "next occurrence created"
            );
        }
        Ok(child.map(|child| child.id))
    }
}

fn next_scheduled_at(reminder: &Reminder) -> Result<i64> {
    let spec = reminder.repeat_spec().ok_or_else(|| {
        ReminderSyncError::Runtime(format!(
            "reminder {} repeats without a valid interval",
            reminder.id
        ))
    })?;
    let anchor = reminder.scheduled_at.ok_or_else(|| {
        ReminderSyncError::Runtime(format!("reminder {} has no anchor", reminder.id))
    })?;
    next_for_spec(anchor, spec)
}
