use async_trait::async_trait;
use chrono::{DateTime, Utc};
use tokio::sync::Mutex;
use tracing::info;

use crate::error::{ReminderSyncError, Result};
use crate::reminders::Reminder;

mod telegram;

pub use telegram::TelegramNotifier;

pub const STOP_CONSTANT_CALLBACK: &str = "stop_constant";

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Button {
    pub text: String,
    pub callback_data: String,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SentMessage {
    pub message_id: i64,
}

/// Outbound chat transport.
#[async_trait]
pub trait Notifier: Send + Sync {
    async fn send(&self, chat_id: &str, text: &str, buttons: &[Button]) -> Result<SentMessage>;
    async fn edit(&self, chat_id: &str, message_id: i64, text: &str) -> Result<()>;
}

pub fn render_reminder(reminder: &Reminder) -> String {
    let mut text = format!("⏰ REMINDER\n\n📝 {}", reminder.title);
    if let Some(description) = reminder
        .description
        .as_deref()
        .filter(|description| !description.trim().is_empty())
    {
        text.push_str(&format!("\n📋 {description}"));
    }
    if let Some(at) = reminder
        .scheduled_at
        .and_then(|at| DateTime::<Utc>::from_timestamp(at, 0))
    {
        text.push_str(&format!("\n🕒 {}", at.format("%d/%m/%Y %H:%M UTC")));
    }
    text
}

pub fn render_stopped(title: &str) -> String {
    format!("✅ {title}\n\nConstant reminder stopped.")
}

/// Constant reminders carry a stop button; everything else is plain text.
pub fn buttons_for(reminder: &Reminder) -> Vec<Button> {
    if reminder.constant_notify {
        vec![Button {
            text: "Stop".to_string(),
            callback_data: STOP_CONSTANT_CALLBACK.to_string(),
        }]
    } else {
        Vec::new()
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum NotifierCall {
    Send {
        chat_id: String,
        text: String,
        buttons: Vec<Button>,
        message_id: i64,
    },
    Edit {
        chat_id: String,
        message_id: i64,
        text: String,
    },
}

#[derive(Default)]
struct MemoryNotifierState {
    next_message_id: i64,
    calls: Vec<NotifierCall>,
    fail_sends_to: Vec<String>,
    fail_edits: bool,
}

/// Notifier that logs and records instead of talking to a chat service. Backs offline runs
/// without a bot token.
#[derive(Default)]
pub struct MemoryNotifier {
    state: Mutex<MemoryNotifierState>,
}

impl MemoryNotifier {
    pub fn new() -> Self {
        Self::default()
    }

    pub async fn fail_sends_to(&self, chat_id: &str) {
        self.state
            .lock()
            .await
            .fail_sends_to
            .push(chat_id.to_string());
    }

    pub async fn fail_edits(&self, fail: bool) {
        self.state.lock().await.fail_edits = fail;
    }

    pub async fn calls(&self) -> Vec<NotifierCall> {
        self.state.lock().await.calls.clone()
    }

    pub async fn sent_count(&self) -> usize {
        self.state
            .lock()
            .await
            .calls
            .iter()
            .filter(|call| matches!(call, NotifierCall::Send { .. }))
            .count()
    }
}

#[async_trait]
impl Notifier for MemoryNotifier {
    async fn send(&self, chat_id: &str, text: &str, buttons: &[Button]) -> Result<SentMessage> {
        let mut state = self.state.lock().await;
        if state.fail_sends_to.iter().any(|failing| failing == chat_id) {
            return Err(ReminderSyncError::Http(format!(
                "send to chat {chat_id} refused"
            )));
        }
        state.next_message_id += 1;
        let message_id = state.next_message_id;
        info!(chat_id, message_id, "notification recorded");
        state.calls.push(NotifierCall::Send {
            chat_id: chat_id.to_string(),
            text: text.to_string(),
            buttons: buttons.to_vec(),
            message_id,
        });
        Ok(SentMessage { message_id })
    }

    async fn edit(&self, chat_id: &str, message_id: i64, text: &str) -> Result<()> {
        let mut state = self.state.lock().await;
        if state.fail_edits {
            return Err(ReminderSyncError::Http(format!(
                "edit of message {message_id} refused"
            )));
        }
        state.calls.push(NotifierCall::Edit {
            chat_id: chat_id.to_string(),
            message_id,
            text: text.to_string(),
        });
        Ok(())
    }
}
