use std::collections::BTreeMap;
use std::num::NonZeroUsize;

use lru::LruCache;

use crate::reminders::ReminderId;

pub const DEFAULT_CHAT_CAPACITY: usize = 1024;
pub const DEFAULT_IDLE_SECONDS: i64 = 86_400;

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SentNotification {
    pub reminder_id: ReminderId,
    pub message_id: i64,
    pub title: String,
}

/// Scheduling state of one chat: the latest message sent for each reminder.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ChatState {
    pub messages: BTreeMap<ReminderId, SentNotification>,
    pub last_activity: i64,
}

/// Keyed per-chat state. Entries are created by the first send to a chat and leave on LRU
/// pressure, after `idle_seconds` without sends, or when taken by a stop-constant run.
pub struct ChatLedger {
    chats: LruCache<String, ChatState>,
    idle_seconds: i64,
}

impl ChatLedger {
    pub fn new(capacity: usize, idle_seconds: i64) -> Self {
        let capacity = NonZeroUsize::new(capacity).unwrap_or(NonZeroUsize::MIN);
        Self {
            chats: LruCache::new(capacity),
            idle_seconds,
        }
    }

    pub fn record(&mut self, chat_id: &str, sent: SentNotification, now: i64) {
        let state = self
            .chats
            .get_or_insert_mut(chat_id.to_string(), ChatState::default);
        state.last_activity = now;
        state.messages.insert(sent.reminder_id, sent);
    }

    pub fn get(&self, chat_id: &str) -> Option<&ChatState> {
        self.chats.peek(chat_id)
    }

    /// Removes and returns a chat's state.
    pub fn take(&mut self, chat_id: &str) -> Option<ChatState> {
        self.chats.pop(chat_id)
    }

    pub fn evict_idle(&mut self, now: i64) -> usize {
        let cutoff = now - self.idle_seconds;
        let idle: Vec<String> = self
            .chats
            .iter()
            .filter(|(_, state)| state.last_activity < cutoff)
            .map(|(chat_id, _)| chat_id.clone())
            .collect();
        for chat_id in &idle {
            self.chats.pop(chat_id);
        }
        idle.len()
    }

    pub fn len(&self) -> usize {
        self.chats.len()
    }

    pub fn is_empty(&self) -> bool {
        self.chats.is_empty()
    }
}

impl Default for ChatLedger {
    fn default() -> Self {
        Self::new(DEFAULT_CHAT_CAPACITY, DEFAULT_IDLE_SECONDS)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sent(reminder_id: ReminderId, message_id: i64) -> SentNotification {
        SentNotification {
            reminder_id,
            message_id,
            title: format!("r{reminder_id}"),
        }
    }

    #[test]
    fn keeps_latest_message_per_reminder() {
        let mut ledger = ChatLedger::new(4, 100);
        ledger.record("c1", sent(1, 10), 5);
        ledger.record("c1", sent(1, 11), 6);
        ledger.record("c1", sent(2, 12), 7);

        let state = ledger.get("c1").expect("chat state");
        assert_eq!(state.messages.len(), 2);
        assert_eq!(state.messages[&1].message_id, 11);
        assert_eq!(state.last_activity, 7);

        assert!(ledger.take("c1").is_some());
        assert!(ledger.is_empty());
    }

    #[test]
    fn evicts_by_capacity_and_idleness() {
        let mut ledger = ChatLedger::new(2, 100);
        ledger.record("a", sent(1, 1), 0);
        ledger.record("b", sent(2, 2), 150);
        ledger.record("c", sent(3, 3), 150);
        assert!(ledger.get("a").is_none(), "least recently used chat evicted");

        assert_eq!(ledger.evict_idle(260), 2);
        assert_eq!(ledger.len(), 0);
    }
}
