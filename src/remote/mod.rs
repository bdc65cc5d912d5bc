use std::collections::{BTreeSet, HashSet};

use async_trait::async_trait;
use chrono::{DateTime, SecondsFormat, Utc};
use serde_json::{Map, Value};

use crate::error::{ReminderSyncError, Result};
use crate::reminders::{ReminderField, ReminderFields, RemoteId, RemoteReminder};

mod memory;
mod rest;

pub use memory::{InMemoryRemoteStore, InjectedFailure, RemoteOp};
pub use rest::RestRemoteStore;

/// Authoritative store the engine reconciles against. Implementations map transport trouble to
/// `RemoteUnavailable` and data refusals to `RemoteRejected`.
#[async_trait]
pub trait RemoteStore: Send + Sync {
    async fn create(&self, fields: &ReminderFields) -> Result<RemoteId>;
    async fn update(&self, remote_id: RemoteId, update: &RemoteUpdate) -> Result<()>;
    /// Deleting an id the remote no longer has is a success.
    async fn delete(&self, remote_id: RemoteId) -> Result<()>;
    /// The outer error fails the whole page; an inner error is one row that could not be read.
    async fn list_pending(
        &self,
        filter: &RemoteFilter,
        page: Page,
    ) -> Result<Vec<Result<RemoteReminder>>>;
    async fn list_all_ids(&self) -> Result<HashSet<RemoteId>>;
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RemoteFilter {
    /// Only rows still owed a notification.
    pub only_unfinalized: bool,
    /// Rows scheduled before this instant are ignored; unscheduled rows always match.
    pub scheduled_since: Option<i64>,
}

impl RemoteFilter {
    pub fn pending_since(scheduled_since: i64) -> Self {
        Self {
            only_unfinalized: true,
            scheduled_since: Some(scheduled_since),
        }
    }

    pub fn everything() -> Self {
        Self {
            only_unfinalized: false,
            scheduled_since: None,
        }
    }

    pub fn matches(&self, fields: &ReminderFields) -> bool {
        if self.only_unfinalized
            && fields.notified
            && !(fields.constant_notify && !fields.notify_stopped)
        {
            return false;
        }
        match (self.scheduled_since, fields.scheduled_at) {
            (Some(since), Some(at)) => at >= since,
            _ => true,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Page {
    pub offset: usize,
    pub limit: usize,
}

impl Page {
    pub fn first(limit: usize) -> Self {
        Self { offset: 0, limit }
    }

    pub fn next(self) -> Self {
        Self {
            offset: self.offset + self.limit,
            limit: self.limit,
        }
    }
}

/// A field-level update: only `fields` are sent, with values taken from `values`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RemoteUpdate {
    pub fields: BTreeSet<ReminderField>,
    pub values: ReminderFields,
}

impl RemoteUpdate {
    /// An empty dirty set means the change history is unknown, so every field is sent.
    pub fn from_dirty(values: ReminderFields, dirty: BTreeSet<ReminderField>) -> Self {
        let fields = if dirty.is_empty() {
            ReminderField::ALL.into_iter().collect()
        } else {
            dirty
        };
        Self { fields, values }
    }

    pub fn apply_to(&self, target: &mut ReminderFields) {
        for field in &self.fields {
            match field {
                ReminderField::ChatId => target.chat_id = self.values.chat_id.clone(),
                ReminderField::Owner => target.owner = self.values.owner.clone(),
                ReminderField::Title => target.title = self.values.title.clone(),
                ReminderField::Description => {
                    target.description = self.values.description.clone()
                }
                ReminderField::ScheduledAt => target.scheduled_at = self.values.scheduled_at,
                ReminderField::Notified => target.notified = self.values.notified,
                ReminderField::ConstantNotify => {
                    target.constant_notify = self.values.constant_notify
                }
                ReminderField::NotifyStopped => target.notify_stopped = self.values.notify_stopped,
                ReminderField::Repeat => {
                    target.repeat = self.values.repeat;
                    target.repeat_unit = self.values.repeat_unit;
                    target.repeat_count = self.values.repeat_count;
                }
                ReminderField::RecurrenceCreated => {
                    target.recurrence_created = self.values.recurrence_created
                }
            }
        }
    }

    pub fn to_json(&self) -> Result<Value> {
        let mut body = Map::new();
        for field in &self.fields {
            write_field(&mut body, *field, &self.values)?;
        }
        Ok(Value::Object(body))
    }
}

/// Wire body for a remote create: every content field plus `created_at`.
pub fn fields_to_json(fields: &ReminderFields) -> Result<Value> {
    let mut body = Map::new();
    for field in ReminderField::ALL {
        write_field(&mut body, field, fields)?;
    }
    body.insert(
        "created_at".to_string(),
        Value::String(format_timestamp(fields.created_at)?),
    );
    Ok(Value::Object(body))
}

fn write_field(body: &mut Map<String, Value>, field: ReminderField, values: &ReminderFields) -> Result<()> {
    let value = match field {
        ReminderField::ChatId => Value::from(values.chat_id.clone()),
        ReminderField::Owner => Value::from(values.owner.clone()),
        ReminderField::Title => Value::from(values.title.clone()),
        ReminderField::Description => values
            .description
            .clone()
            .map(Value::from)
            .unwrap_or(Value::Null),
        ReminderField::ScheduledAt => match values.scheduled_at {
            Some(at) => Value::String(format_timestamp(at)?),
            None => Value::Null,
        },
        ReminderField::Notified => Value::from(values.notified),
        ReminderField::ConstantNotify => Value::from(values.constant_notify),
        ReminderField::NotifyStopped => Value::from(values.notify_stopped),
        ReminderField::Repeat => {
            body.insert(
                "repeat_unit".to_string(),
                values
                    .repeat_unit
                    .map(|unit| Value::from(unit.as_str()))
                    .unwrap_or(Value::Null),
            );
            body.insert(
                "repeat_count".to_string(),
                values.repeat_count.map(Value::from).unwrap_or(Value::Null),
            );
            Value::from(values.repeat)
        }
        ReminderField::RecurrenceCreated => Value::from(values.recurrence_created),
    };
    body.insert(field.as_str().to_string(), value);
    Ok(())
}

pub(crate) fn format_timestamp(ts: i64) -> Result<String> {
    DateTime::<Utc>::from_timestamp(ts, 0)
        .map(|dt| dt.to_rfc3339_opts(SecondsFormat::Secs, true))
        .ok_or_else(|| ReminderSyncError::Serialization(format!("timestamp {ts} is out of range")))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::reminders::RepeatUnit;

    fn fields() -> ReminderFields {
        ReminderFields {
            chat_id: "c1".to_string(),
            owner: "ana".to_string(),
            title: "Pay rent".to_string(),
            description: Some("before noon".to_string()),
            scheduled_at: Some(1_735_689_600),
            created_at: 1_735_603_200,
            notified: false,
            constant_notify: true,
            notify_stopped: false,
            repeat: true,
            repeat_unit: Some(RepeatUnit::Months),
            repeat_count: Some(1),
            recurrence_created: false,
        }
    }

    #[test]
    fn update_body_carries_only_dirty_fields() {
        let update = RemoteUpdate::from_dirty(
            fields(),
            BTreeSet::from([ReminderField::Notified, ReminderField::Repeat]),
        );
        let body = update.to_json().expect("json");
        let object = body.as_object().expect("object");
        let mut keys: Vec<&str> = object.keys().map(String::as_str).collect();
        keys.sort_unstable();
        assert_eq!(keys, vec!["notified", "repeat", "repeat_count", "repeat_unit"]);
        assert_eq!(object["repeat_unit"], Value::from("months"));
    }

    #[test]
    fn empty_dirty_set_sends_everything() {
        let update = RemoteUpdate::from_dirty(fields(), BTreeSet::new());
        assert_eq!(update.fields.len(), ReminderField::ALL.len());
        let body = fields_to_json(&fields()).expect("json");
        assert_eq!(body["scheduled_at"], Value::from("2025-01-01T00:00:00Z"));
        assert_eq!(body["created_at"], Value::from("2024-12-31T00:00:00Z"));
    }

    #[test]
    fn pending_filter_matches_unfinalized_and_fresh_rows() {
        let filter = RemoteFilter::pending_since(1_735_000_000);
        let mut row = fields();
        assert!(filter.matches(&row));

        row.notified = true;
        assert!(filter.matches(&row), "active constant reminder still matches");
        row.notify_stopped = true;
        assert!(!filter.matches(&row));

        let mut stale = fields();
        stale.scheduled_at = Some(1_600_000_000);
        assert!(!filter.matches(&stale));
        assert!(RemoteFilter::everything().matches(&stale));
    }
}
