use std::collections::BTreeSet;
use std::fmt;
use std::str::FromStr;
use std::sync::OnceLock;

use regex::Regex;
use serde::{Deserialize, Serialize};

use crate::error::ReminderSyncError;

pub type ReminderId = i32;
pub type RemoteId = i64;

pub const REMINDERS_TABLE: &str = "reminders";

/// Largest repeat count the integer column holds.
pub const MAX_REPEAT_COUNT: u32 = i32::MAX as u32;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SyncStatus {
    Pending,
    PendingUpdate,
    Synced,
    Failed,
}

impl SyncStatus {
    pub fn as_str(self) -> &'static str {
        match self {
            SyncStatus::Pending => "pending",
            SyncStatus::PendingUpdate => "pending_update",
            SyncStatus::Synced => "synced",
            SyncStatus::Failed => "failed",
        }
    }

    /// Status after a local edit. Rows the remote never accepted stay `pending` because the
    /// eventual create carries every field; `failed` waits for an operator.
    pub fn after_local_edit(self, has_remote: bool) -> Self {
        match self {
            SyncStatus::Failed => SyncStatus::Failed,
            _ if has_remote => SyncStatus::PendingUpdate,
            _ => SyncStatus::Pending,
        }
    }
}

impl fmt::Display for SyncStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for SyncStatus {
    type Err = ReminderSyncError;

    fn from_str(value: &str) -> Result<Self, Self::Err> {
        match value {
            "pending" => Ok(SyncStatus::Pending),
            "pending_update" => Ok(SyncStatus::PendingUpdate),
            "synced" => Ok(SyncStatus::Synced),
            "failed" => Ok(SyncStatus::Failed),
            other => Err(ReminderSyncError::Serialization(format!(
                "unknown sync status: {other}"
            ))),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RepeatUnit {
    Seconds,
    Minutes,
    Hours,
    Days,
    Weeks,
    Months,
    Years,
}

impl RepeatUnit {
    pub fn as_str(self) -> &'static str {
        match self {
            RepeatUnit::Seconds => "seconds",
            RepeatUnit::Minutes => "minutes",
            RepeatUnit::Hours => "hours",
            RepeatUnit::Days => "days",
            RepeatUnit::Weeks => "weeks",
            RepeatUnit::Months => "months",
            RepeatUnit::Years => "years",
        }
    }
}

impl fmt::Display for RepeatUnit {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for RepeatUnit {
    type Err = ReminderSyncError;

    /// Accepts full names plus the short symbols used by the chat front-end: `s`, `x` (minutes),
    /// `h`, `d`, `w`, `m` (months), `a`/`y` (years).
    fn from_str(value: &str) -> Result<Self, Self::Err> {
        let unit = match value.trim() {
            "s" | "sec" | "second" | "seconds" => RepeatUnit::Seconds,
            "x" | "min" | "minute" | "minutes" => RepeatUnit::Minutes,
            "h" | "hour" | "hours" => RepeatUnit::Hours,
            "d" | "day" | "days" => RepeatUnit::Days,
            "w" | "week" | "weeks" => RepeatUnit::Weeks,
            "m" | "month" | "months" => RepeatUnit::Months,
            "a" | "y" | "year" | "years" => RepeatUnit::Years,
            other => {
                return Err(ReminderSyncError::Serialization(format!(
                    "unknown repeat unit: {other}"
                )))
            }
        };
        Ok(unit)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct RepeatSpec {
    pub unit: RepeatUnit,
    pub count: u32,
}

fn repeat_spec_regex() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| {
        Regex::new(r"^\s*(\d+)\s*:?\s*([A-Za-z]+)\s*$").expect("repeat spec regex is valid")
    })
}

impl RepeatSpec {
    pub fn new(unit: RepeatUnit, count: u32) -> Self {
        Self { unit, count }
    }

    /// Parses `2:h`, `2h` or `2 hours`.
    pub fn parse(raw: &str) -> Result<Self, ReminderSyncError> {
        let captures = repeat_spec_regex().captures(raw).ok_or_else(|| {
            ReminderSyncError::Serialization(format!("invalid repeat interval: {raw}"))
        })?;
        let count: u32 = captures[1]
            .parse()
            .map_err(|_| ReminderSyncError::Serialization(format!("invalid repeat count: {raw}")))?;
        let unit = captures[2].parse()?;
        Self { unit, count }.checked()
    }

    /// Rejects counts of zero or counts beyond [`MAX_REPEAT_COUNT`].
    pub fn checked(self) -> Result<Self, ReminderSyncError> {
        if self.count == 0 {
            return Err(ReminderSyncError::Serialization(
                "repeat count must be positive".to_string(),
            ));
        }
        if self.count > MAX_REPEAT_COUNT {
            return Err(ReminderSyncError::Serialization(format!(
                "repeat count {} exceeds {MAX_REPEAT_COUNT}",
                self.count
            )));
        }
        Ok(self)
    }
}

/// Content columns tracked for dirty-field pushes.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ReminderField {
    ChatId,
    Owner,
    Title,
    Description,
    ScheduledAt,
    Notified,
    ConstantNotify,
    NotifyStopped,
    Repeat,
    RecurrenceCreated,
}

impl ReminderField {
    pub const ALL: [ReminderField; 10] = [
        ReminderField::ChatId,
        ReminderField::Owner,
        ReminderField::Title,
        ReminderField::Description,
        ReminderField::ScheduledAt,
        ReminderField::Notified,
        ReminderField::ConstantNotify,
        ReminderField::NotifyStopped,
        ReminderField::Repeat,
        ReminderField::RecurrenceCreated,
    ];

    pub fn as_str(self) -> &'static str {
        match self {
            ReminderField::ChatId => "chat_id",
            ReminderField::Owner => "owner",
            ReminderField::Title => "title",
            ReminderField::Description => "description",
            ReminderField::ScheduledAt => "scheduled_at",
            ReminderField::Notified => "notified",
            ReminderField::ConstantNotify => "constant_notify",
            ReminderField::NotifyStopped => "notify_stopped",
            ReminderField::Repeat => "repeat",
            ReminderField::RecurrenceCreated => "recurrence_created",
        }
    }
}

impl FromStr for ReminderField {
    type Err = ReminderSyncError;

    fn from_str(value: &str) -> Result<Self, Self::Err> {
        ReminderField::ALL
            .into_iter()
            .find(|field| field.as_str() == value)
            .ok_or_else(|| ReminderSyncError::Serialization(format!("unknown field: {value}")))
    }
}

/// The replicated content of a reminder, without local sync metadata.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ReminderFields {
    pub chat_id: String,
    pub owner: String,
    pub title: String,
    pub description: Option<String>,
    pub scheduled_at: Option<i64>,
    pub created_at: i64,
    pub notified: bool,
    pub constant_notify: bool,
    pub notify_stopped: bool,
    pub repeat: bool,
    pub repeat_unit: Option<RepeatUnit>,
    pub repeat_count: Option<u32>,
    pub recurrence_created: bool,
}

impl ReminderFields {
    pub fn changed_fields(&self, other: &ReminderFields) -> BTreeSet<ReminderField> {
        let mut changed = BTreeSet::new();
        if self.chat_id != other.chat_id {
            changed.insert(ReminderField::ChatId);
        }
        if self.owner != other.owner {
            changed.insert(ReminderField::Owner);
        }
        if self.title != other.title {
            changed.insert(ReminderField::Title);
        }
        if self.description != other.description {
            changed.insert(ReminderField::Description);
        }
        if self.scheduled_at != other.scheduled_at {
            changed.insert(ReminderField::ScheduledAt);
        }
        if self.notified != other.notified {
            changed.insert(ReminderField::Notified);
        }
        if self.constant_notify != other.constant_notify {
            changed.insert(ReminderField::ConstantNotify);
        }
        if self.notify_stopped != other.notify_stopped {
            changed.insert(ReminderField::NotifyStopped);
        }
        if self.repeat != other.repeat
            || self.repeat_unit != other.repeat_unit
            || self.repeat_count != other.repeat_count
        {
            changed.insert(ReminderField::Repeat);
        }
        if self.recurrence_created != other.recurrence_created {
            changed.insert(ReminderField::RecurrenceCreated);
        }
        changed
    }

    /// Remote content wins for descriptive fields; monotonic flags keep whichever side is true.
    pub fn merged_with_remote(&self, remote: &ReminderFields) -> ReminderFields {
        ReminderFields {
            chat_id: remote.chat_id.clone(),
            owner: remote.owner.clone(),
            title: remote.title.clone(),
            description: remote.description.clone(),
            scheduled_at: remote.scheduled_at,
            created_at: self.created_at,
            notified: self.notified || remote.notified,
            constant_notify: remote.constant_notify,
            notify_stopped: self.notify_stopped || remote.notify_stopped,
            repeat: remote.repeat,
            repeat_unit: remote.repeat_unit,
            repeat_count: remote.repeat_count,
            recurrence_created: self.recurrence_created || remote.recurrence_created,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct Reminder {
    pub id: ReminderId,
    pub remote_id: Option<RemoteId>,
    pub chat_id: String,
    pub owner: String,
    pub title: String,
    pub description: Option<String>,
    pub scheduled_at: Option<i64>,
    pub created_at: i64,
    pub notified: bool,
    pub constant_notify: bool,
    pub notify_stopped: bool,
    pub repeat: bool,
    pub repeat_unit: Option<RepeatUnit>,
    pub repeat_count: Option<u32>,
    pub recurrence_created: bool,
    pub sync_status: SyncStatus,
    pub last_updated: i64,
}

impl Reminder {
    pub fn fields(&self) -> ReminderFields {
        ReminderFields {
            chat_id: self.chat_id.clone(),
            owner: self.owner.clone(),
            title: self.title.clone(),
            description: self.description.clone(),
            scheduled_at: self.scheduled_at,
            created_at: self.created_at,
            notified: self.notified,
            constant_notify: self.constant_notify,
            notify_stopped: self.notify_stopped,
            repeat: self.repeat,
            repeat_unit: self.repeat_unit,
            repeat_count: self.repeat_count,
            recurrence_created: self.recurrence_created,
        }
    }

    pub fn repeat_spec(&self) -> Option<RepeatSpec> {
        if !self.repeat {
            return None;
        }
        match (self.repeat_unit, self.repeat_count) {
            (Some(unit), Some(count)) if count > 0 => Some(RepeatSpec { unit, count }),
            _ => None,
        }
    }

    pub fn is_due(&self, now: i64) -> bool {
        self.scheduled_at.is_some_and(|at| at <= now)
    }
}

/// Input for `ReminderStore::create`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct NewReminder {
    pub chat_id: String,
    pub owner: String,
    pub title: String,
    pub description: Option<String>,
    pub scheduled_at: Option<i64>,
    pub constant_notify: bool,
    pub repeat: Option<RepeatSpec>,
}

impl NewReminder {
    pub fn new(chat_id: impl Into<String>, owner: impl Into<String>, title: impl Into<String>) -> Self {
        Self {
            chat_id: chat_id.into(),
            owner: owner.into(),
            title: title.into(),
            description: None,
            scheduled_at: None,
            constant_notify: false,
            repeat: None,
        }
    }

    pub fn description(mut self, description: impl Into<String>) -> Self {
        self.description = Some(description.into());
        self
    }

    pub fn scheduled_at(mut self, at: i64) -> Self {
        self.scheduled_at = Some(at);
        self
    }

    pub fn constant(mut self) -> Self {
        self.constant_notify = true;
        self
    }

    pub fn repeating(mut self, spec: RepeatSpec) -> Self {
        self.repeat = Some(spec);
        self
    }
}

/// Partial update for `ReminderStore::update`. Monotonic flags can only be raised.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ReminderPatch {
    pub title: Option<String>,
    pub description: Option<Option<String>>,
    pub scheduled_at: Option<Option<i64>>,
    pub constant_notify: Option<bool>,
    pub repeat: Option<Option<RepeatSpec>>,
    pub notify_stopped: bool,
}

impl ReminderPatch {
    pub fn apply(&self, fields: &mut ReminderFields) {
        if let Some(title) = &self.title {
            fields.title = title.clone();
        }
        if let Some(description) = &self.description {
            fields.description = description.clone();
        }
        if let Some(scheduled_at) = self.scheduled_at {
            fields.scheduled_at = scheduled_at;
        }
        if let Some(constant_notify) = self.constant_notify {
            fields.constant_notify = constant_notify;
        }
        if let Some(repeat) = self.repeat {
            fields.repeat = repeat.is_some();
            fields.repeat_unit = repeat.map(|spec| spec.unit);
            fields.repeat_count = repeat.map(|spec| spec.count);
        }
        if self.notify_stopped {
            fields.notify_stopped = true;
        }
    }
}

/// A reminder as the remote store holds it.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RemoteReminder {
    pub id: RemoteId,
    pub fields: ReminderFields,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct PendingDeletion {
    pub id: i32,
    pub table: String,
    pub local_id: ReminderId,
    pub remote_id: Option<RemoteId>,
    pub deleted_at: i64,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn repeat_spec_accepts_both_short_forms() {
        assert_eq!(
            RepeatSpec::parse("2:h").expect("colon form"),
            RepeatSpec::new(RepeatUnit::Hours, 2)
        );
        assert_eq!(
            RepeatSpec::parse("1d").expect("compact form"),
            RepeatSpec::new(RepeatUnit::Days, 1)
        );
        assert_eq!(
            RepeatSpec::parse("15 x").expect("minutes symbol"),
            RepeatSpec::new(RepeatUnit::Minutes, 15)
        );
        assert_eq!(
            RepeatSpec::parse("1:a").expect("years symbol").unit,
            RepeatUnit::Years
        );
        assert!(RepeatSpec::parse("0:d").is_err());
        assert!(RepeatSpec::parse("d").is_err());
        assert!(RepeatSpec::parse("3:q").is_err());
    }

    #[test]
    fn repeat_count_must_fit_the_column() {
        assert!(RepeatSpec::parse("3000000000:h").is_err());
        assert!(RepeatSpec::parse("4294967296:h").is_err());
        assert_eq!(
            RepeatSpec::parse("2147483647:s").expect("largest count").count,
            MAX_REPEAT_COUNT
        );
        assert!(RepeatSpec::new(RepeatUnit::Days, MAX_REPEAT_COUNT + 1)
            .checked()
            .is_err());
    }

    #[test]
    fn status_after_local_edit_respects_remote_presence() {
        assert_eq!(
            SyncStatus::Synced.after_local_edit(true),
            SyncStatus::PendingUpdate
        );
        assert_eq!(SyncStatus::Pending.after_local_edit(false), SyncStatus::Pending);
        assert_eq!(SyncStatus::Failed.after_local_edit(true), SyncStatus::Failed);
        assert_eq!(
            "pending_update".parse::<SyncStatus>().expect("parse"),
            SyncStatus::PendingUpdate
        );
    }

    fn sample_fields() -> ReminderFields {
        ReminderFields {
            chat_id: "c1".to_string(),
            owner: "ana".to_string(),
            title: "Water plants".to_string(),
            description: None,
            scheduled_at: Some(100),
            created_at: 10,
            notified: true,
            constant_notify: false,
            notify_stopped: false,
            repeat: false,
            repeat_unit: None,
            repeat_count: None,
            recurrence_created: true,
        }
    }

    #[test]
    fn merge_keeps_monotonic_flags_and_takes_remote_content() {
        let local = sample_fields();
        let mut remote = sample_fields();
        remote.notified = false;
        remote.recurrence_created = false;
        remote.title = "Water the plants".to_string();
        remote.created_at = 99;

        let merged = local.merged_with_remote(&remote);
        assert!(merged.notified);
        assert!(merged.recurrence_created);
        assert_eq!(merged.title, "Water the plants");
        assert_eq!(merged.created_at, 10);
    }

    #[test]
    fn changed_fields_groups_repeat_configuration() {
        let before = sample_fields();
        let mut after = sample_fields();
        after.repeat = true;
        after.repeat_unit = Some(RepeatUnit::Weeks);
        after.repeat_count = Some(1);
        after.notify_stopped = true;

        let changed = before.changed_fields(&after);
        assert_eq!(
            changed.into_iter().collect::<Vec<_>>(),
            vec![ReminderField::NotifyStopped, ReminderField::Repeat]
        );
    }
}
