use serde::{Deserialize, Serialize};
use std::fs;
use std::path::Path;
use std::time::Duration;

use crate::error::{ReminderSyncError, Result};

const REMOTE_KEY_ENV: &str = "REMINDER_SYNC_REMOTE_KEY";
const BOT_TOKEN_ENV: &str = "REMINDER_SYNC_BOT_TOKEN";

#[derive(Debug, Clone, Default, Deserialize, Serialize)]
pub struct DatabaseConfig {
    pub sqlite_path: Option<String>,
}

#[derive(Debug, Clone, Default, Deserialize, Serialize)]
pub struct RemoteConfig {
    pub base_url: Option<String>,
    pub api_key: Option<String>,
    pub table: Option<String>,
    pub timeout_seconds: Option<u64>,
    pub page_size: Option<usize>,
}

#[derive(Debug, Clone, Default, Deserialize, Serialize)]
pub struct NotifierConfig {
    pub bot_token: Option<String>,
    pub base_url: Option<String>,
    pub timeout_seconds: Option<u64>,
}

#[derive(Debug, Clone, Default, Deserialize, Serialize)]
pub struct ScheduleConfig {
    pub tick_seconds: Option<u64>,
    pub push_seconds: Option<u64>,
    /// Absent means the zombie sweep only runs on demand.
    pub zombie_sweep_seconds: Option<u64>,
    pub retention_seconds: Option<u64>,
}

#[derive(Debug, Clone, Default, Deserialize, Serialize)]
pub struct SyncConfig {
    pub pull_window_days: Option<i64>,
    pub zombie_batch_size: Option<usize>,
}

#[derive(Debug, Clone, Default, Deserialize, Serialize)]
pub struct RetentionConfig {
    pub keep_days: Option<i64>,
}

#[derive(Debug, Clone, Default, Deserialize, Serialize)]
pub struct DispatchConfig {
    pub chat_state_capacity: Option<usize>,
    pub chat_state_idle_seconds: Option<i64>,
}

#[derive(Debug, Clone, Default, Deserialize, Serialize)]
pub struct Config {
    #[serde(default)]
    pub database: DatabaseConfig,
    #[serde(default)]
    pub remote: RemoteConfig,
    #[serde(default)]
    pub notifier: NotifierConfig,
    #[serde(default)]
    pub schedule: ScheduleConfig,
    #[serde(default)]
    pub sync: SyncConfig,
    #[serde(default)]
    pub retention: RetentionConfig,
    #[serde(default)]
    pub dispatch: DispatchConfig,
}

impl Config {
    pub fn convention_defaults(db_path: &str) -> Self {
        Self {
            database: DatabaseConfig {
                sqlite_path: Some(db_path.to_string()),
            },
            remote: RemoteConfig {
                base_url: None,
                api_key: None,
                table: Some("reminders".to_string()),
                timeout_seconds: Some(10),
                page_size: Some(1000),
            },
            notifier: NotifierConfig {
                bot_token: None,
                base_url: Some("https://api.telegram.org".to_string()),
                timeout_seconds: Some(10),
            },
            schedule: ScheduleConfig {
                tick_seconds: Some(60),
                push_seconds: Some(120),
                zombie_sweep_seconds: None,
                retention_seconds: Some(3600),
            },
            sync: SyncConfig {
                pull_window_days: Some(30),
                zombie_batch_size: Some(900),
            },
            retention: RetentionConfig { keep_days: Some(7) },
            dispatch: DispatchConfig {
                chat_state_capacity: Some(1024),
                chat_state_idle_seconds: Some(86_400),
            },
        }
    }

    pub fn from_file(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();
        let raw = fs::read_to_string(path).map_err(|e| {
            ReminderSyncError::Config(format!(
                "Failed to read config file {}: {e}",
                path.to_string_lossy()
            ))
        })?;
        Self::from_json_str(&raw)
    }

    pub fn from_json_str(raw: &str) -> Result<Self> {
        let config: Config =
            serde_json::from_str(raw).map_err(|e| ReminderSyncError::Config(e.to_string()))?;
        config.validate()?;
        Ok(config)
    }

    /// Loads `path` when given, otherwise the convention defaults, then layers secrets from the
    /// environment on top.
    pub fn load(path: Option<&Path>) -> Result<Self> {
        let config = match path {
            Some(path) => Self::from_file(path)?,
            None => Self::convention_defaults(&crate::runtime_paths::default_db_path()),
        };
        Ok(config.resolve_env())
    }

    pub fn resolve_env(mut self) -> Self {
        if let Some(key) = non_empty_env(REMOTE_KEY_ENV) {
            self.remote.api_key = Some(key);
        }
        if let Some(token) = non_empty_env(BOT_TOKEN_ENV) {
            self.notifier.bot_token = Some(token);
        }
        self
    }

    pub fn validate(&self) -> Result<()> {
        let positive = [
            ("schedule.tick_seconds", self.schedule.tick_seconds),
            ("schedule.push_seconds", self.schedule.push_seconds),
            ("schedule.zombie_sweep_seconds", self.schedule.zombie_sweep_seconds),
            ("schedule.retention_seconds", self.schedule.retention_seconds),
            ("remote.timeout_seconds", self.remote.timeout_seconds),
            ("notifier.timeout_seconds", self.notifier.timeout_seconds),
        ];
        for (name, value) in positive {
            if value == Some(0) {
                return Err(ReminderSyncError::Config(format!("{name} must be positive")));
            }
        }
        if self.remote.page_size == Some(0) {
            return Err(ReminderSyncError::Config(
                "remote.page_size must be positive".to_string(),
            ));
        }
        if self.sync.zombie_batch_size == Some(0) {
            return Err(ReminderSyncError::Config(
                "sync.zombie_batch_size must be positive".to_string(),
            ));
        }
        if matches!(self.sync.pull_window_days, Some(days) if days <= 0) {
            return Err(ReminderSyncError::Config(
                "sync.pull_window_days must be positive".to_string(),
            ));
        }
        Ok(())
    }

    pub fn sqlite_path(&self) -> String {
        self.database
            .sqlite_path
            .as_deref()
            .map(str::trim)
            .filter(|path| !path.is_empty())
            .map(str::to_string)
            .unwrap_or_else(crate::runtime_paths::default_db_path)
    }

    pub fn remote_table(&self) -> String {
        self.remote
            .table
            .clone()
            .filter(|table| !table.trim().is_empty())
            .unwrap_or_else(|| "reminders".to_string())
    }

    pub fn remote_timeout(&self) -> Duration {
        Duration::from_secs(self.remote.timeout_seconds.unwrap_or(10))
    }

    pub fn remote_page_size(&self) -> usize {
        self.remote.page_size.unwrap_or(1000)
    }

    pub fn notifier_base_url(&self) -> String {
        self.notifier
            .base_url
            .clone()
            .unwrap_or_else(|| "https://api.telegram.org".to_string())
    }

    pub fn notifier_timeout(&self) -> Duration {
        Duration::from_secs(self.notifier.timeout_seconds.unwrap_or(10))
    }

    pub fn tick_interval(&self) -> Duration {
        Duration::from_secs(self.schedule.tick_seconds.unwrap_or(60))
    }

    pub fn push_interval(&self) -> Duration {
        Duration::from_secs(self.schedule.push_seconds.unwrap_or(120))
    }

    pub fn zombie_sweep_interval(&self) -> Option<Duration> {
        self.schedule.zombie_sweep_seconds.map(Duration::from_secs)
    }

    pub fn retention_interval(&self) -> Duration {
        Duration::from_secs(self.schedule.retention_seconds.unwrap_or(3600))
    }

    pub fn pull_window_seconds(&self) -> i64 {
        self.sync.pull_window_days.unwrap_or(30) * 86_400
    }

    pub fn zombie_batch_size(&self) -> usize {
        self.sync.zombie_batch_size.unwrap_or(900)
    }

    pub fn retention_keep_seconds(&self) -> i64 {
        self.retention.keep_days.unwrap_or(7).max(0) * 86_400
    }

    pub fn chat_state_capacity(&self) -> usize {
        self.dispatch.chat_state_capacity.unwrap_or(1024).max(1)
    }

    pub fn chat_state_idle_seconds(&self) -> i64 {
        self.dispatch.chat_state_idle_seconds.unwrap_or(86_400)
    }
}

fn non_empty_env(name: &str) -> Option<String> {
    std::env::var(name)
        .ok()
        .map(|value| value.trim().to_string())
        .filter(|value| !value.is_empty())
}
