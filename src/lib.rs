pub mod config;
pub mod daemon;
pub mod db;
pub mod dispatch;
pub mod error;
pub mod interfaces;
pub mod jobs;
pub mod logging;
pub mod maintenance;
pub mod notifier;
pub mod reminders;
pub mod remote;
pub mod runtime_paths;
pub mod scheduler;
pub mod sync;

pub type Result<T> = std::result::Result<T, error::ReminderSyncError>;

pub const GIT_SHA: &str = env!("REMINDER_SYNC_GIT_SHA");
