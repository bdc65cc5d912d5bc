use thiserror::Error;

#[derive(Debug, Error)]
pub enum ReminderSyncError {
    #[error("configuration error: {0}")]
    Config(String),
    #[error("http error: {0}")]
    Http(String),
    #[error("serialization error: {0}")]
    Serialization(String),
    #[error("runtime error: {0}")]
    Runtime(String),
    /// A local SQLite write did not commit. The caller owns the retry.
    #[error("local write failed: {0}")]
    LocalWrite(String),
    #[error("remote store unavailable: {0}")]
    RemoteUnavailable(String),
    #[error("remote store rejected the request: {0}")]
    RemoteRejected(String),
}

impl ReminderSyncError {
    /// Transient failures leave sync state untouched so the next cycle retries.
    pub fn is_transient(&self) -> bool {
        matches!(
            self,
            ReminderSyncError::RemoteUnavailable(_) | ReminderSyncError::Http(_)
        )
    }

    pub fn is_rejection(&self) -> bool {
        matches!(self, ReminderSyncError::RemoteRejected(_))
    }
}

pub use crate::Result;

pub(crate) fn local_write(err: diesel::result::Error) -> ReminderSyncError {
    ReminderSyncError::LocalWrite(err.to_string())
}
