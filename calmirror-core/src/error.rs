//! Error types for the calmirror engine.

use std::time::Duration;

use thiserror::Error;

/// Errors that can occur while mirroring calendars.
#[derive(Error, Debug)]
pub enum MirrorError {
    #[error("Configuration error: {0}")]
    Config(String),

    #[error("Calendar \"{0}\" not found")]
    CalendarNotFound(String),

    #[error("Multiple calendars ({count}) found for name \"{name}\"")]
    AmbiguousCalendar { name: String, count: usize },

    #[error("Calendar store error: {0}")]
    Store(String),

    #[error("Calendar store request timed out after {0}s")]
    StoreTimeout(u64),

    #[error("Provider '{0}' not found in PATH")]
    ProviderNotInstalled(String),

    #[error("Scheduling error: {0}")]
    Scheduling(String),

    #[error("Could not acquire the sync lock within {}", humantime::format_duration(*.0))]
    LockTimeout(Duration),

    #[error("Recurrence error: {0}")]
    Recurrence(String),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Serialization error: {0}")]
    Serialization(String),
}

impl MirrorError {
    /// Whether retrying the same call may succeed.
    pub fn is_transient(&self) -> bool {
        matches!(
            self,
            MirrorError::Store(_) | MirrorError::StoreTimeout(_) | MirrorError::Io(_)
        )
    }
}

impl From<serde_json::Error> for MirrorError {
    fn from(e: serde_json::Error) -> Self {
        MirrorError::Serialization(e.to_string())
    }
}

/// Result type alias for calmirror operations.
pub type MirrorResult<T> = Result<T, MirrorError>;
