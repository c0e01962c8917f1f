//! Error types for scheduler operations.

use thiserror::Error;

use crate::util::JobId;

/// Errors produced by scheduler components.
#[derive(Debug, Error)]
pub enum SchedulerError {
    /// Caller supplied something that can never succeed; not retried.
    #[error("invalid argument `{name}`: {message}")]
    InvalidArgument {
        /// Name of the offending argument or field.
        name: String,
        /// What is wrong with it.
        message: String,
    },
    /// Job does not exist in the job repository.
    #[error("job not found: {0}")]
    JobNotFound(JobId),
    /// Queue does not exist in the queue repository.
    #[error("queue not found: {0}")]
    QueueNotFound(String),
    /// Optimistic-concurrency retries were exhausted.
    #[error("concurrent update conflict: {0}")]
    Conflict(String),
    /// Store or broker call did not complete in time.
    #[error("operation timed out")]
    Timeout,
    /// Backend-specific failure with context.
    #[error("backend error: {0}")]
    Backend(String),
    /// A required backend could not be reached at process start.
    #[error("startup failure: {0}")]
    Startup(String),
}

impl SchedulerError {
    /// Shorthand for [`SchedulerError::InvalidArgument`].
    pub fn invalid(name: impl Into<String>, message: impl Into<String>) -> Self {
        Self::InvalidArgument {
            name: name.into(),
            message: message.into(),
        }
    }

    /// Whether the failure is infrastructure-related and worth retrying on the next tick.
    pub const fn is_transient(&self) -> bool {
        matches!(self, Self::Backend(_) | Self::Timeout | Self::Conflict(_))
    }
}

impl From<serde_json::Error> for SchedulerError {
    fn from(err: serde_json::Error) -> Self {
        Self::Backend(format!("serialization: {err}"))
    }
}

impl From<std::io::Error> for SchedulerError {
    fn from(err: std::io::Error) -> Self {
        Self::Backend(err.to_string())
    }
}

/// Application-facing result using anyhow for higher-level contexts.
pub type AppResult<T> = Result<T, anyhow::Error>;
