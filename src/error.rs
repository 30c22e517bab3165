use std::time::Duration;

use thiserror::Error;

/// Failure taxonomy for the ingestion pipeline.
///
/// `Config` and `Auth` are fatal. `Transport`, `Storage`, `Download`,
/// `RateLimited` and `Timeout` are retried by [`crate::retry::RetryPolicy`].
/// `MalformedEvent` is per-event: the event is logged and dropped.
#[derive(Debug, Error)]
pub enum IngestError {
    #[error("configuration error: {0}")]
    Config(String),

    #[error("authentication failed: {0}")]
    Auth(String),

    #[error("transport error: {0}")]
    Transport(String),

    #[error("malformed event: {0}")]
    MalformedEvent(String),

    #[error("storage error: {0}")]
    Storage(String),

    #[error("download failed: {0}")]
    Download(String),

    /// The provider asked us to wait before the next request
    #[error("rate limited, retry after {retry_after:?}")]
    RateLimited { retry_after: Duration },

    #[error("{operation} timed out after {after:?}")]
    Timeout { operation: String, after: Duration },
}

impl IngestError {
    pub fn config(message: impl Into<String>) -> Self {
        Self::Config(message.into())
    }

    pub fn transport(message: impl Into<String>) -> Self {
        Self::Transport(message.into())
    }

    pub fn malformed(message: impl Into<String>) -> Self {
        Self::MalformedEvent(message.into())
    }

    pub fn storage(message: impl Into<String>) -> Self {
        Self::Storage(message.into())
    }

    pub fn download(message: impl Into<String>) -> Self {
        Self::Download(message.into())
    }

    /// Default retry classification.
    pub fn is_retryable(&self) -> bool {
        matches!(
            self,
            Self::Transport(_)
                | Self::Storage(_)
                | Self::Download(_)
                | Self::RateLimited { .. }
                | Self::Timeout { .. }
        )
    }

    /// Minimum wait the provider requested before retrying, if any.
    pub fn retry_after(&self) -> Option<Duration> {
        match self {
            Self::RateLimited { retry_after } => Some(*retry_after),
            _ => None,
        }
    }

    /// Errors that must stop the process.
    pub fn is_fatal(&self) -> bool {
        matches!(self, Self::Config(_) | Self::Auth(_))
    }
}

impl From<rusqlite::Error> for IngestError {
    fn from(err: rusqlite::Error) -> Self {
        Self::Storage(err.to_string())
    }
}

impl From<std::io::Error> for IngestError {
    fn from(err: std::io::Error) -> Self {
        Self::Download(err.to_string())
    }
}

pub type Result<T> = std::result::Result<T, IngestError>;
