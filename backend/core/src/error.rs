use thiserror::Error;

/// Top-level error type shared by the netwarden crates.
#[derive(Debug, Error)]
pub enum NetwardenError {
    #[error("not found: {0}")]
    NotFound(String),

    #[error("storage error: {0}")]
    StorageError(String),

    #[error("notification channel error: {0}")]
    ChannelError(String),

    #[error("message too large ({size} bytes, limit {limit})")]
    MessageTooLarge { size: usize, limit: usize },

    #[error("configuration error: {0}")]
    ConfigError(String),

    #[error("invalid job: {0}")]
    InvalidJob(String),

    #[error(transparent)]
    Other(#[from] anyhow::Error),
}

impl NetwardenError {
    /// Connection-level failures are retried by the caller; everything else is a data error.
    pub fn is_transient(&self) -> bool {
        matches!(self, Self::StorageError(_) | Self::ChannelError(_))
    }
}
