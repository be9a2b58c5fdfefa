//! Error handling module

use thiserror::Error;

#[derive(Error, Debug)]
pub enum CompanionError {
    #[error("Malformed agent URL: {0}")]
    UrlConstruction(String),

    #[error("Payload encoding failed: {0}")]
    Encoding(String),

    #[error("Transport error: {0}")]
    Transport(String),

    #[error("Protocol error: {0}")]
    Protocol(String),

    #[error("Sync failed: {0}")]
    Sync(String),

    #[error("Persistence error: {0}")]
    Persistence(String),
}

impl CompanionError {
    /// Sync and transport failures leave state consistent and may be retried.
    pub fn is_retryable(&self) -> bool {
        matches!(self, CompanionError::Sync(_) | CompanionError::Transport(_))
    }
}
