//! Error types for devlink

use crate::status::SessionStatus;
use thiserror::Error;

/// Main error type for devlink operations
#[derive(Error, Debug)]
pub enum Error {
    #[error("Session not found: {0}")]
    NotFound(String),

    #[error("Session expired: {0}")]
    Expired(String),

    #[error("Cannot {action} a session in state {current}")]
    InvalidTransition {
        action: &'static str,
        current: SessionStatus,
    },

    #[error("Provider unavailable: {0}")]
    ProviderUnavailable(String),

    #[error("Concurrent update on session {0}")]
    Conflict(String),

    #[error("Storage error: {0}")]
    Storage(String),

    #[error("Configuration error: {0}")]
    Config(String),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("JSON serialization error: {0}")]
    Json(#[from] serde_json::Error),
}

/// Result type alias using devlink's Error
pub type Result<T> = std::result::Result<T, Error>;

impl Error {
    /// Create an invalid transition error carrying the state the caller hit
    pub fn invalid_transition(action: &'static str, current: SessionStatus) -> Self {
        Error::InvalidTransition { action, current }
    }

    /// The session state this error reports, if any
    pub fn current_status(&self) -> Option<SessionStatus> {
        match self {
            Error::InvalidTransition { current, .. } => Some(*current),
            Error::Expired(_) => Some(SessionStatus::Expired),
            _ => None,
        }
    }
}
