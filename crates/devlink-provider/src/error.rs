//! Provider configuration errors
//!
//! Failures of a running connection are not errors; they arrive as
//! [`crate::ProviderEvent::Closed`] on the connection's event channel.

use thiserror::Error;

#[derive(Debug, Error)]
pub enum ProviderError {
    #[error("Invalid live endpoint '{0}': expected a ws:// URL")]
    InvalidEndpoint(String),

    #[error("Live provider is not configured")]
    NotConfigured,
}

pub type ProviderResult<T> = Result<T, ProviderError>;

impl From<ProviderError> for devlink_core::Error {
    fn from(err: ProviderError) -> Self {
        devlink_core::Error::ProviderUnavailable(err.to_string())
    }
}
