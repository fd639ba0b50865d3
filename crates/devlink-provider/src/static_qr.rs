//! Fixed QR payload provider
//!
//! The payload is computed once from the session and never changes. The
//! scanning device calls back into the server at `url` to report the scan
//! and finalize.

use crate::AttachRequest;

/// Produces a `devlink://link?...` deep link for a session
#[derive(Debug, Clone)]
pub struct StaticProvider {
    base_url: String,
}

impl StaticProvider {
    pub fn new(base_url: impl Into<String>) -> Self {
        Self {
            base_url: base_url.into(),
        }
    }

    pub fn base_url(&self) -> &str {
        &self.base_url
    }

    /// Payload encoded into the QR code
    pub fn payload(&self, request: &AttachRequest) -> String {
        let mut payload = format!(
            "devlink://link?url={}&session={}&tenant={}",
            urlencoding::encode(&self.base_url),
            request.session_id,
            request.tenant_id
        );
        if let Some(device) = &request.device_info {
            payload.push_str("&device=");
            payload.push_str(&urlencoding::encode(device));
        }
        payload
    }
}
