//! Live provider handshake material
//!
//! The remote pairing protocol negotiates keys incrementally. Each piece is
//! stored under `(session_id, key_type)` as soon as it arrives so a restarted
//! process can reopen the connection without a fresh scan.

use crate::session::SessionId;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// One piece of opaque handshake state
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CredentialRecord {
    pub session_id: SessionId,
    /// Protocol-defined key name (e.g. "noise-key", "signed-identity")
    pub key_type: String,
    /// Opaque material, stored verbatim
    pub material: String,
    pub updated_at: DateTime<Utc>,
}

impl CredentialRecord {
    pub fn new(
        session_id: SessionId,
        key_type: impl Into<String>,
        material: impl Into<String>,
    ) -> Self {
        Self {
            session_id,
            key_type: key_type.into(),
            material: material.into(),
            updated_at: Utc::now(),
        }
    }

    /// Storage key for this record
    pub(crate) fn storage_key(&self) -> String {
        record_key(&self.session_id, &self.key_type)
    }
}

pub(crate) fn record_key(session_id: &SessionId, key_type: &str) -> String {
    format!("{}/{}", session_id, key_type)
}
