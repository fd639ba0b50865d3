//! Stream protocol message types

use crate::status::SessionStatus;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// Frames pushed to a stream subscriber
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum StreamFrame {
    /// Current session status
    Status {
        status: SessionStatus,
        expires_at: DateTime<Utc>,
    },
    /// QR payload to display (initial or rotated)
    Qr { payload: String },
    /// Session completed; the stream closes after this frame
    Linked {
        credential: String,
        #[serde(skip_serializing_if = "Option::is_none")]
        device_info: Option<String>,
    },
    /// Session expired or was cancelled; the stream closes after this frame
    End { status: SessionStatus },
    /// The live pairing connection went away before pairing
    ProviderClosed { reason: String },
    /// Keepalive
    Ping { timestamp: u64 },
}

impl StreamFrame {
    /// Whether the stream closes after this frame
    pub fn is_terminal(&self) -> bool {
        matches!(self, StreamFrame::Linked { .. } | StreamFrame::End { .. })
    }
}
