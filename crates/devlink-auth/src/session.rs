//! Linking session records
//!
//! A session is a short-lived attempt to link a device. Its status moves
//! through the lattice defined by [`SessionStatus`]; every write goes through
//! a [`SessionChange`], whose constructors are the only way to produce a
//! credential or a terminal status.

use chrono::{DateTime, Duration, Utc};
use devlink_core::{ProviderKind, SessionStatus};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// Unique identifier for a session
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct SessionId(pub Uuid);

impl SessionId {
    /// Generate a new random session ID
    pub fn new() -> Self {
        Self(Uuid::new_v4())
    }

    /// Create from an existing UUID string
    pub fn parse(s: &str) -> Result<Self, uuid::Error> {
        Ok(Self(Uuid::parse_str(s)?))
    }
}

impl Default for SessionId {
    fn default() -> Self {
        Self::new()
    }
}

impl std::fmt::Display for SessionId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// A linking session
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Session {
    pub id: SessionId,
    /// Owning tenant
    pub tenant_id: Uuid,
    pub status: SessionStatus,
    /// Fixed at creation
    pub provider: ProviderKind,
    /// Current QR payload
    pub qr_payload: String,
    /// Free-text description of the requesting or linking device
    pub device_info: Option<String>,
    /// Bearer token issued on completion
    pub linked_credential: Option<String>,
    pub created_at: DateTime<Utc>,
    pub expires_at: DateTime<Utc>,
}

impl Session {
    /// Create a pending session that expires `ttl` from now
    pub fn new(
        tenant_id: Uuid,
        provider: ProviderKind,
        device_info: Option<String>,
        ttl: Duration,
    ) -> Self {
        let now = Utc::now();
        Self {
            id: SessionId::new(),
            tenant_id,
            status: SessionStatus::Pending,
            provider,
            qr_payload: String::new(),
            device_info,
            linked_credential: None,
            created_at: now,
            expires_at: now + ttl,
        }
    }

    pub fn is_terminal(&self) -> bool {
        self.status.is_terminal()
    }

    /// Seconds left before the deadline, never negative
    pub fn expires_in(&self, now: DateTime<Utc>) -> i64 {
        (self.expires_at - now).num_seconds().max(0)
    }
}

/// A single write to a session record
///
/// Status-changing variants always carry everything the target state
/// requires, so a credential can only appear together with `Completed`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SessionChange {
    /// `Pending` -> `Scanned`
    Scanned,
    /// `Scanned` -> `Completed`
    Completed {
        credential: String,
        device_info: Option<String>,
    },
    /// Any non-terminal -> `Expired`
    Expired,
    /// `Scanned` -> `Cancelled`
    Cancelled,
    /// Replace the QR payload; status unchanged
    QrRotated(String),
}

impl SessionChange {
    /// Status the session ends up in after this change
    pub fn target_status(&self, current: SessionStatus) -> SessionStatus {
        match self {
            SessionChange::Scanned => SessionStatus::Scanned,
            SessionChange::Completed { .. } => SessionStatus::Completed,
            SessionChange::Expired => SessionStatus::Expired,
            SessionChange::Cancelled => SessionStatus::Cancelled,
            SessionChange::QrRotated(_) => current,
        }
    }

    /// Apply to a record. Callers check preconditions first; terminal
    /// sessions are left untouched regardless.
    pub fn apply(self, session: &mut Session) {
        if session.is_terminal() {
            return;
        }
        match self {
            SessionChange::Scanned => session.status = SessionStatus::Scanned,
            SessionChange::Completed {
                credential,
                device_info,
            } => {
                session.status = SessionStatus::Completed;
                session.linked_credential = Some(credential);
                if device_info.is_some() {
                    session.device_info = device_info;
                }
            }
            SessionChange::Expired => session.status = SessionStatus::Expired,
            SessionChange::Cancelled => session.status = SessionStatus::Cancelled,
            SessionChange::QrRotated(payload) => session.qr_payload = payload,
        }
    }
}
