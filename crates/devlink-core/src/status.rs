//! Session status and provider kind shared across devlink crates

use serde::{Deserialize, Serialize};

/// Lifecycle state of a linking session
///
/// `Pending` is the initial state. `Completed`, `Expired` and `Cancelled`
/// are terminal: once reached, nothing about the session changes again.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum SessionStatus {
    /// Waiting for the QR code to be scanned
    Pending,
    /// Scanned, waiting for finalization
    Scanned,
    /// Linked; a credential was issued
    Completed,
    /// Deadline passed before completion
    Expired,
    /// Aborted by the client after scanning
    Cancelled,
}

impl SessionStatus {
    /// Whether no further transition is possible from this state
    pub fn is_terminal(self) -> bool {
        matches!(
            self,
            SessionStatus::Completed | SessionStatus::Expired | SessionStatus::Cancelled
        )
    }

    /// Position in the status lattice. Observable status never decreases.
    pub fn rank(self) -> u8 {
        match self {
            SessionStatus::Pending => 0,
            SessionStatus::Scanned => 1,
            SessionStatus::Completed | SessionStatus::Expired | SessionStatus::Cancelled => 2,
        }
    }

    pub fn as_str(self) -> &'static str {
        match self {
            SessionStatus::Pending => "PENDING",
            SessionStatus::Scanned => "SCANNED",
            SessionStatus::Completed => "COMPLETED",
            SessionStatus::Expired => "EXPIRED",
            SessionStatus::Cancelled => "CANCELLED",
        }
    }
}

impl std::fmt::Display for SessionStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Which provider strategy supplies the QR payload for a session
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum ProviderKind {
    /// One fixed payload, scan and link driven by explicit calls
    #[default]
    Static,
    /// Remote pairing endpoint that rotates the payload and reports pairing
    Live,
}

/// What a provider kind is able to do
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct Capabilities {
    /// The QR payload may change after creation
    pub supports_rotation: bool,
    /// Events arrive asynchronously from a background connection
    pub is_async: bool,
}

impl ProviderKind {
    pub fn capabilities(self) -> Capabilities {
        match self {
            ProviderKind::Static => Capabilities {
                supports_rotation: false,
                is_async: false,
            },
            ProviderKind::Live => Capabilities {
                supports_rotation: true,
                is_async: true,
            },
        }
    }

    pub fn as_str(self) -> &'static str {
        match self {
            ProviderKind::Static => "STATIC",
            ProviderKind::Live => "LIVE",
        }
    }
}

impl std::fmt::Display for ProviderKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

impl std::str::FromStr for ProviderKind {
    type Err = String;

    fn from_str(s: &str) -> std::result::Result<Self, Self::Err> {
        match s.to_lowercase().as_str() {
            "static" => Ok(ProviderKind::Static),
            "live" => Ok(ProviderKind::Live),
            _ => Err(format!("Invalid provider: {}. Use: static, live", s)),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_terminal_states() {
        assert!(!SessionStatus::Pending.is_terminal());
        assert!(!SessionStatus::Scanned.is_terminal());
        assert!(SessionStatus::Completed.is_terminal());
        assert!(SessionStatus::Expired.is_terminal());
        assert!(SessionStatus::Cancelled.is_terminal());
    }

    #[test]
    fn test_rank_is_monotonic() {
        assert!(SessionStatus::Pending.rank() < SessionStatus::Scanned.rank());
        assert!(SessionStatus::Scanned.rank() < SessionStatus::Completed.rank());
        assert_eq!(SessionStatus::Expired.rank(), SessionStatus::Cancelled.rank());
    }

    #[test]
    fn test_status_serialization() {
        let json = serde_json::to_string(&SessionStatus::Scanned).unwrap();
        assert_eq!(json, "\"SCANNED\"");
        let parsed: SessionStatus = serde_json::from_str("\"CANCELLED\"").unwrap();
        assert_eq!(parsed, SessionStatus::Cancelled);
    }

    #[test]
    fn test_provider_capabilities() {
        assert!(!ProviderKind::Static.capabilities().supports_rotation);
        assert!(ProviderKind::Live.capabilities().supports_rotation);
        assert!(ProviderKind::Live.capabilities().is_async);
        assert_eq!("LIVE".parse::<ProviderKind>().unwrap(), ProviderKind::Live);
        assert!("carrier-pigeon".parse::<ProviderKind>().is_err());
    }
}
