//! Linked device records
//!
//! One record is produced per completed session. After creation the record
//! belongs to the account/auth side; the session subsystem never rewrites it.

use crate::profile::ProfileId;
use crate::session::SessionId;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// Unique identifier for a linked device
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct DeviceId(pub Uuid);

impl DeviceId {
    /// Generate a new random device ID
    pub fn new() -> Self {
        Self(Uuid::new_v4())
    }

    /// Create from an existing UUID string
    pub fn parse(s: &str) -> Result<Self, uuid::Error> {
        Ok(Self(Uuid::parse_str(s)?))
    }
}

impl Default for DeviceId {
    fn default() -> Self {
        Self::new()
    }
}

impl std::fmt::Display for DeviceId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// A device linked through a completed session
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LinkedDevice {
    pub id: DeviceId,
    pub tenant_id: Uuid,
    /// Profile the device acts on behalf of
    pub profile_id: ProfileId,
    /// Session that produced this device
    pub session_id: SessionId,
    /// Hash of the issued bearer credential
    pub credential_hash: String,
    /// Free-text device description captured at link time
    pub device_info: Option<String>,
    /// Platform hint derived from the device description
    pub device_type: DeviceType,
    pub linked_at: DateTime<Utc>,
    pub last_used_at: DateTime<Utc>,
}

impl LinkedDevice {
    /// Create a new device record for a completed session
    pub fn new(
        tenant_id: Uuid,
        profile_id: ProfileId,
        session_id: SessionId,
        credential_hash: String,
        device_info: Option<String>,
    ) -> Self {
        let now = Utc::now();
        let device_type = device_info
            .as_deref()
            .map(DeviceType::infer)
            .unwrap_or_default();
        Self {
            id: DeviceId::new(),
            tenant_id,
            profile_id,
            session_id,
            credential_hash,
            device_info,
            device_type,
            linked_at: now,
            last_used_at: now,
        }
    }
}

/// Type of device being linked
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum DeviceType {
    /// iOS device (iPhone, iPad)
    Ios,
    /// Android device
    Android,
    /// Web browser
    Browser,
    /// Desktop application
    Desktop,
    /// Unknown/other device
    #[default]
    Unknown,
}

impl DeviceType {
    /// Best-effort guess from a free-text description such as a user agent
    pub fn infer(description: &str) -> Self {
        let lower = description.to_lowercase();
        if ["iphone", "ipad", "ios"].iter().any(|k| lower.contains(k)) {
            Self::Ios
        } else if ["android", "pixel", "galaxy"].iter().any(|k| lower.contains(k)) {
            Self::Android
        } else if ["chrome", "firefox", "safari", "browser", "mozilla"]
            .iter()
            .any(|k| lower.contains(k))
        {
            Self::Browser
        } else if ["windows", "macos", "linux", "desktop"]
            .iter()
            .any(|k| lower.contains(k))
        {
            Self::Desktop
        } else {
            Self::Unknown
        }
    }
}

impl std::str::FromStr for DeviceType {
    type Err = ();

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_lowercase().as_str() {
            "ios" | "iphone" | "ipad" => Ok(Self::Ios),
            "android" => Ok(Self::Android),
            "browser" | "web" => Ok(Self::Browser),
            "desktop" => Ok(Self::Desktop),
            _ => Ok(Self::Unknown),
        }
    }
}

/// Summary information about a linked device for API responses
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DeviceSummary {
    pub id: String,
    pub tenant_id: Uuid,
    pub device_info: Option<String>,
    pub device_type: DeviceType,
    pub linked_at: DateTime<Utc>,
    pub last_used_at: DateTime<Utc>,
}

impl From<&LinkedDevice> for DeviceSummary {
    fn from(device: &LinkedDevice) -> Self {
        Self {
            id: device.id.to_string(),
            tenant_id: device.tenant_id,
            device_info: device.device_info.clone(),
            device_type: device.device_type,
            linked_at: device.linked_at,
            last_used_at: device.last_used_at,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_device_id_display_parses_back() {
        let id = DeviceId::new();
        assert_eq!(DeviceId::parse(&id.to_string()).unwrap(), id);
        assert!(DeviceId::parse("device-1").is_err());
    }

    #[test]
    fn test_device_creation_infers_type() {
        let device = LinkedDevice::new(
            Uuid::new_v4(),
            ProfileId::new(),
            SessionId::new(),
            "hash123".to_string(),
            Some("Mozilla/5.0 (iPhone; CPU iPhone OS 17_0)".to_string()),
        );
        assert_eq!(device.device_type, DeviceType::Ios);
        assert_eq!(device.linked_at, device.last_used_at);
    }

    #[test]
    fn test_device_type_inference() {
        assert_eq!(DeviceType::infer("Pixel 8 Pro"), DeviceType::Android);
        assert_eq!(DeviceType::infer("Firefox 128"), DeviceType::Browser);
        assert_eq!(DeviceType::infer("Ubuntu Linux"), DeviceType::Desktop);
        assert_eq!(DeviceType::infer("toaster"), DeviceType::Unknown);
    }

    #[test]
    fn test_device_type_parsing() {
        let parsed: Vec<DeviceType> = ["iPad", "ANDROID", "web", "desktop", "watch"]
            .iter()
            .map(|s| s.parse().unwrap())
            .collect();
        assert_eq!(
            parsed,
            vec![
                DeviceType::Ios,
                DeviceType::Android,
                DeviceType::Browser,
                DeviceType::Desktop,
                DeviceType::Unknown,
            ]
        );
    }
}
