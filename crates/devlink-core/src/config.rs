//! Configuration types for devlink

use crate::error::{Error, Result};
use crate::status::ProviderKind;
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::time::Duration;
use tracing::info;

/// Main configuration for devlink
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct Config {
    /// Server port
    pub port: u16,
    /// Externally reachable base URL embedded in static QR payloads
    pub public_url: Option<String>,
    /// Session lifetime in seconds
    pub session_ttl_secs: i64,
    /// How often a stream subscription re-reads the session store
    pub poll_interval_ms: u64,
    /// How often a stream subscription sends a keepalive frame
    pub heartbeat_interval_secs: u64,
    /// How long session creation waits for the first live QR payload
    pub connect_timeout_ms: u64,
    /// `ws://` URL of the remote pairing endpoint (live provider)
    pub live_endpoint: Option<String>,
    /// Connection attempts before the live provider gives up
    pub connect_attempts: u32,
    /// First retry delay for live connections
    pub backoff_base_ms: u64,
    /// Upper bound on the live retry delay
    pub backoff_max_ms: u64,
    /// Interval of the background expiry sweep, `None` for lazy expiry only
    pub sweep_interval_secs: Option<u64>,
    /// Directory for session, credential and device files
    pub data_dir: Option<PathBuf>,
    /// Provider used when a create request does not name one
    pub default_provider: ProviderKind,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            port: 8080,
            public_url: None,
            session_ttl_secs: 300,
            poll_interval_ms: 1500,
            heartbeat_interval_secs: 20,
            connect_timeout_ms: 5000,
            live_endpoint: None,
            connect_attempts: 4,
            backoff_base_ms: 250,
            backoff_max_ms: 4000,
            sweep_interval_secs: Some(30),
            data_dir: None,
            default_provider: ProviderKind::Static,
        }
    }
}

impl Config {
    /// Create a new configuration with default values
    pub fn new() -> Self {
        Self::default()
    }

    /// Load a configuration file (JSON). Missing fields take their defaults.
    pub fn load(path: &Path) -> Result<Self> {
        let contents = std::fs::read_to_string(path)?;
        let config: Config = serde_json::from_str(&contents)?;
        info!("Loaded configuration from {:?}", path);
        config.validate()?;
        Ok(config)
    }

    /// Reject settings that would make the lifecycle or gateway misbehave
    pub fn validate(&self) -> Result<()> {
        if self.session_ttl_secs <= 0 {
            return Err(Error::Config("session_ttl_secs must be positive".into()));
        }
        if self.poll_interval_ms == 0 || self.heartbeat_interval_secs == 0 {
            return Err(Error::Config(
                "poll and heartbeat intervals must be non-zero".into(),
            ));
        }
        if self.sweep_interval_secs == Some(0) {
            return Err(Error::Config(
                "sweep_interval_secs must be non-zero; omit it to disable sweeping".into(),
            ));
        }
        if self.connect_attempts == 0 {
            return Err(Error::Config("connect_attempts must be at least 1".into()));
        }
        if let Some(endpoint) = &self.live_endpoint {
            // No TLS connector is built in
            if !endpoint.starts_with("ws://") {
                return Err(Error::Config(format!(
                    "live_endpoint must be a ws:// URL, got {}",
                    endpoint
                )));
            }
        }
        Ok(())
    }

    /// Builder pattern: set port
    pub fn with_port(mut self, port: u16) -> Self {
        self.port = port;
        self
    }

    /// Builder pattern: set public URL
    pub fn with_public_url(mut self, url: impl Into<String>) -> Self {
        self.public_url = Some(url.into());
        self
    }

    /// Builder pattern: set session TTL
    pub fn with_session_ttl_secs(mut self, secs: i64) -> Self {
        self.session_ttl_secs = secs;
        self
    }

    /// Builder pattern: set gateway poll interval
    pub fn with_poll_interval_ms(mut self, ms: u64) -> Self {
        self.poll_interval_ms = ms;
        self
    }

    /// Builder pattern: set gateway heartbeat interval
    pub fn with_heartbeat_interval_secs(mut self, secs: u64) -> Self {
        self.heartbeat_interval_secs = secs;
        self
    }

    /// Builder pattern: set live connect timeout
    pub fn with_connect_timeout_ms(mut self, ms: u64) -> Self {
        self.connect_timeout_ms = ms;
        self
    }

    /// Builder pattern: set live endpoint
    pub fn with_live_endpoint(mut self, endpoint: impl Into<String>) -> Self {
        self.live_endpoint = Some(endpoint.into());
        self
    }

    /// Builder pattern: set live retry policy
    pub fn with_retry(mut self, attempts: u32, base_ms: u64, max_ms: u64) -> Self {
        self.connect_attempts = attempts;
        self.backoff_base_ms = base_ms;
        self.backoff_max_ms = max_ms;
        self
    }

    /// Builder pattern: set sweep interval
    pub fn with_sweep_interval_secs(mut self, secs: Option<u64>) -> Self {
        self.sweep_interval_secs = secs;
        self
    }

    /// Builder pattern: set data directory
    pub fn with_data_dir(mut self, dir: PathBuf) -> Self {
        self.data_dir = Some(dir);
        self
    }

    /// Builder pattern: set default provider
    pub fn with_default_provider(mut self, kind: ProviderKind) -> Self {
        self.default_provider = kind;
        self
    }

    pub fn session_ttl(&self) -> chrono::Duration {
        chrono::Duration::seconds(self.session_ttl_secs)
    }

    pub fn poll_interval(&self) -> Duration {
        Duration::from_millis(self.poll_interval_ms)
    }

    pub fn heartbeat_interval(&self) -> Duration {
        Duration::from_secs(self.heartbeat_interval_secs)
    }

    pub fn connect_timeout(&self) -> Duration {
        Duration::from_millis(self.connect_timeout_ms)
    }

    pub fn sweep_interval(&self) -> Option<Duration> {
        self.sweep_interval_secs.map(Duration::from_secs)
    }

    /// Base URL for static payloads, falling back to the local listener
    pub fn base_url(&self) -> String {
        self.public_url
            .clone()
            .unwrap_or_else(|| format!("http://localhost:{}", self.port))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults_are_valid() {
        let config = Config::default();
        assert!(config.validate().is_ok());
        assert_eq!(config.session_ttl(), chrono::Duration::seconds(300));
        assert_eq!(config.base_url(), "http://localhost:8080");
    }

    #[test]
    fn test_partial_file_uses_defaults() {
        let config: Config =
            serde_json::from_str(r#"{"port": 9000, "default_provider": "LIVE"}"#).unwrap();
        assert_eq!(config.port, 9000);
        assert_eq!(config.default_provider, ProviderKind::Live);
        assert_eq!(config.poll_interval_ms, 1500);
    }

    #[test]
    fn test_rejects_bad_endpoint() {
        let config = Config::new().with_live_endpoint("http://pairing.example");
        assert!(matches!(config.validate(), Err(Error::Config(_))));

        let config = Config::new().with_live_endpoint("wss://pairing.example");
        assert!(matches!(config.validate(), Err(Error::Config(_))));

        let config = Config::new().with_live_endpoint("ws://pairing.example:9000");
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_rejects_non_positive_ttl() {
        let config = Config::new().with_session_ttl_secs(0);
        assert!(config.validate().is_err());
    }
}
