//! Live pairing provider
//!
//! Keeps a WebSocket open to a remote pairing endpoint for the lifetime of a
//! session. Frames are JSON objects tagged by `type`.
//!
//! Client to remote:
//! - `hello { session_id, tenant_id, device_info, resume }` where `resume`
//!   maps each persisted key type to its material
//!
//! Remote to client:
//! - `qr { payload }` new QR code content
//! - `creds { key_type, material }` handshake state, handed on as
//!   [`ProviderEvent::Credentials`] for the owner to persist
//! - `paired { device_info }` the device completed pairing
//! - `close { reason }` the remote gave up
//!
//! The connection is closed with a WebSocket close frame when the owning
//! [`ProviderConnection`] is closed or dropped.

use crate::error::{ProviderError, ProviderResult};
use crate::{AttachRequest, CloseReason, ProviderConnection, ProviderEvent};
use devlink_auth::CredentialStore;
use devlink_core::Config;
use futures::{SinkExt, StreamExt};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::sync::Arc;
use std::time::Duration;
use tokio::net::TcpStream;
use tokio::sync::{mpsc, oneshot};
use tokio_tungstenite::tungstenite::Message;
use tokio_tungstenite::{connect_async, MaybeTlsStream, WebSocketStream};
use tracing::{debug, info, warn};

type Socket = WebSocketStream<MaybeTlsStream<TcpStream>>;

/// Buffered events per connection
const EVENT_BUFFER: usize = 16;

/// Bounded exponential backoff for connection establishment
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RetryPolicy {
    /// Total connection attempts, at least one
    pub attempts: u32,
    pub base: Duration,
    pub max: Duration,
}

impl RetryPolicy {
    /// Delay before retry number `retry` (zero-based)
    pub fn delay(&self, retry: u32) -> Duration {
        let factor = 1u32.checked_shl(retry).unwrap_or(u32::MAX);
        self.base.saturating_mul(factor).min(self.max)
    }
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            attempts: 4,
            base: Duration::from_millis(250),
            max: Duration::from_secs(4),
        }
    }
}

impl From<&Config> for RetryPolicy {
    fn from(config: &Config) -> Self {
        Self {
            attempts: config.connect_attempts.max(1),
            base: Duration::from_millis(config.backoff_base_ms),
            max: Duration::from_millis(config.backoff_max_ms),
        }
    }
}

#[derive(Debug, Serialize)]
#[serde(tag = "type", rename_all = "snake_case")]
enum ClientFrame {
    Hello {
        session_id: String,
        tenant_id: String,
        device_info: Option<String>,
        resume: BTreeMap<String, String>,
    },
}

#[derive(Debug, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
enum RemoteFrame {
    Qr {
        payload: String,
    },
    Creds {
        key_type: String,
        material: String,
    },
    Paired {
        #[serde(default)]
        device_info: Option<String>,
    },
    Close {
        #[serde(default)]
        reason: Option<String>,
    },
    #[serde(other)]
    Unknown,
}

/// Connects sessions to a remote pairing endpoint
#[derive(Clone)]
pub struct LiveProvider {
    endpoint: String,
    /// Read only, for resume material
    credentials: Arc<dyn CredentialStore>,
    retry: RetryPolicy,
}

impl LiveProvider {
    pub fn new(
        endpoint: impl Into<String>,
        credentials: Arc<dyn CredentialStore>,
    ) -> ProviderResult<Self> {
        let endpoint = endpoint.into();
        if !endpoint.starts_with("ws://") {
            return Err(ProviderError::InvalidEndpoint(endpoint));
        }
        Ok(Self {
            endpoint,
            credentials,
            retry: RetryPolicy::default(),
        })
    }

    /// Builder pattern: set connection retry policy
    pub fn with_retry(mut self, retry: RetryPolicy) -> Self {
        self.retry = retry;
        self
    }

    pub fn endpoint(&self) -> &str {
        &self.endpoint
    }

    pub fn retry(&self) -> RetryPolicy {
        self.retry
    }

    /// Open a connection for a session in the background
    pub fn connect(&self, request: AttachRequest) -> ProviderConnection {
        let (events_tx, events_rx) = mpsc::channel(EVENT_BUFFER);
        let (shutdown_tx, shutdown_rx) = oneshot::channel();
        let task = tokio::spawn(run_connection(
            self.clone(),
            request,
            events_tx,
            shutdown_rx,
        ));
        ProviderConnection::new(events_rx, shutdown_tx, task)
    }

    async fn hello(&self, request: &AttachRequest) -> String {
        let resume = match self.credentials.load(&request.session_id).await {
            Ok(records) => records
                .into_iter()
                .map(|r| (r.key_type, r.material))
                .collect(),
            Err(e) => {
                warn!(
                    "Failed to load credential records for session {}: {}",
                    request.session_id, e
                );
                BTreeMap::new()
            }
        };
        let frame = ClientFrame::Hello {
            session_id: request.session_id.to_string(),
            tenant_id: request.tenant_id.to_string(),
            device_info: request.device_info.clone(),
            resume,
        };
        // Plain strings and maps always serialize
        serde_json::to_string(&frame).unwrap_or_default()
    }
}

enum Connect {
    Open(Box<Socket>),
    Failed(String),
    Shutdown,
}

async fn connect_with_retry(
    provider: &LiveProvider,
    shutdown: &mut oneshot::Receiver<()>,
) -> Connect {
    let attempts = provider.retry.attempts.max(1);
    let mut last_error = String::new();

    for attempt in 0..attempts {
        if attempt > 0 {
            let delay = provider.retry.delay(attempt - 1);
            debug!("Retrying live connection in {:?}", delay);
            tokio::select! {
                _ = tokio::time::sleep(delay) => {}
                _ = &mut *shutdown => return Connect::Shutdown,
            }
        }

        tokio::select! {
            result = connect_async(provider.endpoint.as_str()) => match result {
                Ok((socket, _)) => return Connect::Open(Box::new(socket)),
                Err(e) => {
                    warn!(
                        "Live connect attempt {}/{} to {} failed: {}",
                        attempt + 1, attempts, provider.endpoint, e
                    );
                    last_error = e.to_string();
                }
            },
            _ = &mut *shutdown => return Connect::Shutdown,
        }
    }

    Connect::Failed(last_error)
}

async fn run_connection(
    provider: LiveProvider,
    request: AttachRequest,
    events: mpsc::Sender<ProviderEvent>,
    mut shutdown: oneshot::Receiver<()>,
) {
    let session_id = request.session_id.clone();
    let mut socket = match connect_with_retry(&provider, &mut shutdown).await {
        Connect::Open(socket) => *socket,
        Connect::Failed(reason) => {
            let _ = events
                .send(ProviderEvent::Closed(CloseReason::ConnectFailed(reason)))
                .await;
            return;
        }
        Connect::Shutdown => return,
    };
    info!("Live provider connected for session {}", session_id);

    let hello = provider.hello(&request).await;
    if let Err(e) = socket.send(Message::Text(hello)).await {
        let _ = events
            .send(ProviderEvent::Closed(CloseReason::Protocol(format!(
                "hello failed: {}",
                e
            ))))
            .await;
        return;
    }

    loop {
        let message = tokio::select! {
            _ = &mut shutdown => {
                debug!("Closing live connection for session {}", session_id);
                let _ = socket.close(None).await;
                return;
            }
            message = socket.next() => message,
        };

        let event = match message {
            Some(Ok(Message::Text(text))) => {
                match handle_frame(&text) {
                    Ok(Some(event)) => event,
                    Ok(None) => continue,
                    Err(reason) => ProviderEvent::Closed(reason),
                }
            }
            Some(Ok(Message::Close(frame))) => {
                let reason = frame
                    .map(|f| f.reason.to_string())
                    .filter(|r| !r.is_empty())
                    .unwrap_or_else(|| "closed by remote".to_string());
                ProviderEvent::Closed(CloseReason::Remote(reason))
            }
            Some(Ok(_)) => continue,
            Some(Err(e)) => ProviderEvent::Closed(CloseReason::Remote(e.to_string())),
            None => ProviderEvent::Closed(CloseReason::Remote("connection lost".to_string())),
        };

        let terminal = event.is_terminal();
        if events.send(event).await.is_err() {
            debug!("Live connection for session {} has no listener", session_id);
            let _ = socket.close(None).await;
            return;
        }
        if terminal {
            let _ = socket.close(None).await;
            info!("Live provider finished for session {}", session_id);
            return;
        }
    }
}

fn handle_frame(text: &str) -> Result<Option<ProviderEvent>, CloseReason> {
    let frame: RemoteFrame = serde_json::from_str(text)
        .map_err(|e| CloseReason::Protocol(format!("malformed frame: {}", e)))?;

    match frame {
        RemoteFrame::Qr { payload } => Ok(Some(ProviderEvent::QrRotated(payload))),
        RemoteFrame::Creds { key_type, material } => {
            Ok(Some(ProviderEvent::Credentials { key_type, material }))
        }
        RemoteFrame::Paired { device_info } => Ok(Some(ProviderEvent::Paired { device_info })),
        RemoteFrame::Close { reason } => Ok(Some(ProviderEvent::Closed(CloseReason::Remote(
            reason.unwrap_or_else(|| "closed by remote".to_string()),
        )))),
        RemoteFrame::Unknown => {
            debug!("Ignoring unknown live frame: {}", text);
            Ok(None)
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use devlink_auth::CredentialStorage;

    #[test]
    fn test_backoff_is_bounded() {
        let policy = RetryPolicy {
            attempts: 8,
            base: Duration::from_millis(100),
            max: Duration::from_millis(500),
        };
        assert_eq!(policy.delay(0), Duration::from_millis(100));
        assert_eq!(policy.delay(1), Duration::from_millis(200));
        assert_eq!(policy.delay(2), Duration::from_millis(400));
        assert_eq!(policy.delay(3), Duration::from_millis(500));
        assert_eq!(policy.delay(40), Duration::from_millis(500));
    }

    #[test]
    fn test_policy_from_config() {
        let config = Config::default().with_retry(0, 50, 800);
        let policy = RetryPolicy::from(&config);
        assert_eq!(policy.attempts, 1);
        assert_eq!(policy.base, Duration::from_millis(50));
        assert_eq!(policy.max, Duration::from_millis(800));
    }

    #[test]
    fn test_endpoint_scheme_checked() {
        let store = Arc::new(CredentialStorage::in_memory());
        assert!(LiveProvider::new("ws://localhost:9000", store.clone()).is_ok());
        assert!(matches!(
            LiveProvider::new("http://localhost:9000", store.clone()),
            Err(ProviderError::InvalidEndpoint(_))
        ));
        assert!(matches!(
            LiveProvider::new("wss://localhost:9000", store),
            Err(ProviderError::InvalidEndpoint(_))
        ));
    }

    #[test]
    fn test_remote_frames_parse() {
        let frame: RemoteFrame =
            serde_json::from_str(r#"{"type":"qr","payload":"2@abc"}"#).unwrap();
        assert!(matches!(frame, RemoteFrame::Qr { payload } if payload == "2@abc"));

        let frame: RemoteFrame = serde_json::from_str(r#"{"type":"paired"}"#).unwrap();
        assert!(matches!(frame, RemoteFrame::Paired { device_info: None }));

        let frame: RemoteFrame = serde_json::from_str(r#"{"type":"presence"}"#).unwrap();
        assert!(matches!(frame, RemoteFrame::Unknown));
    }

    #[test]
    fn test_creds_frame_becomes_event() {
        let event = handle_frame(r#"{"type":"creds","key_type":"noise","material":"abc"}"#);
        assert_eq!(
            event,
            Ok(Some(ProviderEvent::Credentials {
                key_type: "noise".into(),
                material: "abc".into(),
            }))
        );
        assert!(!event.unwrap().unwrap().is_terminal());

        assert!(matches!(
            handle_frame("{not json"),
            Err(CloseReason::Protocol(_))
        ));
    }
}
