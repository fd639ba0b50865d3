//! devlink Provider - QR payload sources
//!
//! A session's provider is fixed at creation:
//!
//! - [`StaticProvider`] computes one payload up front; nothing to attach.
//! - [`LiveProvider`] holds a connection to a remote pairing endpoint that
//!   rotates the QR code and reports when a device has paired.
//!
//! Live connections deliver [`ProviderEvent`]s in order on one channel:
//! zero or more `QrRotated` and `Credentials`, then exactly one `Paired` or
//! `Closed`. Providers never write credential records themselves; the
//! receiver persists `Credentials` while the session is still open.

pub mod error;
pub mod live;
pub mod static_qr;

pub use error::{ProviderError, ProviderResult};
pub use live::{LiveProvider, RetryPolicy};
pub use static_qr::StaticProvider;

use devlink_auth::{Session, SessionId};
use devlink_core::{Capabilities, ProviderKind};
use std::time::Duration;
use tokio::sync::{mpsc, oneshot};
use tokio::task::JoinHandle;
use tracing::warn;
use uuid::Uuid;

/// Payload shown while a live session waits for its first QR code
pub const CONNECTING_PAYLOAD: &str = "connecting";

/// How long `ProviderConnection::close` waits for the socket to shut down
const CLOSE_GRACE: Duration = Duration::from_secs(2);

/// Why a live connection ended without pairing
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum CloseReason {
    /// Remote side closed or the socket dropped
    Remote(String),
    /// All connection attempts failed
    ConnectFailed(String),
    /// Remote sent something we could not understand
    Protocol(String),
}

impl std::fmt::Display for CloseReason {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            CloseReason::Remote(reason) => write!(f, "remote closed: {}", reason),
            CloseReason::ConnectFailed(reason) => write!(f, "connect failed: {}", reason),
            CloseReason::Protocol(reason) => write!(f, "protocol error: {}", reason),
        }
    }
}

/// Event from a live connection
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ProviderEvent {
    QrRotated(String),
    /// Handshake material to store under `(session, key_type)`
    Credentials { key_type: String, material: String },
    Paired { device_info: Option<String> },
    Closed(CloseReason),
}

impl ProviderEvent {
    pub fn is_terminal(&self) -> bool {
        matches!(self, ProviderEvent::Paired { .. } | ProviderEvent::Closed(_))
    }
}

/// Session parameters handed to a provider
#[derive(Debug, Clone)]
pub struct AttachRequest {
    pub session_id: SessionId,
    pub tenant_id: Uuid,
    pub device_info: Option<String>,
}

impl From<&Session> for AttachRequest {
    fn from(session: &Session) -> Self {
        Self {
            session_id: session.id.clone(),
            tenant_id: session.tenant_id,
            device_info: session.device_info.clone(),
        }
    }
}

/// Result of attaching a provider to a session
pub enum Attachment {
    /// Final payload, nothing to supervise
    Ready(String),
    /// Live connection that will report its own events
    Connecting(ProviderConnection),
}

/// Provider selected for a session
#[derive(Clone)]
pub enum Provider {
    Static(StaticProvider),
    Live(LiveProvider),
}

impl Provider {
    pub fn kind(&self) -> ProviderKind {
        match self {
            Provider::Static(_) => ProviderKind::Static,
            Provider::Live(_) => ProviderKind::Live,
        }
    }

    pub fn capabilities(&self) -> Capabilities {
        self.kind().capabilities()
    }

    /// Payload stored when the session is created
    pub fn initial_payload(&self, request: &AttachRequest) -> String {
        match self {
            Provider::Static(provider) => provider.payload(request),
            Provider::Live(_) => CONNECTING_PAYLOAD.to_string(),
        }
    }

    /// Attach to a stored session
    pub fn attach(&self, request: &AttachRequest) -> Attachment {
        match self {
            Provider::Static(provider) => Attachment::Ready(provider.payload(request)),
            Provider::Live(provider) => Attachment::Connecting(provider.connect(request.clone())),
        }
    }
}

/// Handle to a running live connection
///
/// Dropping the handle closes the socket in the background; [`close`]
/// does the same and waits for it.
///
/// [`close`]: ProviderConnection::close
pub struct ProviderConnection {
    events: mpsc::Receiver<ProviderEvent>,
    shutdown: Option<oneshot::Sender<()>>,
    task: JoinHandle<()>,
}

impl ProviderConnection {
    pub(crate) fn new(
        events: mpsc::Receiver<ProviderEvent>,
        shutdown: oneshot::Sender<()>,
        task: JoinHandle<()>,
    ) -> Self {
        Self {
            events,
            shutdown: Some(shutdown),
            task,
        }
    }

    /// Next event, `None` once the connection has finished
    pub async fn next_event(&mut self) -> Option<ProviderEvent> {
        self.events.recv().await
    }

    /// Close the connection and wait for the socket to shut down
    pub async fn close(mut self) {
        if let Some(shutdown) = self.shutdown.take() {
            let _ = shutdown.send(());
        }
        if tokio::time::timeout(CLOSE_GRACE, &mut self.task)
            .await
            .is_err()
        {
            warn!("Live connection did not close in time, aborting");
            self.task.abort();
        }
    }
}
