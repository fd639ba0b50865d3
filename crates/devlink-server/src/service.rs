//! Provider wiring for linking sessions
//!
//! [`LinkService`] picks the provider for a new session, waits a bounded time
//! for a live connection's first QR code, then hands the connection to a
//! background pump. At most one live connection exists per session; the
//! attachment registry tracks which sessions have one.

use devlink_auth::{LinkController, NewSession, Session, SessionId};
use devlink_core::{Config, ProviderKind, Result};
use devlink_provider::{
    AttachRequest, Attachment, LiveProvider, Provider, ProviderConnection, ProviderError,
    ProviderEvent, RetryPolicy, StaticProvider,
};
use std::collections::HashSet;
use std::sync::{Arc, Mutex, PoisonError};
use std::time::Duration;
use tokio::sync::broadcast::error::RecvError;
use tracing::{debug, info, warn};
use uuid::Uuid;

/// Parameters for a new session
#[derive(Debug, Clone)]
pub struct CreateSession {
    pub tenant_id: Uuid,
    /// Falls back to the configured default
    pub provider: Option<ProviderKind>,
    pub device_info: Option<String>,
}

/// Sessions that currently have a live connection
#[derive(Clone, Default)]
struct Attachments {
    active: Arc<Mutex<HashSet<SessionId>>>,
}

impl Attachments {
    fn claim(&self, id: &SessionId) -> Option<AttachmentClaim> {
        let mut active = self.active.lock().unwrap_or_else(PoisonError::into_inner);
        active.insert(id.clone()).then(|| AttachmentClaim {
            id: id.clone(),
            active: self.active.clone(),
        })
    }

    fn count(&self) -> usize {
        self.active
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .len()
    }
}

/// Registry slot, freed on drop
struct AttachmentClaim {
    id: SessionId,
    active: Arc<Mutex<HashSet<SessionId>>>,
}

impl Drop for AttachmentClaim {
    fn drop(&mut self) {
        let mut active = self.active.lock().unwrap_or_else(PoisonError::into_inner);
        active.remove(&self.id);
    }
}

/// A live connection owned by a stream subscription
pub struct LiveAttachment {
    connection: ProviderConnection,
    _claim: AttachmentClaim,
}

impl LiveAttachment {
    pub async fn next_event(&mut self) -> Option<ProviderEvent> {
        self.connection.next_event().await
    }

    pub async fn close(self) {
        self.connection.close().await;
    }
}

/// Creates sessions and supervises their providers
pub struct LinkService {
    controller: Arc<LinkController>,
    fixed: Provider,
    live: Option<Provider>,
    attachments: Attachments,
    config: Config,
}

impl LinkService {
    /// Build the service; a live provider is available only when an endpoint
    /// is configured
    pub fn new(controller: Arc<LinkController>, config: Config) -> Result<Self> {
        let fixed = Provider::Static(StaticProvider::new(config.base_url()));
        let live = match &config.live_endpoint {
            Some(endpoint) => {
                let provider = LiveProvider::new(endpoint.clone(), controller.credential_store())?
                    .with_retry(RetryPolicy::from(&config));
                info!("Live provider enabled: {}", endpoint);
                Some(Provider::Live(provider))
            }
            None => None,
        };

        Ok(Self {
            controller,
            fixed,
            live,
            attachments: Attachments::default(),
            config,
        })
    }

    pub fn controller(&self) -> &Arc<LinkController> {
        &self.controller
    }

    pub fn config(&self) -> &Config {
        &self.config
    }

    /// Provider kinds this server can attach
    pub fn available_providers(&self) -> Vec<ProviderKind> {
        std::iter::once(&self.fixed)
            .chain(self.live.as_ref())
            .map(Provider::kind)
            .collect()
    }

    /// Number of sessions with an open live connection
    pub fn live_connections(&self) -> usize {
        self.attachments.count()
    }

    fn provider(&self, kind: ProviderKind) -> Result<&Provider> {
        match kind {
            ProviderKind::Static => Ok(&self.fixed),
            ProviderKind::Live => Ok(self.live.as_ref().ok_or(ProviderError::NotConfigured)?),
        }
    }

    /// Create a session and attach its provider
    ///
    /// Live sessions wait up to the connect timeout for the first QR code and
    /// otherwise return with the placeholder payload.
    pub async fn create_session(&self, request: CreateSession) -> Result<Session> {
        let kind = request.provider.unwrap_or(self.config.default_provider);
        let provider = self.provider(kind)?;

        let session = self
            .controller
            .create(
                NewSession::new(request.tenant_id, kind).with_device_info(request.device_info),
                |s| provider.initial_payload(&AttachRequest::from(s)),
            )
            .await?;

        match provider.attach(&AttachRequest::from(&session)) {
            Attachment::Ready(_) => Ok(session),
            Attachment::Connecting(connection) => match self.attachments.claim(&session.id) {
                Some(claim) => self.await_first_qr(session, connection, claim).await,
                None => Ok(session),
            },
        }
    }

    async fn await_first_qr(
        &self,
        session: Session,
        mut connection: ProviderConnection,
        claim: AttachmentClaim,
    ) -> Result<Session> {
        let timeout = self.config.connect_timeout();
        let deadline = tokio::time::Instant::now() + timeout;
        loop {
            match tokio::time::timeout_at(deadline, connection.next_event()).await {
                Ok(Some(event)) => {
                    let first_qr = matches!(event, ProviderEvent::QrRotated(_));
                    if apply_provider_event(&self.controller, &session.id, event).await {
                        connection.close().await;
                        return self.controller.status(&session.id).await;
                    }
                    if first_qr {
                        break;
                    }
                }
                Ok(None) => return self.controller.status(&session.id).await,
                Err(_) => {
                    info!(
                        "Live provider for session {} still connecting after {:?}",
                        session.id, timeout
                    );
                    break;
                }
            }
        }

        let current = self.controller.status(&session.id).await?;
        tokio::spawn(pump(
            self.controller.clone(),
            connection,
            claim,
            self.config.poll_interval(),
        ));
        Ok(current)
    }

    /// Open a live connection for a pending live session that has none
    ///
    /// Used by stream subscriptions to resume sessions whose connection was
    /// lost or never established in this process.
    pub fn attach_live(&self, session: &Session) -> Option<LiveAttachment> {
        if session.provider != ProviderKind::Live || session.is_terminal() {
            return None;
        }
        let provider = self.live.as_ref()?;
        let claim = self.attachments.claim(&session.id)?;
        match provider.attach(&AttachRequest::from(session)) {
            Attachment::Connecting(connection) => {
                debug!("Stream attached live connection for session {}", session.id);
                Some(LiveAttachment {
                    connection,
                    _claim: claim,
                })
            }
            Attachment::Ready(_) => None,
        }
    }
}

/// Feed one provider event into the controller. Returns true once the
/// connection has nothing more to contribute.
pub(crate) async fn apply_provider_event(
    controller: &LinkController,
    id: &SessionId,
    event: ProviderEvent,
) -> bool {
    match event {
        ProviderEvent::QrRotated(payload) => match controller.rotate_qr(id, payload).await {
            Ok(transition) => transition.session.is_terminal(),
            Err(e) => {
                warn!("Failed to rotate QR for session {}: {}", id, e);
                true
            }
        },
        ProviderEvent::Credentials { key_type, material } => {
            match controller.persist_credential(id, key_type, material).await {
                Ok(stored) => !stored,
                Err(e) => {
                    warn!("Failed to persist credential for session {}: {}", id, e);
                    false
                }
            }
        }
        ProviderEvent::Paired { device_info } => {
            match controller.complete_from_provider(id, device_info).await {
                Ok(finalized) if finalized.newly_linked => {
                    info!("Live pairing completed session {}", id)
                }
                Ok(_) => debug!("Session {} was already linked", id),
                Err(e) => warn!("Live pairing for session {} rejected: {}", id, e),
            }
            true
        }
        ProviderEvent::Closed(reason) => {
            controller.report_provider_closed(id, reason.to_string());
            true
        }
    }
}

/// Drive a creation-time live connection until it finishes or the session
/// ends. Terminal events from the hub release the connection at once; the
/// poll covers expiry nobody has observed yet.
async fn pump(
    controller: Arc<LinkController>,
    mut connection: ProviderConnection,
    claim: AttachmentClaim,
    poll_interval: Duration,
) {
    let id = claim.id.clone();
    let mut events = match controller.watch(&id).await {
        Ok((session, _)) if session.is_terminal() => {
            debug!("Session {} already {}, releasing live connection", id, session.status);
            connection.close().await;
            return;
        }
        Ok((_, events)) => events,
        Err(e) => {
            warn!("Live pump for session {} not started: {}", id, e);
            connection.close().await;
            return;
        }
    };
    let mut poll = tokio::time::interval(poll_interval);
    poll.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);

    loop {
        tokio::select! {
            event = connection.next_event() => match event {
                Some(event) => {
                    if apply_provider_event(&controller, &id, event).await {
                        break;
                    }
                }
                None => break,
            },
            event = events.recv() => match event {
                Ok(event) if event.is_terminal() => {
                    debug!("Session {} ended, releasing live connection", id);
                    break;
                }
                Ok(_) | Err(RecvError::Lagged(_)) => {}
                Err(RecvError::Closed) => break,
            },
            _ = poll.tick() => match controller.status(&id).await {
                Ok(session) if session.is_terminal() => {
                    debug!("Session {} is {}, releasing live connection", id, session.status);
                    break;
                }
                Ok(_) => {}
                Err(e) => {
                    warn!("Live pump for session {} stopped: {}", id, e);
                    break;
                }
            },
        }
    }

    connection.close().await;
    drop(claim);
}
