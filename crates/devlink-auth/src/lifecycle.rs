//! Session lifecycle controller
//!
//! Enforces the linking state machine:
//!
//! ```text
//! PENDING --scan--> SCANNED --finalize--> COMPLETED
//!    |                 |
//!    |                 +--cancel--> CANCELLED
//!    +-----------------+--deadline--> EXPIRED
//! ```
//!
//! Every mutation runs under a per-session async lock and is written with a
//! compare-and-set on the stored status, so concurrent scan, finalize,
//! cancel, expiry and provider callbacks on one session serialize while
//! different sessions proceed independently. Requests that do not fit the
//! current state are not errors unless the caller asked for something only
//! a specific state can give (finalize, cancel); the current session is
//! always reported back.

use crate::credentials::CredentialRecord;
use crate::device::{DeviceId, LinkedDevice};
use crate::events::{SessionEvent, SessionEvents};
use crate::expiry;
use crate::profile::{ProfileResolver, TenantProfiles};
use crate::session::{Session, SessionChange, SessionId};
use crate::storage::{CasOutcome, CredentialStore, DeviceStore, SessionStore, Stores};
use crate::token::{generate_token, CredentialHasher, Sha256Hasher};
use chrono::{Duration, Utc};
use devlink_core::{Error, ProviderKind, Result, SessionStatus};
use std::collections::HashMap;
use std::sync::{Arc, Mutex, PoisonError};
use tokio::sync::broadcast;
use tracing::{debug, info, warn};
use uuid::Uuid;

/// Default session lifetime in seconds
pub const DEFAULT_SESSION_TTL_SECS: i64 = 300;

/// Request to open a linking session
#[derive(Debug, Clone)]
pub struct NewSession {
    pub tenant_id: Uuid,
    pub provider: ProviderKind,
    pub device_info: Option<String>,
    /// Overrides the controller's TTL
    pub ttl: Option<Duration>,
}

impl NewSession {
    pub fn new(tenant_id: Uuid, provider: ProviderKind) -> Self {
        Self {
            tenant_id,
            provider,
            device_info: None,
            ttl: None,
        }
    }

    pub fn with_device_info(mut self, device_info: Option<String>) -> Self {
        self.device_info = device_info;
        self
    }

    pub fn with_ttl(mut self, ttl: Duration) -> Self {
        self.ttl = Some(ttl);
        self
    }
}

/// Outcome of a transition request
#[derive(Debug, Clone)]
pub struct Transition {
    /// Session as it stands after the request
    pub session: Session,
    /// Whether this request changed it
    pub applied: bool,
}

impl Transition {
    fn unchanged(session: Session) -> Self {
        Self {
            session,
            applied: false,
        }
    }

    pub fn status(&self) -> SessionStatus {
        self.session.status
    }
}

impl From<CasOutcome> for Transition {
    fn from(outcome: CasOutcome) -> Self {
        let applied = outcome.applied();
        Self {
            session: outcome.into_session(),
            applied,
        }
    }
}

/// Outcome of finalization
#[derive(Debug, Clone)]
pub struct Finalized {
    pub session: Session,
    /// Bearer credential issued to the linked device
    pub credential: String,
    pub device_id: Option<DeviceId>,
    /// False when the session had already been completed earlier
    pub newly_linked: bool,
}

/// Async mutex per session id. An entry lives only while some task holds
/// or waits on it.
#[derive(Default)]
struct SessionLocks {
    locks: Mutex<HashMap<SessionId, Arc<tokio::sync::Mutex<()>>>>,
}

impl SessionLocks {
    async fn acquire(&self, id: &SessionId) -> SessionGuard<'_> {
        let lock = {
            let mut locks = self.locks.lock().unwrap_or_else(PoisonError::into_inner);
            locks.entry(id.clone()).or_default().clone()
        };
        SessionGuard {
            id: id.clone(),
            guard: Some(lock.lock_owned().await),
            locks: self,
        }
    }

    #[cfg(test)]
    fn len(&self) -> usize {
        self.locks
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .len()
    }
}

/// Held session lock; drops the map entry when it was the last user
struct SessionGuard<'a> {
    id: SessionId,
    guard: Option<tokio::sync::OwnedMutexGuard<()>>,
    locks: &'a SessionLocks,
}

impl Drop for SessionGuard<'_> {
    fn drop(&mut self) {
        drop(self.guard.take());
        let mut locks = self
            .locks
            .locks
            .lock()
            .unwrap_or_else(PoisonError::into_inner);
        // Clones are only taken under the map lock, so a count of one means
        // nobody else holds or waits on this mutex
        if locks.get(&self.id).is_some_and(|lock| Arc::strong_count(lock) == 1) {
            locks.remove(&self.id);
        }
    }
}

/// Drives sessions through their lifecycle
pub struct LinkController {
    sessions: Arc<dyn SessionStore>,
    credentials: Arc<dyn CredentialStore>,
    devices: Arc<dyn DeviceStore>,
    profiles: Arc<dyn ProfileResolver>,
    hasher: Arc<dyn CredentialHasher>,
    events: SessionEvents,
    locks: SessionLocks,
    ttl: Duration,
}

impl LinkController {
    /// Create a controller over the given stores
    pub fn new(stores: Stores) -> Self {
        Self {
            sessions: stores.sessions,
            credentials: stores.credentials,
            devices: stores.devices,
            profiles: Arc::new(TenantProfiles::new()),
            hasher: Arc::new(Sha256Hasher),
            events: SessionEvents::new(),
            locks: SessionLocks::default(),
            ttl: Duration::seconds(DEFAULT_SESSION_TTL_SECS),
        }
    }

    /// Builder pattern: set session lifetime
    pub fn with_ttl(mut self, ttl: Duration) -> Self {
        self.ttl = ttl;
        self
    }

    /// Builder pattern: set profile resolver
    pub fn with_profiles(mut self, profiles: Arc<dyn ProfileResolver>) -> Self {
        self.profiles = profiles;
        self
    }

    /// Builder pattern: set credential hasher
    pub fn with_hasher(mut self, hasher: Arc<dyn CredentialHasher>) -> Self {
        self.hasher = hasher;
        self
    }

    pub fn ttl(&self) -> Duration {
        self.ttl
    }

    /// Credential store shared with the live provider
    pub fn credential_store(&self) -> Arc<dyn CredentialStore> {
        self.credentials.clone()
    }

    pub fn events(&self) -> &SessionEvents {
        &self.events
    }

    /// Open a new pending session. `payload` computes the initial QR
    /// payload from the fresh record.
    pub async fn create<F>(&self, request: NewSession, payload: F) -> Result<Session>
    where
        F: FnOnce(&Session) -> String,
    {
        let ttl = request.ttl.unwrap_or(self.ttl);
        let mut session = Session::new(
            request.tenant_id,
            request.provider,
            request.device_info,
            ttl,
        );
        session.qr_payload = payload(&session);
        self.sessions.insert(session.clone()).await?;

        info!(
            "Created {} session {} for tenant {}",
            session.provider, session.id, session.tenant_id
        );
        Ok(session)
    }

    /// Read a session, expiring it first if its deadline has passed
    pub async fn status(&self, id: &SessionId) -> Result<Session> {
        let session = self.load(id).await?;
        if !expiry::is_due(session.status, session.expires_at, Utc::now()) {
            return Ok(session);
        }

        let _guard = self.locks.acquire(id).await;
        self.current_locked(id).await
    }

    /// Subscribe to a session's events and read its current state
    ///
    /// The subscription is taken before the read so nothing published in
    /// between is lost.
    pub async fn watch(
        &self,
        id: &SessionId,
    ) -> Result<(Session, broadcast::Receiver<SessionEvent>)> {
        let rx = self.events.subscribe(id);
        match self.status(id).await {
            Ok(session) => {
                if session.is_terminal() {
                    self.events.close(id);
                }
                Ok((session, rx))
            }
            Err(e) => {
                self.events.close(id);
                Err(e)
            }
        }
    }

    /// `PENDING -> SCANNED`. Any other state is returned unchanged.
    pub async fn mark_scanned(&self, id: &SessionId) -> Result<Transition> {
        let _guard = self.locks.acquire(id).await;

        let session = self.current_locked(id).await?;
        if session.status != SessionStatus::Pending {
            debug!("Scan ignored for session {} in state {}", id, session.status);
            return Ok(Transition::unchanged(session));
        }

        let outcome = self.scan_locked(id).await?;
        Ok(outcome.into())
    }

    /// `SCANNED -> COMPLETED`, issuing a credential and a linked device
    ///
    /// Calling again on a completed session returns the same credential and
    /// creates nothing.
    pub async fn finalize(&self, id: &SessionId, device_info: Option<String>) -> Result<Finalized> {
        let _guard = self.locks.acquire(id).await;

        let session = self.current_locked(id).await?;
        match session.status {
            SessionStatus::Scanned => self.link_locked(session, device_info).await,
            SessionStatus::Completed => self.already_finalized(session).await,
            SessionStatus::Expired => Err(Error::Expired(id.to_string())),
            current => Err(Error::invalid_transition("finalize", current)),
        }
    }

    /// `SCANNED -> CANCELLED`
    pub async fn cancel(&self, id: &SessionId) -> Result<Transition> {
        let _guard = self.locks.acquire(id).await;

        let session = self.current_locked(id).await?;
        match session.status {
            SessionStatus::Scanned => {}
            SessionStatus::Pending => {
                return Err(Error::invalid_transition("cancel", SessionStatus::Pending))
            }
            _ => return Ok(Transition::unchanged(session)),
        }

        let outcome = self
            .sessions
            .compare_and_set(id, SessionStatus::Scanned, SessionChange::Cancelled)
            .await?;
        if let CasOutcome::Applied(cancelled) = &outcome {
            info!("Session {} cancelled", id);
            self.finish(cancelled).await;
        }
        Ok(outcome.into())
    }

    /// Replace the QR payload of a pending live session
    pub async fn rotate_qr(&self, id: &SessionId, payload: String) -> Result<Transition> {
        let _guard = self.locks.acquire(id).await;

        let session = self.current_locked(id).await?;
        if !session.provider.capabilities().supports_rotation
            || session.status != SessionStatus::Pending
            || session.qr_payload == payload
        {
            return Ok(Transition::unchanged(session));
        }

        let outcome = self
            .sessions
            .compare_and_set(
                id,
                SessionStatus::Pending,
                SessionChange::QrRotated(payload.clone()),
            )
            .await?;
        if outcome.applied() {
            debug!("Session {} QR rotated", id);
            self.events.publish(id, SessionEvent::QrRotated(payload));
        }
        Ok(outcome.into())
    }

    /// The live provider paired: scan and finalize in one step
    pub async fn complete_from_provider(
        &self,
        id: &SessionId,
        device_info: Option<String>,
    ) -> Result<Finalized> {
        let _guard = self.locks.acquire(id).await;

        let mut session = self.current_locked(id).await?;
        if session.status == SessionStatus::Pending {
            session = self.scan_locked(id).await?.into_session();
        }

        match session.status {
            SessionStatus::Scanned => self.link_locked(session, device_info).await,
            SessionStatus::Completed => self.already_finalized(session).await,
            SessionStatus::Expired => Err(Error::Expired(id.to_string())),
            current => Err(Error::invalid_transition("complete", current)),
        }
    }

    /// Store a piece of live handshake material for a session
    ///
    /// Returns false, storing nothing, once the session is terminal: its
    /// records were dropped when it got there and must stay dropped.
    pub async fn persist_credential(
        &self,
        id: &SessionId,
        key_type: String,
        material: String,
    ) -> Result<bool> {
        let _guard = self.locks.acquire(id).await;

        let session = self.current_locked(id).await?;
        if session.is_terminal() {
            debug!(
                "Discarding {} credential for session {} in state {}",
                key_type, id, session.status
            );
            return Ok(false);
        }

        self.credentials
            .put(CredentialRecord::new(id.clone(), key_type, material))
            .await?;
        Ok(true)
    }

    /// Surface a pre-pairing provider failure to listeners. Status is left
    /// alone; expiry or the caller decides what happens next.
    pub fn report_provider_closed(&self, id: &SessionId, reason: String) {
        warn!("Provider for session {} closed: {}", id, reason);
        self.events.publish(id, SessionEvent::ProviderClosed(reason));
    }

    /// Expire every open session past its deadline
    pub async fn sweep(&self) -> Result<usize> {
        let now = Utc::now();
        let due: Vec<SessionId> = self
            .sessions
            .list_open()
            .await?
            .into_iter()
            .filter(|s| expiry::is_due(s.status, s.expires_at, now))
            .map(|s| s.id)
            .collect();

        let mut expired = 0;
        for id in due {
            let _guard = self.locks.acquire(&id).await;
            match self.current_locked(&id).await {
                Ok(session) if session.status == SessionStatus::Expired => expired += 1,
                Ok(_) => {}
                Err(e) => warn!("Failed to expire session {}: {}", id, e),
            }
        }
        Ok(expired)
    }

    /// Drop a session's stored handshake material (explicit logout)
    pub async fn forget_credentials(&self, id: &SessionId) -> Result<usize> {
        self.load(id).await?;
        let removed = self.credentials.remove_session(id).await?;
        info!("Logged out session {} ({} credential record(s))", id, removed);
        Ok(removed)
    }

    /// Look up the device a bearer credential was issued to
    pub async fn validate_credential(&self, credential: &str) -> Result<Option<LinkedDevice>> {
        let hash = self.hasher.hash(credential);
        Ok(self.devices.get_by_credential_hash(&hash).await?)
    }

    /// Devices linked for a tenant
    pub async fn list_devices(&self, tenant_id: Uuid) -> Result<Vec<LinkedDevice>> {
        Ok(self.devices.list_by_tenant(tenant_id).await?)
    }

    async fn load(&self, id: &SessionId) -> Result<Session> {
        self.sessions
            .get(id)
            .await?
            .ok_or_else(|| Error::NotFound(id.to_string()))
    }

    /// Current state with expiry applied. Caller holds the session lock.
    async fn current_locked(&self, id: &SessionId) -> Result<Session> {
        let mut session = self.load(id).await?;
        while expiry::is_due(session.status, session.expires_at, Utc::now()) {
            let outcome = self
                .sessions
                .compare_and_set(id, session.status, SessionChange::Expired)
                .await?;
            match outcome {
                CasOutcome::Applied(expired) => {
                    info!("Session {} expired", id);
                    self.finish(&expired).await;
                    return Ok(expired);
                }
                // Status moved underneath us; re-evaluate the fresh record
                CasOutcome::Rejected(current) => session = current,
            }
        }
        Ok(session)
    }

    async fn scan_locked(&self, id: &SessionId) -> Result<CasOutcome> {
        let outcome = self
            .sessions
            .compare_and_set(id, SessionStatus::Pending, SessionChange::Scanned)
            .await?;
        if outcome.applied() {
            info!("Session {} scanned", id);
            self.events
                .publish(id, SessionEvent::Status(SessionStatus::Scanned));
        }
        Ok(outcome)
    }

    /// Issue the credential and device for a scanned session. Caller holds
    /// the session lock.
    async fn link_locked(&self, session: Session, device_info: Option<String>) -> Result<Finalized> {
        let device_info = device_info.or_else(|| session.device_info.clone());
        let profile = self
            .profiles
            .resolve_or_create(session.tenant_id, device_info.as_deref())
            .await?;

        let credential = generate_token();
        let device = LinkedDevice::new(
            session.tenant_id,
            profile,
            session.id.clone(),
            self.hasher.hash(&credential),
            device_info.clone(),
        );
        let device_id = device.id.clone();
        self.devices.insert(device).await?;

        let change = SessionChange::Completed {
            credential: credential.clone(),
            device_info,
        };
        let outcome = match self
            .sessions
            .compare_and_set(&session.id, SessionStatus::Scanned, change)
            .await
        {
            Ok(outcome) => outcome,
            Err(e) => {
                self.discard_device(&device_id).await;
                return Err(e.into());
            }
        };

        match outcome {
            CasOutcome::Applied(completed) => {
                info!("Session {} linked device {}", completed.id, device_id);
                self.finish(&completed).await;
                Ok(Finalized {
                    session: completed,
                    credential,
                    device_id: Some(device_id),
                    newly_linked: true,
                })
            }
            CasOutcome::Rejected(current) => {
                self.discard_device(&device_id).await;
                if current.status == SessionStatus::Completed {
                    self.already_finalized(current).await
                } else {
                    warn!(
                        "Session {} changed to {} while linking",
                        current.id, current.status
                    );
                    Err(Error::Conflict(current.id.to_string()))
                }
            }
        }
    }

    async fn already_finalized(&self, session: Session) -> Result<Finalized> {
        let credential = session.linked_credential.clone().ok_or_else(|| {
            Error::Storage(format!("completed session {} has no credential", session.id))
        })?;
        let device_id = self
            .devices
            .find_by_session(&session.id)
            .await?
            .map(|d| d.id);
        Ok(Finalized {
            session,
            credential,
            device_id,
            newly_linked: false,
        })
    }

    async fn discard_device(&self, id: &DeviceId) {
        if let Err(e) = self.devices.remove(id).await {
            warn!("Failed to discard unused device {}: {}", id, e);
        }
    }

    /// Side effects of reaching a terminal state. Best effort: failures are
    /// logged and never surface to the caller.
    async fn finish(&self, session: &Session) {
        match self.credentials.remove_session(&session.id).await {
            Ok(0) => {}
            Ok(n) => debug!("Dropped {} credential record(s) of {}", n, session.id),
            Err(e) => warn!(
                "Failed to remove credential records of session {}: {}",
                session.id, e
            ),
        }

        let event = match session.status {
            SessionStatus::Completed => SessionEvent::Linked {
                credential: session.linked_credential.clone().unwrap_or_default(),
                device_info: session.device_info.clone(),
            },
            status => SessionEvent::Ended(status),
        };
        self.events.publish(&session.id, event);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::storage::{CredentialStorage, DeviceStorage, SessionStorage, StorageError, StorageResult};
    use async_trait::async_trait;

    fn create_test_controller() -> LinkController {
        LinkController::new(Stores::in_memory())
    }

    async fn scanned_session(controller: &LinkController) -> Session {
        let session = controller
            .create(
                NewSession::new(Uuid::new_v4(), ProviderKind::Static),
                |s| format!("static:{}", s.id),
            )
            .await
            .unwrap();
        controller.mark_scanned(&session.id).await.unwrap();
        session
    }

    #[tokio::test]
    async fn test_static_link_flow() {
        let controller = create_test_controller();
        let session = controller
            .create(
                NewSession::new(Uuid::new_v4(), ProviderKind::Static)
                    .with_device_info(Some("Desk PC".into())),
                |s| format!("static:{}", s.id),
            )
            .await
            .unwrap();
        assert_eq!(session.status, SessionStatus::Pending);
        assert_eq!(session.qr_payload, format!("static:{}", session.id));

        let scanned = controller.mark_scanned(&session.id).await.unwrap();
        assert!(scanned.applied);
        assert_eq!(scanned.status(), SessionStatus::Scanned);

        let finalized = controller
            .finalize(&session.id, Some("iPhone 15".into()))
            .await
            .unwrap();
        assert!(finalized.newly_linked);
        assert_eq!(finalized.session.status, SessionStatus::Completed);
        assert_eq!(
            finalized.session.linked_credential.as_deref(),
            Some(finalized.credential.as_str())
        );
        assert_eq!(finalized.session.device_info.as_deref(), Some("iPhone 15"));

        let device = controller
            .validate_credential(&finalized.credential)
            .await
            .unwrap()
            .unwrap();
        assert_eq!(Some(device.id), finalized.device_id);
    }

    #[tokio::test]
    async fn test_read_after_deadline_reports_expired() {
        let controller = create_test_controller();
        let session = controller
            .create(
                NewSession::new(Uuid::new_v4(), ProviderKind::Static)
                    .with_ttl(Duration::seconds(-1)),
                |_| "payload".into(),
            )
            .await
            .unwrap();

        let read = controller.status(&session.id).await.unwrap();
        assert_eq!(read.status, SessionStatus::Expired);
        assert!(read.linked_credential.is_none());

        let scan = controller.mark_scanned(&session.id).await.unwrap();
        assert!(!scan.applied);
        assert_eq!(scan.status(), SessionStatus::Expired);
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn test_concurrent_finalize_links_once() {
        let controller = Arc::new(create_test_controller());
        let session = scanned_session(&controller).await;

        let a = {
            let controller = controller.clone();
            let id = session.id.clone();
            tokio::spawn(async move { controller.finalize(&id, Some("a".into())).await })
        };
        let b = {
            let controller = controller.clone();
            let id = session.id.clone();
            tokio::spawn(async move { controller.finalize(&id, Some("b".into())).await })
        };
        let a = a.await.unwrap().unwrap();
        let b = b.await.unwrap().unwrap();

        assert_eq!(a.session.status, SessionStatus::Completed);
        assert_eq!(b.session.status, SessionStatus::Completed);
        assert_eq!(a.credential, b.credential);
        assert!(a.newly_linked ^ b.newly_linked);

        let devices = controller.list_devices(session.tenant_id).await.unwrap();
        assert_eq!(devices.len(), 1);
    }

    #[tokio::test]
    async fn test_finalize_twice_creates_one_device() {
        let controller = create_test_controller();
        let session = scanned_session(&controller).await;

        let first = controller.finalize(&session.id, None).await.unwrap();
        let second = controller
            .finalize(&session.id, Some("other".into()))
            .await
            .unwrap();

        assert!(first.newly_linked);
        assert!(!second.newly_linked);
        assert_eq!(first.credential, second.credential);
        assert_eq!(first.device_id, second.device_id);
        assert_eq!(
            controller
                .list_devices(session.tenant_id)
                .await
                .unwrap()
                .len(),
            1
        );
    }

    #[tokio::test]
    async fn test_scan_completed_is_noop() {
        let controller = create_test_controller();
        let session = scanned_session(&controller).await;
        let finalized = controller.finalize(&session.id, None).await.unwrap();

        let scan = controller.mark_scanned(&session.id).await.unwrap();
        assert!(!scan.applied);
        assert_eq!(scan.status(), SessionStatus::Completed);
        assert_eq!(
            scan.session.linked_credential.as_deref(),
            Some(finalized.credential.as_str())
        );
    }

    #[tokio::test]
    async fn test_finalize_requires_scan() {
        let controller = create_test_controller();
        let session = controller
            .create(
                NewSession::new(Uuid::new_v4(), ProviderKind::Static),
                |_| "payload".into(),
            )
            .await
            .unwrap();

        let result = controller.finalize(&session.id, None).await;
        assert!(matches!(
            result,
            Err(Error::InvalidTransition {
                current: SessionStatus::Pending,
                ..
            })
        ));
        let read = controller.status(&session.id).await.unwrap();
        assert!(read.linked_credential.is_none());
    }

    #[tokio::test]
    async fn test_finalize_expired_session() {
        let controller = create_test_controller().with_ttl(Duration::seconds(-1));
        let session = controller
            .create(
                NewSession::new(Uuid::new_v4(), ProviderKind::Static),
                |_| "payload".into(),
            )
            .await
            .unwrap();

        let result = controller.finalize(&session.id, None).await;
        assert!(matches!(result, Err(Error::Expired(_))));
    }

    #[tokio::test]
    async fn test_unknown_session() {
        let controller = create_test_controller();
        let result = controller.status(&SessionId::new()).await;
        assert!(matches!(result, Err(Error::NotFound(_))));
        assert_eq!(controller.events().open_channels(), 0);
        assert!(controller.watch(&SessionId::new()).await.is_err());
        assert_eq!(controller.events().open_channels(), 0);
    }

    #[tokio::test]
    async fn test_cancel_rules() {
        let controller = create_test_controller();
        let pending = controller
            .create(
                NewSession::new(Uuid::new_v4(), ProviderKind::Static),
                |_| "payload".into(),
            )
            .await
            .unwrap();
        assert!(matches!(
            controller.cancel(&pending.id).await,
            Err(Error::InvalidTransition {
                current: SessionStatus::Pending,
                ..
            })
        ));

        let session = scanned_session(&controller).await;
        let cancelled = controller.cancel(&session.id).await.unwrap();
        assert!(cancelled.applied);
        assert_eq!(cancelled.status(), SessionStatus::Cancelled);

        let again = controller.cancel(&session.id).await.unwrap();
        assert!(!again.applied);
        assert_eq!(again.status(), SessionStatus::Cancelled);

        assert!(matches!(
            controller.finalize(&session.id, None).await,
            Err(Error::InvalidTransition {
                current: SessionStatus::Cancelled,
                ..
            })
        ));
        let read = controller.status(&session.id).await.unwrap();
        assert!(read.linked_credential.is_none());
    }

    #[tokio::test]
    async fn test_rotation_only_for_pending_live_sessions() {
        let controller = create_test_controller();
        let tenant = Uuid::new_v4();

        let fixed = controller
            .create(NewSession::new(tenant, ProviderKind::Static), |_| {
                "fixed".into()
            })
            .await
            .unwrap();
        let rotated = controller
            .rotate_qr(&fixed.id, "changed".into())
            .await
            .unwrap();
        assert!(!rotated.applied);
        assert_eq!(rotated.session.qr_payload, "fixed");

        let live = controller
            .create(NewSession::new(tenant, ProviderKind::Live), |_| {
                "connecting".into()
            })
            .await
            .unwrap();
        let mut events = controller.events().subscribe(&live.id);
        let rotated = controller.rotate_qr(&live.id, "qr-1".into()).await.unwrap();
        assert!(rotated.applied);
        assert_eq!(rotated.session.qr_payload, "qr-1");
        assert_eq!(
            events.recv().await.unwrap(),
            SessionEvent::QrRotated("qr-1".into())
        );

        controller.complete_from_provider(&live.id, None).await.unwrap();
        let late = controller.rotate_qr(&live.id, "qr-2".into()).await.unwrap();
        assert!(!late.applied);
        assert_eq!(late.session.qr_payload, "qr-1");
    }

    #[tokio::test]
    async fn test_provider_completion_scans_and_links() {
        let controller = create_test_controller();
        let session = controller
            .create(
                NewSession::new(Uuid::new_v4(), ProviderKind::Live),
                |_| "connecting".into(),
            )
            .await
            .unwrap();
        let mut events = controller.events().subscribe(&session.id);

        let finalized = controller
            .complete_from_provider(&session.id, Some("Android phone".into()))
            .await
            .unwrap();
        assert!(finalized.newly_linked);
        assert_eq!(finalized.session.status, SessionStatus::Completed);

        assert_eq!(
            events.recv().await.unwrap(),
            SessionEvent::Status(SessionStatus::Scanned)
        );
        assert_eq!(
            events.recv().await.unwrap(),
            SessionEvent::Linked {
                credential: finalized.credential.clone(),
                device_info: Some("Android phone".into()),
            }
        );
    }

    #[tokio::test]
    async fn test_terminal_state_drops_credential_records() {
        let stores = Stores::in_memory();
        let credentials = stores.credentials.clone();
        let controller = LinkController::new(stores).with_ttl(Duration::seconds(-1));
        let session = controller
            .create(
                NewSession::new(Uuid::new_v4(), ProviderKind::Live),
                |_| "connecting".into(),
            )
            .await
            .unwrap();
        credentials
            .put(CredentialRecord::new(session.id.clone(), "noise", "abc"))
            .await
            .unwrap();

        let read = controller.status(&session.id).await.unwrap();
        assert_eq!(read.status, SessionStatus::Expired);
        assert!(credentials.load(&session.id).await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_credentials_rejected_after_terminal_state() {
        let stores = Stores::in_memory();
        let credentials = stores.credentials.clone();
        let controller = LinkController::new(stores);
        let session = controller
            .create(
                NewSession::new(Uuid::new_v4(), ProviderKind::Live),
                |_| "connecting".into(),
            )
            .await
            .unwrap();

        assert!(controller
            .persist_credential(&session.id, "noise".into(), "abc".into())
            .await
            .unwrap());
        assert_eq!(credentials.load(&session.id).await.unwrap().len(), 1);

        controller.mark_scanned(&session.id).await.unwrap();
        controller.cancel(&session.id).await.unwrap();
        assert!(credentials.load(&session.id).await.unwrap().is_empty());

        // Material arriving after cancel must not bring the records back
        assert!(!controller
            .persist_credential(&session.id, "noise".into(), "def".into())
            .await
            .unwrap());
        assert!(credentials.load(&session.id).await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_unknown_ids_leave_no_locks() {
        let controller = create_test_controller();
        for _ in 0..100 {
            let id = SessionId::new();
            assert!(controller.mark_scanned(&id).await.is_err());
            assert!(controller.finalize(&id, None).await.is_err());
            assert!(controller.cancel(&id).await.is_err());
        }
        assert_eq!(controller.locks.len(), 0);

        let session = scanned_session(&controller).await;
        controller.finalize(&session.id, None).await.unwrap();
        controller.finalize(&session.id, None).await.unwrap();
        assert_eq!(controller.locks.len(), 0);
    }

    #[tokio::test]
    async fn test_sweep_expires_due_sessions() {
        let controller = create_test_controller();
        let tenant = Uuid::new_v4();
        let stale = controller
            .create(
                NewSession::new(tenant, ProviderKind::Static).with_ttl(Duration::seconds(-5)),
                |_| "a".into(),
            )
            .await
            .unwrap();
        let fresh = controller
            .create(NewSession::new(tenant, ProviderKind::Static), |_| "b".into())
            .await
            .unwrap();

        assert_eq!(controller.sweep().await.unwrap(), 1);
        assert_eq!(controller.sweep().await.unwrap(), 0);
        assert_eq!(
            controller.status(&stale.id).await.unwrap().status,
            SessionStatus::Expired
        );
        assert_eq!(
            controller.status(&fresh.id).await.unwrap().status,
            SessionStatus::Pending
        );
    }

    /// Credential store whose deletes always fail
    struct BrokenCredentials(CredentialStorage);

    #[async_trait]
    impl CredentialStore for BrokenCredentials {
        async fn put(&self, record: CredentialRecord) -> StorageResult<()> {
            self.0.put(record).await
        }

        async fn load(&self, session_id: &SessionId) -> StorageResult<Vec<CredentialRecord>> {
            self.0.load(session_id).await
        }

        async fn remove_session(&self, _session_id: &SessionId) -> StorageResult<usize> {
            Err(StorageError::Io(std::io::Error::other("disk gone")))
        }
    }

    #[tokio::test]
    async fn test_cleanup_failure_does_not_fail_read() {
        let stores = Stores {
            sessions: Arc::new(SessionStorage::in_memory()),
            credentials: Arc::new(BrokenCredentials(CredentialStorage::in_memory())),
            devices: Arc::new(DeviceStorage::in_memory()),
        };
        let controller = LinkController::new(stores).with_ttl(Duration::seconds(-1));
        let session = controller
            .create(
                NewSession::new(Uuid::new_v4(), ProviderKind::Live),
                |_| "connecting".into(),
            )
            .await
            .unwrap();

        let read = controller.status(&session.id).await.unwrap();
        assert_eq!(read.status, SessionStatus::Expired);
    }

    #[tokio::test]
    async fn test_watch_terminal_session_closes_channel() {
        let controller = create_test_controller();
        let session = scanned_session(&controller).await;
        controller.cancel(&session.id).await.unwrap();

        let (read, mut rx) = controller.watch(&session.id).await.unwrap();
        assert_eq!(read.status, SessionStatus::Cancelled);
        assert!(rx.recv().await.is_err());
        assert_eq!(controller.events().open_channels(), 0);
    }
}
