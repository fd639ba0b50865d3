//! devlink Auth - Linking sessions and credential issuance
//!
//! Owns the session record, its state machine, and everything produced when
//! a device is linked: the bearer credential, the linked device record and
//! the live provider's persisted handshake material.
//!
//! # Linking Flow
//!
//! 1. Server calls `LinkController::create()` with a payload for the QR code
//! 2. The device scans it and reports via `mark_scanned()`
//! 3. `finalize()` issues a credential and records the linked device
//! 4. Listeners obtained from `watch()` observe every change until the
//!    session ends
//!
//! # Example
//!
//! ```no_run
//! use devlink_auth::{LinkController, NewSession, Stores};
//! use devlink_core::ProviderKind;
//! use uuid::Uuid;
//!
//! async fn example() {
//!     let controller = LinkController::new(Stores::in_memory());
//!     let session = controller
//!         .create(NewSession::new(Uuid::new_v4(), ProviderKind::Static), |s| {
//!             format!("devlink://link?session={}", s.id)
//!         })
//!         .await
//!         .unwrap();
//!
//!     controller.mark_scanned(&session.id).await.unwrap();
//!     let linked = controller.finalize(&session.id, None).await.unwrap();
//!     println!("Issued credential {}", linked.credential);
//! }
//! ```

pub mod credentials;
pub mod device;
pub mod events;
pub mod expiry;
pub mod lifecycle;
pub mod profile;
pub mod session;
pub mod storage;
pub mod token;

pub use credentials::CredentialRecord;
pub use device::{DeviceId, DeviceSummary, DeviceType, LinkedDevice};
pub use events::{SessionEvent, SessionEvents};
pub use expiry::ExpirySweeper;
pub use lifecycle::{
    Finalized, LinkController, NewSession, Transition, DEFAULT_SESSION_TTL_SECS,
};
pub use profile::{ProfileError, ProfileId, ProfileResolver, TenantProfiles};
pub use session::{Session, SessionChange, SessionId};
pub use storage::{
    CasOutcome, CredentialStorage, CredentialStore, DeviceStorage, DeviceStore, SessionStorage,
    SessionStore, StorageError, StorageResult, Stores,
};
pub use token::{generate_token, hash_token, CredentialHasher, Sha256Hasher};
