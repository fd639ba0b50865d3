//! Persistent storage for sessions, credential records and linked devices
//!
//! Each store is a trait so the surrounding application can back it with its
//! own tenant-scoped persistence. The bundled implementations keep rows in
//! memory and, when given a path, mirror them to a JSON file in
//! ~/.config/devlink/.

use crate::credentials::CredentialRecord;
use crate::device::{DeviceId, LinkedDevice};
use crate::session::{Session, SessionChange, SessionId};
use async_trait::async_trait;
use devlink_core::SessionStatus;
use serde::de::DeserializeOwned;
use serde::Serialize;
use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use thiserror::Error;
use tokio::sync::RwLock;
use tracing::{debug, info, warn};
use uuid::Uuid;

/// Storage errors
#[derive(Debug, Error)]
pub enum StorageError {
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
    #[error("JSON serialization error: {0}")]
    Json(#[from] serde_json::Error),
    #[error("Record not found: {0}")]
    NotFound(String),
    #[error("Record already exists: {0}")]
    AlreadyExists(String),
    #[error("Configuration directory not found")]
    NoConfigDir,
}

/// Result type for storage operations
pub type StorageResult<T> = Result<T, StorageError>;

impl From<StorageError> for devlink_core::Error {
    fn from(err: StorageError) -> Self {
        match err {
            StorageError::NotFound(id) => devlink_core::Error::NotFound(id),
            other => devlink_core::Error::Storage(other.to_string()),
        }
    }
}

/// Result of a compare-and-set on a session's status
#[derive(Debug, Clone)]
pub enum CasOutcome {
    /// The precondition held and the change was written
    Applied(Session),
    /// The session was not in the expected state; nothing was written
    Rejected(Session),
}

impl CasOutcome {
    pub fn applied(&self) -> bool {
        matches!(self, CasOutcome::Applied(_))
    }

    pub fn session(&self) -> &Session {
        match self {
            CasOutcome::Applied(s) | CasOutcome::Rejected(s) => s,
        }
    }

    pub fn into_session(self) -> Session {
        match self {
            CasOutcome::Applied(s) | CasOutcome::Rejected(s) => s,
        }
    }
}

/// Keyed storage for session records
#[async_trait]
pub trait SessionStore: Send + Sync {
    /// Store a new session. Fails if the id is taken.
    async fn insert(&self, session: Session) -> StorageResult<()>;

    async fn get(&self, id: &SessionId) -> StorageResult<Option<Session>>;

    /// Apply `change` only if the stored status equals `expected` and is not
    /// terminal. The check and the write are atomic.
    async fn compare_and_set(
        &self,
        id: &SessionId,
        expected: SessionStatus,
        change: SessionChange,
    ) -> StorageResult<CasOutcome>;

    /// Sessions that have not reached a terminal state
    async fn list_open(&self) -> StorageResult<Vec<Session>>;
}

/// Keyed storage for live provider handshake material
#[async_trait]
pub trait CredentialStore: Send + Sync {
    /// Insert or replace the record for `(session_id, key_type)`
    async fn put(&self, record: CredentialRecord) -> StorageResult<()>;

    /// All records of a session
    async fn load(&self, session_id: &SessionId) -> StorageResult<Vec<CredentialRecord>>;

    /// Drop every record of a session, returning how many were removed
    async fn remove_session(&self, session_id: &SessionId) -> StorageResult<usize>;
}

/// Storage for linked devices
#[async_trait]
pub trait DeviceStore: Send + Sync {
    async fn insert(&self, device: LinkedDevice) -> StorageResult<()>;

    async fn remove(&self, id: &DeviceId) -> StorageResult<()>;

    async fn find_by_session(&self, session_id: &SessionId) -> StorageResult<Option<LinkedDevice>>;

    async fn list_by_tenant(&self, tenant_id: Uuid) -> StorageResult<Vec<LinkedDevice>>;

    async fn get_by_credential_hash(&self, hash: &str) -> StorageResult<Option<LinkedDevice>>;
}

/// In-memory rows with optional JSON file mirroring
struct JsonTable<V> {
    /// Path to the storage file, `None` for memory only
    path: Option<PathBuf>,
    rows: RwLock<HashMap<String, V>>,
}

impl<V: Serialize + DeserializeOwned + Clone> JsonTable<V> {
    fn in_memory() -> Self {
        Self {
            path: None,
            rows: RwLock::new(HashMap::new()),
        }
    }

    fn open(path: PathBuf) -> StorageResult<Self> {
        // Ensure parent directory exists
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)?;
        }

        // Load existing data or create empty
        let rows = if path.exists() {
            let contents = std::fs::read_to_string(&path)?;
            match serde_json::from_str(&contents) {
                Ok(rows) => {
                    info!("Loaded storage from {:?}", path);
                    rows
                }
                Err(e) => {
                    warn!("Failed to parse {:?}, starting fresh: {}", path, e);
                    HashMap::new()
                }
            }
        } else {
            debug!("No existing storage at {:?}, creating new", path);
            HashMap::new()
        };

        Ok(Self {
            path: Some(path),
            rows: RwLock::new(rows),
        })
    }

    /// Write all rows to disk. Called with the write lock held.
    fn persist(&self, rows: &HashMap<String, V>) -> StorageResult<()> {
        let Some(path) = &self.path else {
            return Ok(());
        };
        let json = serde_json::to_string_pretty(rows)?;
        let tmp = path.with_extension("json.tmp");
        std::fs::write(&tmp, json)?;
        std::fs::rename(&tmp, path)?;
        debug!("Saved storage to {:?}", path);
        Ok(())
    }

    /// Persist after mutating `key`, restoring `previous` if the write fails
    fn commit(
        &self,
        rows: &mut HashMap<String, V>,
        key: &str,
        previous: Option<V>,
    ) -> StorageResult<()> {
        if let Err(e) = self.persist(rows) {
            match previous {
                Some(row) => rows.insert(key.to_string(), row),
                None => rows.remove(key),
            };
            return Err(e);
        }
        Ok(())
    }
}

/// Default storage directory (~/.config/devlink)
pub fn default_dir() -> StorageResult<PathBuf> {
    let config_dir = dirs::config_dir().ok_or(StorageError::NoConfigDir)?;
    Ok(config_dir.join("devlink"))
}

/// Session storage manager
pub struct SessionStorage {
    table: JsonTable<Session>,
}

impl SessionStorage {
    /// Memory-only storage, lost on exit
    pub fn in_memory() -> Self {
        Self {
            table: JsonTable::in_memory(),
        }
    }

    /// Create storage at a specific path
    pub async fn with_path(path: PathBuf) -> StorageResult<Self> {
        Ok(Self {
            table: JsonTable::open(path)?,
        })
    }
}

#[async_trait]
impl SessionStore for SessionStorage {
    async fn insert(&self, session: Session) -> StorageResult<()> {
        let key = session.id.to_string();
        let mut rows = self.table.rows.write().await;
        if rows.contains_key(&key) {
            return Err(StorageError::AlreadyExists(key));
        }
        rows.insert(key.clone(), session);
        self.table.commit(&mut rows, &key, None)?;
        debug!("Stored session {}", key);
        Ok(())
    }

    async fn get(&self, id: &SessionId) -> StorageResult<Option<Session>> {
        let rows = self.table.rows.read().await;
        Ok(rows.get(&id.to_string()).cloned())
    }

    async fn compare_and_set(
        &self,
        id: &SessionId,
        expected: SessionStatus,
        change: SessionChange,
    ) -> StorageResult<CasOutcome> {
        let key = id.to_string();
        let mut rows = self.table.rows.write().await;
        let Some(current) = rows.get(&key).cloned() else {
            return Err(StorageError::NotFound(key));
        };

        if current.status != expected || current.is_terminal() {
            return Ok(CasOutcome::Rejected(current));
        }

        let mut updated = current.clone();
        change.apply(&mut updated);
        rows.insert(key.clone(), updated.clone());
        self.table.commit(&mut rows, &key, Some(current))?;
        Ok(CasOutcome::Applied(updated))
    }

    async fn list_open(&self) -> StorageResult<Vec<Session>> {
        let rows = self.table.rows.read().await;
        Ok(rows.values().filter(|s| !s.is_terminal()).cloned().collect())
    }
}

/// Credential record storage manager
pub struct CredentialStorage {
    table: JsonTable<CredentialRecord>,
}

impl CredentialStorage {
    pub fn in_memory() -> Self {
        Self {
            table: JsonTable::in_memory(),
        }
    }

    pub async fn with_path(path: PathBuf) -> StorageResult<Self> {
        Ok(Self {
            table: JsonTable::open(path)?,
        })
    }
}

#[async_trait]
impl CredentialStore for CredentialStorage {
    async fn put(&self, record: CredentialRecord) -> StorageResult<()> {
        let key = record.storage_key();
        let mut rows = self.table.rows.write().await;
        let previous = rows.insert(key.clone(), record);
        self.table.commit(&mut rows, &key, previous)
    }

    async fn load(&self, session_id: &SessionId) -> StorageResult<Vec<CredentialRecord>> {
        let rows = self.table.rows.read().await;
        let mut records: Vec<CredentialRecord> = rows
            .values()
            .filter(|r| &r.session_id == session_id)
            .cloned()
            .collect();
        records.sort_by(|a, b| a.key_type.cmp(&b.key_type));
        Ok(records)
    }

    async fn remove_session(&self, session_id: &SessionId) -> StorageResult<usize> {
        let mut rows = self.table.rows.write().await;
        let removed: Vec<(String, CredentialRecord)> = rows
            .iter()
            .filter(|(_, r)| &r.session_id == session_id)
            .map(|(k, r)| (k.clone(), r.clone()))
            .collect();
        if removed.is_empty() {
            return Ok(0);
        }

        for (key, _) in &removed {
            rows.remove(key);
        }
        if let Err(e) = self.table.persist(&rows) {
            for (key, record) in removed {
                rows.insert(key, record);
            }
            return Err(e);
        }
        info!(
            "Removed {} credential record(s) for session {}",
            removed.len(),
            session_id
        );
        Ok(removed.len())
    }
}

/// Linked device storage manager
pub struct DeviceStorage {
    table: JsonTable<LinkedDevice>,
}

impl DeviceStorage {
    pub fn in_memory() -> Self {
        Self {
            table: JsonTable::in_memory(),
        }
    }

    pub async fn with_path(path: PathBuf) -> StorageResult<Self> {
        Ok(Self {
            table: JsonTable::open(path)?,
        })
    }

    /// Get the number of linked devices
    pub async fn device_count(&self) -> usize {
        self.table.rows.read().await.len()
    }
}

#[async_trait]
impl DeviceStore for DeviceStorage {
    async fn insert(&self, device: LinkedDevice) -> StorageResult<()> {
        let key = device.id.to_string();
        let mut rows = self.table.rows.write().await;
        if rows.contains_key(&key) {
            return Err(StorageError::AlreadyExists(key));
        }
        rows.insert(key.clone(), device);
        self.table.commit(&mut rows, &key, None)?;
        info!("Saved device {}", key);
        Ok(())
    }

    async fn remove(&self, id: &DeviceId) -> StorageResult<()> {
        let key = id.to_string();
        let mut rows = self.table.rows.write().await;
        let Some(previous) = rows.remove(&key) else {
            return Err(StorageError::NotFound(key));
        };
        self.table.commit(&mut rows, &key, Some(previous))?;
        info!("Removed device {}", key);
        Ok(())
    }

    async fn find_by_session(&self, session_id: &SessionId) -> StorageResult<Option<LinkedDevice>> {
        let rows = self.table.rows.read().await;
        Ok(rows.values().find(|d| &d.session_id == session_id).cloned())
    }

    async fn list_by_tenant(&self, tenant_id: Uuid) -> StorageResult<Vec<LinkedDevice>> {
        let rows = self.table.rows.read().await;
        let mut devices: Vec<LinkedDevice> = rows
            .values()
            .filter(|d| d.tenant_id == tenant_id)
            .cloned()
            .collect();
        devices.sort_by_key(|d| d.linked_at);
        Ok(devices)
    }

    async fn get_by_credential_hash(&self, hash: &str) -> StorageResult<Option<LinkedDevice>> {
        let rows = self.table.rows.read().await;
        Ok(rows.values().find(|d| d.credential_hash == hash).cloned())
    }
}

/// The three stores the lifecycle controller works against
#[derive(Clone)]
pub struct Stores {
    pub sessions: Arc<dyn SessionStore>,
    pub credentials: Arc<dyn CredentialStore>,
    pub devices: Arc<dyn DeviceStore>,
}

impl Stores {
    /// Memory-only stores
    pub fn in_memory() -> Self {
        Self {
            sessions: Arc::new(SessionStorage::in_memory()),
            credentials: Arc::new(CredentialStorage::in_memory()),
            devices: Arc::new(DeviceStorage::in_memory()),
        }
    }

    /// File-backed stores under `dir`
    pub async fn open(dir: &Path) -> StorageResult<Self> {
        Ok(Self {
            sessions: Arc::new(SessionStorage::with_path(dir.join("sessions.json")).await?),
            credentials: Arc::new(CredentialStorage::with_path(dir.join("credentials.json")).await?),
            devices: Arc::new(DeviceStorage::with_path(dir.join("devices.json")).await?),
        })
    }
}
