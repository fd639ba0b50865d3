//! Profile resolution
//!
//! Finalizing a session attaches the new device to a profile of the linking
//! tenant. Profiles live in the account subsystem; this module only defines
//! the find-or-create contract and an in-memory resolver.

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use thiserror::Error;
use tokio::sync::RwLock;
use tracing::info;
use uuid::Uuid;

/// Identifier of a profile owned by the account subsystem
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct ProfileId(pub Uuid);

impl ProfileId {
    pub fn new() -> Self {
        Self(Uuid::new_v4())
    }
}

impl Default for ProfileId {
    fn default() -> Self {
        Self::new()
    }
}

impl std::fmt::Display for ProfileId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

#[derive(Debug, Error)]
pub enum ProfileError {
    #[error("Profile lookup failed for tenant {tenant_id}: {reason}")]
    Lookup { tenant_id: Uuid, reason: String },
}

impl From<ProfileError> for devlink_core::Error {
    fn from(err: ProfileError) -> Self {
        devlink_core::Error::Storage(err.to_string())
    }
}

/// Find-or-create the profile a linked device belongs to
#[async_trait]
pub trait ProfileResolver: Send + Sync {
    async fn resolve_or_create(
        &self,
        tenant_id: Uuid,
        device_info: Option<&str>,
    ) -> Result<ProfileId, ProfileError>;
}

/// One profile per tenant, created on first use
#[derive(Default)]
pub struct TenantProfiles {
    profiles: RwLock<HashMap<Uuid, ProfileId>>,
}

impl TenantProfiles {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl ProfileResolver for TenantProfiles {
    async fn resolve_or_create(
        &self,
        tenant_id: Uuid,
        _device_info: Option<&str>,
    ) -> Result<ProfileId, ProfileError> {
        if let Some(id) = self.profiles.read().await.get(&tenant_id) {
            return Ok(id.clone());
        }

        let mut profiles = self.profiles.write().await;
        let id = profiles.entry(tenant_id).or_insert_with(|| {
            info!("Created profile for tenant {}", tenant_id);
            ProfileId::new()
        });
        Ok(id.clone())
    }
}
