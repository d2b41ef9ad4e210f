//! Domain Ports - Core trait definitions for the replication operator
//!
//! These traits define the boundaries between the discovery/capability core
//! and external systems. Adapters implement these traits to provide concrete
//! functionality.

use crate::crd::{ReplicationState, UnifiedVolumeReplication, UnifiedVolumeReplicationStatus};
use crate::error::{Error, Result};
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::sync::Arc;

// =============================================================================
// Backends
// =============================================================================

/// Replication backends known to the control plane
#[derive(
    Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize,
    schemars::JsonSchema,
)]
#[serde(rename_all = "lowercase")]
pub enum Backend {
    /// Ceph RBD mirroring via VolumeReplication resources
    Ceph,
    /// NetApp Trident mirror relationships
    Trident,
    /// Dell PowerStore replication groups
    PowerStore,
}

impl Backend {
    /// All backends in discovery order
    pub const ALL: [Backend; 3] = [Backend::Ceph, Backend::Trident, Backend::PowerStore];

    pub fn as_str(&self) -> &'static str {
        match self {
            Backend::Ceph => "ceph",
            Backend::Trident => "trident",
            Backend::PowerStore => "powerstore",
        }
    }
}

impl std::fmt::Display for Backend {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

impl std::str::FromStr for Backend {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        match s.to_lowercase().as_str() {
            "ceph" | "ceph-csi" | "rbd" => Ok(Backend::Ceph),
            "trident" | "netapp" => Ok(Backend::Trident),
            "powerstore" | "dell" => Ok(Backend::PowerStore),
            other => Err(Error::Configuration(format!("unknown backend: {}", other))),
        }
    }
}

// =============================================================================
// Schema Information
// =============================================================================

/// Description of a schema declaration (CRD) as reported by the store
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SchemaInfo {
    /// Fully qualified name, e.g. `volumereplications.replication.storage.openshift.io`
    pub name: String,
    pub group: String,
    pub version: String,
    pub kind: String,
    /// Whether the API server reports the schema as established
    #[serde(default)]
    pub established: bool,
}

// =============================================================================
// Resource Store Gateway
// =============================================================================

/// Port for schema presence/readiness checks
///
/// Returns `Ok(false)` from [`ResourceStore::schema_established`] when the
/// schema does not exist; errors are reserved for lookups that could not be
/// answered (permissions, transport).
#[async_trait]
pub trait ResourceStore: Send + Sync {
    /// Check whether a named schema exists and is established
    async fn schema_established(&self, name: &str) -> Result<bool>;

    /// Get group/version/kind and readiness for a named schema
    async fn schema_info(&self, name: &str) -> Result<SchemaInfo>;

    /// List schemas, optionally restricted to one API group
    async fn list_schemas(&self, group_filter: Option<&str>) -> Result<Vec<SchemaInfo>>;

    /// Check whether a controller deployment has at least one ready replica
    async fn deployment_ready(&self, namespace: &str, name: &str) -> Result<bool>;
}

/// Port for typed access to unified replication resources
#[async_trait]
pub trait ReplicationStore: Send + Sync {
    /// Get a resource by namespace/name
    async fn get(&self, namespace: &str, name: &str) -> Result<Option<UnifiedVolumeReplication>>;

    /// List resources, optionally filtered by a label selector (`k=v,k2=v2`)
    async fn list(&self, label_selector: Option<&str>) -> Result<Vec<UnifiedVolumeReplication>>;

    /// Replace the status sub-resource
    async fn update_status(
        &self,
        namespace: &str,
        name: &str,
        status: UnifiedVolumeReplicationStatus,
    ) -> Result<()>;
}

// =============================================================================
// Replication Adapter Port
// =============================================================================

/// Backend-reported replication status in unified terms
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AdapterStatus {
    /// Current unified state as observed on the backend
    pub state: ReplicationState,
    /// Whether the backend considers the relationship healthy
    pub healthy: bool,
    /// Human-readable detail
    pub message: String,
    /// Last successful sync reported by the backend
    pub last_sync_time: Option<DateTime<Utc>>,
}

/// Port implemented by per-backend translation adapters
#[async_trait]
pub trait ReplicationAdapter: Send + Sync {
    /// Backend served by this adapter
    fn backend(&self) -> Backend;

    /// Create or update the backend resources to match the unified spec
    async fn ensure_replication(&self, resource: &UnifiedVolumeReplication) -> Result<()>;

    /// Remove the backend resources for a unified resource
    async fn delete_replication(&self, resource: &UnifiedVolumeReplication) -> Result<()>;

    /// Read backend status translated to unified terms
    async fn replication_status(&self, resource: &UnifiedVolumeReplication) -> Result<AdapterStatus>;
}

/// Port for obtaining an adapter for a selected backend
pub trait AdapterFactory: Send + Sync {
    fn create(&self, backend: Backend) -> Result<Arc<dyn ReplicationAdapter>>;
}

// =============================================================================
// Type Aliases for Arc'd Traits
// =============================================================================

pub type ResourceStoreRef = Arc<dyn ResourceStore>;
pub type ReplicationStoreRef = Arc<dyn ReplicationStore>;
pub type ReplicationAdapterRef = Arc<dyn ReplicationAdapter>;
pub type AdapterFactoryRef = Arc<dyn AdapterFactory>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_backend_display() {
        assert_eq!(format!("{}", Backend::Ceph), "ceph");
        assert_eq!(format!("{}", Backend::Trident), "trident");
        assert_eq!(format!("{}", Backend::PowerStore), "powerstore");
    }

    #[test]
    fn test_backend_parse() {
        assert_eq!("Ceph".parse::<Backend>().unwrap(), Backend::Ceph);
        assert_eq!("netapp".parse::<Backend>().unwrap(), Backend::Trident);
        assert_eq!("dell".parse::<Backend>().unwrap(), Backend::PowerStore);
        assert!("longhorn".parse::<Backend>().is_err());
    }
}
