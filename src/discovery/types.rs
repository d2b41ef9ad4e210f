//! Discovery Types
//!
//! Schema requirements per backend and the immutable snapshots produced
//! by a detection pass.

use crate::domain::ports::Backend;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::time::Duration;

// =============================================================================
// Schema Requirements
// =============================================================================

/// A schema declaration whose presence signals that a backend is installed
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct SchemaRequirement {
    pub name: &'static str,
    pub group: &'static str,
    pub version: &'static str,
    pub kind: &'static str,
    /// Required schemas must all be established for the backend to be available
    pub required: bool,
}

const fn schema(
    name: &'static str,
    group: &'static str,
    version: &'static str,
    kind: &'static str,
    required: bool,
) -> SchemaRequirement {
    SchemaRequirement {
        name,
        group,
        version,
        kind,
        required,
    }
}

const CEPH_SCHEMAS: &[SchemaRequirement] = &[
    schema(
        "volumereplications.replication.storage.openshift.io",
        "replication.storage.openshift.io",
        "v1alpha1",
        "VolumeReplication",
        true,
    ),
    schema(
        "volumereplicationclasses.replication.storage.openshift.io",
        "replication.storage.openshift.io",
        "v1alpha1",
        "VolumeReplicationClass",
        true,
    ),
    schema(
        "volumegroupreplications.replication.storage.openshift.io",
        "replication.storage.openshift.io",
        "v1alpha1",
        "VolumeGroupReplication",
        false,
    ),
];

const TRIDENT_SCHEMAS: &[SchemaRequirement] = &[
    schema(
        "tridentmirrorrelationships.trident.netapp.io",
        "trident.netapp.io",
        "v1",
        "TridentMirrorRelationship",
        true,
    ),
    schema(
        "tridentbackendconfigs.trident.netapp.io",
        "trident.netapp.io",
        "v1",
        "TridentBackendConfig",
        true,
    ),
    schema(
        "tridentactionmirrorupdates.trident.netapp.io",
        "trident.netapp.io",
        "v1",
        "TridentActionMirrorUpdate",
        false,
    ),
];

const POWERSTORE_SCHEMAS: &[SchemaRequirement] = &[schema(
    "dellcsireplicationgroups.replication.storage.dell.com",
    "replication.storage.dell.com",
    "v1",
    "DellCSIReplicationGroup",
    true,
)];

/// Ordered schema requirements for a backend
pub fn schema_requirements(backend: Backend) -> &'static [SchemaRequirement] {
    match backend {
        Backend::Ceph => CEPH_SCHEMAS,
        Backend::Trident => TRIDENT_SCHEMAS,
        Backend::PowerStore => POWERSTORE_SCHEMAS,
    }
}

/// Controller deployment that runs a backend's replication machinery
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ControllerRef {
    pub namespace: String,
    pub name: String,
}

impl ControllerRef {
    /// Default controller location for a backend
    pub fn default_for(backend: Backend) -> Self {
        let (namespace, name) = match backend {
            Backend::Ceph => ("rook-ceph", "csi-rbdplugin-provisioner"),
            Backend::Trident => ("trident", "trident-controller"),
            Backend::PowerStore => (
                "dell-replication-controller",
                "dell-replication-controller-manager",
            ),
        };
        Self {
            namespace: namespace.to_string(),
            name: name.to_string(),
        }
    }
}

// =============================================================================
// Discovery Results
// =============================================================================

/// Availability verdict for a backend
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub enum DiscoveryStatus {
    Available,
    Partial,
    Unavailable,
    #[default]
    Unknown,
}

impl DiscoveryStatus {
    /// Grade a backend from its required-schema counts
    pub fn from_counts(present: usize, total: usize) -> Self {
        if total == 0 || present == 0 {
            DiscoveryStatus::Unavailable
        } else if present == total {
            DiscoveryStatus::Available
        } else {
            DiscoveryStatus::Partial
        }
    }
}

impl std::fmt::Display for DiscoveryStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            DiscoveryStatus::Available => write!(f, "Available"),
            DiscoveryStatus::Partial => write!(f, "Partial"),
            DiscoveryStatus::Unavailable => write!(f, "Unavailable"),
            DiscoveryStatus::Unknown => write!(f, "Unknown"),
        }
    }
}

/// Availability of one schema declaration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SchemaAvailability {
    pub name: String,
    pub group: String,
    pub version: String,
    pub kind: String,
    pub required: bool,
    pub available: bool,
}

/// Result of detecting a single backend
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BackendDiscoveryResult {
    pub backend: Backend,
    pub status: DiscoveryStatus,
    pub schemas: Vec<SchemaAvailability>,
    pub message: String,
    pub last_updated: DateTime<Utc>,
}

impl BackendDiscoveryResult {
    /// Result for a backend whose detection could not complete
    pub fn unknown(backend: Backend, message: impl Into<String>) -> Self {
        Self {
            backend,
            status: DiscoveryStatus::Unknown,
            schemas: Vec::new(),
            message: message.into(),
            last_updated: Utc::now(),
        }
    }

    pub fn is_available(&self) -> bool {
        self.status == DiscoveryStatus::Available
    }

    /// Names of required schemas that are not established
    pub fn missing_required(&self) -> Vec<&str> {
        self.schemas
            .iter()
            .filter(|s| s.required && !s.available)
            .map(|s| s.name.as_str())
            .collect()
    }
}

/// Aggregate result of one discovery pass
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DiscoveryResult {
    pub backends: BTreeMap<Backend, BackendDiscoveryResult>,
    /// Available backends in discovery order
    pub available: Vec<Backend>,
    pub timestamp: DateTime<Utc>,
    /// Summary of per-backend failures, if any
    pub error: Option<String>,
}

impl DiscoveryResult {
    pub fn is_available(&self, backend: Backend) -> bool {
        self.available.contains(&backend)
    }

    pub fn status_of(&self, backend: Backend) -> DiscoveryStatus {
        self.backends
            .get(&backend)
            .map(|r| r.status)
            .unwrap_or_default()
    }
}

// =============================================================================
// Configuration
// =============================================================================

/// Configuration for the discovery engine
#[derive(Debug, Clone)]
pub struct DiscoveryConfig {
    /// Per-backend detection timeout
    pub timeout: Duration,
    /// Retries after the first failed detection
    pub max_retries: u32,
    /// Fixed delay between detection retries
    pub retry_delay: Duration,
    /// How long a discovery result stays valid
    pub cache_ttl: Duration,
    /// Interval for the auto-refresh loop
    pub refresh_interval: Duration,
    /// Backends to detect
    pub backends: Vec<Backend>,
    /// Also require the controller deployment when validating a backend
    pub check_controllers: bool,
}

impl Default for DiscoveryConfig {
    fn default() -> Self {
        Self {
            timeout: Duration::from_secs(30),
            max_retries: 3,
            retry_delay: Duration::from_secs(2),
            cache_ttl: Duration::from_secs(300),
            refresh_interval: Duration::from_secs(240),
            backends: Backend::ALL.to_vec(),
            check_controllers: true,
        }
    }
}
