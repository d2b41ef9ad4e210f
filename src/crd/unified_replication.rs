//! UnifiedVolumeReplication CRD
//!
//! A single replication resource that is translated onto whichever
//! vendor backend (Ceph, Trident, PowerStore) is installed and capable.

use crate::domain::ports::Backend;
use chrono::{DateTime, Utc};
use kube::CustomResource;
use schemars::JsonSchema;
use serde::{Deserialize, Serialize};

// =============================================================================
// UnifiedVolumeReplication CRD
// =============================================================================

/// UnifiedVolumeReplication describes the desired replication relationship
/// for one volume independently of the storage vendor.
#[derive(CustomResource, Debug, Clone, Serialize, Deserialize, JsonSchema)]
#[kube(
    group = "replication.unified.io",
    version = "v1alpha1",
    kind = "UnifiedVolumeReplication",
    plural = "unifiedvolumereplications",
    shortname = "uvr",
    status = "UnifiedVolumeReplicationStatus",
    printcolumn = r#"{"name": "State", "type": "string", "jsonPath": ".spec.replicationState"}"#,
    printcolumn = r#"{"name": "Mode", "type": "string", "jsonPath": ".spec.replicationMode"}"#,
    printcolumn = r#"{"name": "Backend", "type": "string", "jsonPath": ".status.backend"}"#,
    printcolumn = r#"{"name": "Phase", "type": "string", "jsonPath": ".status.phase"}"#,
    printcolumn = r#"{"name": "Age", "type": "date", "jsonPath": ".metadata.creationTimestamp"}"#,
    namespaced
)]
#[serde(rename_all = "camelCase")]
pub struct UnifiedVolumeReplicationSpec {
    /// Cluster hosting the primary copy
    #[serde(default)]
    pub source_endpoint: Endpoint,

    /// Cluster receiving the replica
    #[serde(default)]
    pub destination_endpoint: Endpoint,

    /// Volumes on either side of the relationship
    #[serde(default)]
    pub volume_mapping: VolumeMapping,

    /// Desired replication state
    pub replication_state: ReplicationState,

    /// Replication mode
    #[serde(default)]
    pub replication_mode: ReplicationMode,

    /// Replication schedule and objectives
    #[serde(default)]
    pub schedule: ReplicationSchedule,

    /// Backend-specific settings; setting exactly one block pins the backend
    #[serde(default)]
    pub extensions: Option<Extensions>,
}

// =============================================================================
// Sub-Types
// =============================================================================

/// Abstract replication lifecycle state
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize, Deserialize, JsonSchema)]
#[serde(rename_all = "lowercase")]
pub enum ReplicationState {
    /// No state has been observed yet
    #[default]
    #[serde(rename = "")]
    Initial,
    Replica,
    Source,
    Promoting,
    Demoting,
    Syncing,
    Failed,
}

impl ReplicationState {
    /// Every state, including the initial one
    pub const ALL: [ReplicationState; 7] = [
        ReplicationState::Initial,
        ReplicationState::Replica,
        ReplicationState::Source,
        ReplicationState::Promoting,
        ReplicationState::Demoting,
        ReplicationState::Syncing,
        ReplicationState::Failed,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            ReplicationState::Initial => "",
            ReplicationState::Replica => "replica",
            ReplicationState::Source => "source",
            ReplicationState::Promoting => "promoting",
            ReplicationState::Demoting => "demoting",
            ReplicationState::Syncing => "syncing",
            ReplicationState::Failed => "failed",
        }
    }

    /// Name used in log lines and error messages
    pub fn describe(&self) -> &'static str {
        match self {
            ReplicationState::Initial => "<initial>",
            other => other.as_str(),
        }
    }
}

impl std::fmt::Display for ReplicationState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

/// Replication mode
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize, JsonSchema)]
#[serde(rename_all = "lowercase")]
pub enum ReplicationMode {
    Synchronous,
    #[default]
    Asynchronous,
    Eventual,
}

impl std::fmt::Display for ReplicationMode {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ReplicationMode::Synchronous => write!(f, "synchronous"),
            ReplicationMode::Asynchronous => write!(f, "asynchronous"),
            ReplicationMode::Eventual => write!(f, "eventual"),
        }
    }
}

/// Cluster endpoint of a replication relationship
#[derive(Debug, Clone, Default, Serialize, Deserialize, JsonSchema)]
#[serde(rename_all = "camelCase")]
pub struct Endpoint {
    #[serde(default)]
    pub cluster: String,
    #[serde(default)]
    pub region: String,
    #[serde(default)]
    pub storage_class: String,
}

/// Source/destination volume pairing
#[derive(Debug, Clone, Default, Serialize, Deserialize, JsonSchema)]
#[serde(rename_all = "camelCase")]
pub struct VolumeMapping {
    #[serde(default)]
    pub source: VolumeSource,
    #[serde(default)]
    pub destination: VolumeDestination,
}

/// Source PVC reference
#[derive(Debug, Clone, Default, Serialize, Deserialize, JsonSchema)]
#[serde(rename_all = "camelCase")]
pub struct VolumeSource {
    #[serde(default)]
    pub pvc_name: String,
    #[serde(default)]
    pub namespace: String,
}

/// Destination volume reference
#[derive(Debug, Clone, Default, Serialize, Deserialize, JsonSchema)]
#[serde(rename_all = "camelCase")]
pub struct VolumeDestination {
    #[serde(default)]
    pub volume_handle: String,
    #[serde(default)]
    pub namespace: String,
}

/// Schedule mode
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize, JsonSchema)]
#[serde(rename_all = "lowercase")]
pub enum ScheduleMode {
    #[default]
    Continuous,
    Interval,
}

/// Replication schedule and recovery objectives
#[derive(Debug, Clone, Default, Serialize, Deserialize, JsonSchema)]
#[serde(rename_all = "camelCase")]
pub struct ReplicationSchedule {
    #[serde(default)]
    pub mode: ScheduleMode,
    /// Recovery point objective (e.g. "15m")
    #[serde(default)]
    pub rpo: Option<String>,
    /// Recovery time objective (e.g. "5m")
    #[serde(default)]
    pub rto: Option<String>,
}

/// Backend-specific extension blocks
#[derive(Debug, Clone, Default, Serialize, Deserialize, JsonSchema)]
#[serde(rename_all = "camelCase")]
pub struct Extensions {
    #[serde(default)]
    pub ceph: Option<CephExtensions>,
    #[serde(default)]
    pub trident: Option<TridentExtensions>,
    #[serde(default)]
    pub powerstore: Option<PowerStoreExtensions>,
}

impl Extensions {
    /// Backend pinned by the extension block, if exactly one block is set
    pub fn pinned_backend(&self) -> Option<Backend> {
        let set: Vec<Backend> = [
            self.ceph.as_ref().map(|_| Backend::Ceph),
            self.trident.as_ref().map(|_| Backend::Trident),
            self.powerstore.as_ref().map(|_| Backend::PowerStore),
        ]
        .into_iter()
        .flatten()
        .collect();

        match set.as_slice() {
            [only] => Some(*only),
            _ => None,
        }
    }
}

/// Ceph mirroring mode
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, JsonSchema)]
#[serde(rename_all = "lowercase")]
pub enum CephMirroringMode {
    Journal,
    Snapshot,
}

/// Ceph-specific settings
#[derive(Debug, Clone, Default, Serialize, Deserialize, JsonSchema)]
#[serde(rename_all = "camelCase")]
pub struct CephExtensions {
    #[serde(default)]
    pub mirroring_mode: Option<CephMirroringMode>,
    /// Start time for snapshot schedules
    #[serde(default)]
    pub scheduling_start_time: Option<String>,
}

/// Trident mirror action
#[derive(Debug, Clone, Serialize, Deserialize, JsonSchema)]
#[serde(rename_all = "camelCase")]
pub struct TridentAction {
    /// Action type, e.g. `mirror-update`
    pub r#type: String,
    #[serde(default)]
    pub snapshot_handle: Option<String>,
}

/// Trident-specific settings
#[derive(Debug, Clone, Default, Serialize, Deserialize, JsonSchema)]
#[serde(rename_all = "camelCase")]
pub struct TridentExtensions {
    #[serde(default)]
    pub actions: Vec<TridentAction>,
}

/// PowerStore-specific settings
#[derive(Debug, Clone, Default, Serialize, Deserialize, JsonSchema)]
#[serde(rename_all = "camelCase")]
pub struct PowerStoreExtensions {
    /// Named RPO policy, e.g. `Five_Minutes`
    #[serde(default)]
    pub rpo_settings: Option<String>,
    /// Volume groups replicated together as one consistency group
    #[serde(default)]
    pub volume_groups: Vec<String>,
}

// =============================================================================
// Status
// =============================================================================

/// Status of a UnifiedVolumeReplication
#[derive(Debug, Clone, Default, Serialize, Deserialize, JsonSchema)]
#[serde(rename_all = "camelCase")]
pub struct UnifiedVolumeReplicationStatus {
    /// Current phase
    #[serde(default)]
    pub phase: ReplicationPhase,

    /// Replication state last observed on the backend
    #[serde(default)]
    pub state: ReplicationState,

    /// Backend serving this resource
    #[serde(default)]
    pub backend: Option<Backend>,

    /// Human-readable status message
    #[serde(default)]
    pub message: Option<String>,

    /// Generation of the spec last reconciled
    #[serde(default)]
    pub observed_generation: Option<i64>,

    /// Last successful sync reported by the backend
    #[serde(default)]
    #[schemars(with = "Option<String>")]
    pub last_sync_time: Option<DateTime<Utc>>,

    /// Last reconcile time
    #[serde(default)]
    #[schemars(with = "Option<String>")]
    pub last_reconcile_time: Option<DateTime<Utc>>,

    /// Conditions
    #[serde(default)]
    pub conditions: Vec<ReplicationCondition>,
}

/// Replication lifecycle phase
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize, JsonSchema)]
pub enum ReplicationPhase {
    #[default]
    Pending,
    Ready,
    Degraded,
    Error,
    Deleting,
}

impl std::fmt::Display for ReplicationPhase {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ReplicationPhase::Pending => write!(f, "Pending"),
            ReplicationPhase::Ready => write!(f, "Ready"),
            ReplicationPhase::Degraded => write!(f, "Degraded"),
            ReplicationPhase::Error => write!(f, "Error"),
            ReplicationPhase::Deleting => write!(f, "Deleting"),
        }
    }
}

/// Condition for replication status
#[derive(Debug, Clone, Serialize, Deserialize, JsonSchema)]
#[serde(rename_all = "camelCase")]
pub struct ReplicationCondition {
    /// Type of condition
    pub r#type: String,
    /// Status: True, False, Unknown
    pub status: ConditionStatus,
    /// Last transition time
    #[serde(default)]
    #[schemars(with = "Option<String>")]
    pub last_transition_time: Option<DateTime<Utc>>,
    /// Machine-readable reason
    #[serde(default)]
    pub reason: Option<String>,
    /// Human-readable message
    #[serde(default)]
    pub message: Option<String>,
}

impl ReplicationCondition {
    pub fn new(r#type: &str, status: ConditionStatus, reason: &str, message: impl Into<String>) -> Self {
        Self {
            r#type: r#type.to_string(),
            status,
            last_transition_time: Some(Utc::now()),
            reason: Some(reason.to_string()),
            message: Some(message.into()),
        }
    }
}

/// Condition status values
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, JsonSchema)]
pub enum ConditionStatus {
    True,
    False,
    Unknown,
}

/// Condition type reporting overall readiness
pub const CONDITION_READY: &str = "Ready";
/// Condition type reporting spec validation
pub const CONDITION_VALID: &str = "Valid";

// =============================================================================
// Implementations
// =============================================================================

impl UnifiedVolumeReplication {
    /// Get the name of this resource
    pub fn name(&self) -> &str {
        self.metadata.name.as_deref().unwrap_or("unknown")
    }

    /// Get the namespace of this resource
    pub fn namespace(&self) -> &str {
        self.metadata.namespace.as_deref().unwrap_or("default")
    }

    /// `namespace/name` key used by retry bookkeeping
    pub fn key(&self) -> String {
        format!("{}/{}", self.namespace(), self.name())
    }

    /// Whether the resource is being deleted
    pub fn is_deleting(&self) -> bool {
        self.metadata.deletion_timestamp.is_some()
    }

    /// Replication state last observed, `Initial` when never reconciled
    pub fn observed_state(&self) -> ReplicationState {
        self.status.as_ref().map(|s| s.state).unwrap_or_default()
    }
}

impl UnifiedVolumeReplicationStatus {
    /// Set a condition, replacing existing if same type
    pub fn set_condition(&mut self, condition: ReplicationCondition) {
        if let Some(existing) = self
            .conditions
            .iter_mut()
            .find(|c| c.r#type == condition.r#type)
        {
            *existing = condition;
        } else {
            self.conditions.push(condition);
        }
    }

    /// Look up a condition by type
    pub fn condition(&self, r#type: &str) -> Option<&ReplicationCondition> {
        self.conditions.iter().find(|c| c.r#type == r#type)
    }

    /// Check if replication is ready
    pub fn is_ready(&self) -> bool {
        self.phase == ReplicationPhase::Ready
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_state_serde() {
        let json = serde_json::to_string(&ReplicationState::Promoting).unwrap();
        assert_eq!(json, "\"promoting\"");

        let initial: ReplicationState = serde_json::from_str("\"\"").unwrap();
        assert_eq!(initial, ReplicationState::Initial);
        assert_eq!(ReplicationState::Initial.describe(), "<initial>");
    }

    #[test]
    fn test_pinned_backend() {
        let mut ext = Extensions::default();
        assert_eq!(ext.pinned_backend(), None);

        ext.trident = Some(TridentExtensions::default());
        assert_eq!(ext.pinned_backend(), Some(Backend::Trident));

        ext.ceph = Some(CephExtensions::default());
        assert_eq!(ext.pinned_backend(), None);
    }

    #[test]
    fn test_spec_from_yaml() {
        let yaml = r#"
replicationState: replica
replicationMode: synchronous
volumeMapping:
  source:
    pvcName: db-data
    namespace: prod
extensions:
  powerstore:
    rpoSettings: Five_Minutes
    volumeGroups: ["vg-1"]
"#;
        let spec: UnifiedVolumeReplicationSpec = serde_yaml::from_str(yaml).unwrap();
        assert_eq!(spec.replication_state, ReplicationState::Replica);
        assert_eq!(spec.replication_mode, ReplicationMode::Synchronous);
        assert_eq!(spec.volume_mapping.source.pvc_name, "db-data");
        assert_eq!(spec.schedule.mode, ScheduleMode::Continuous);
        let ext = spec.extensions.unwrap();
        assert_eq!(ext.pinned_backend(), Some(Backend::PowerStore));
    }

    #[test]
    fn test_set_condition_replaces() {
        let mut status = UnifiedVolumeReplicationStatus::default();
        status.set_condition(ReplicationCondition::new(
            CONDITION_READY,
            ConditionStatus::False,
            "Pending",
            "waiting",
        ));
        status.set_condition(ReplicationCondition::new(
            CONDITION_READY,
            ConditionStatus::True,
            "Reconciled",
            "ok",
        ));
        assert_eq!(status.conditions.len(), 1);
        assert_eq!(
            status.condition(CONDITION_READY).unwrap().status,
            ConditionStatus::True
        );
    }
}
