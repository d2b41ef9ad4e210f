//! Capability Types
//!
//! Abstract replication features, graded support levels, health and
//! performance snapshots, and the query/score types used for ranking.

use crate::domain::ports::Backend;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::time::Duration;

// =============================================================================
// Capability
// =============================================================================

/// Abstract replication feature whose support varies per backend
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum Capability {
    AsyncReplication,
    SyncReplication,
    MetroReplication,
    EventualReplication,
    Promotion,
    Demotion,
    Resync,
    Failover,
    Failback,
    ConsistencyGroups,
    VolumeGroups,
    Snapshots,
    SnapshotSchedules,
    ScheduledReplication,
    BandwidthLimiting,
    Compression,
    Encryption,
    Deduplication,
    MultiSite,
    CrossCluster,
    AutoResync,
    PointInTimeRecovery,
    PauseResume,
    HealthMonitoring,
    MetricsReporting,
}

impl Capability {
    pub const ALL: [Capability; 25] = [
        Capability::AsyncReplication,
        Capability::SyncReplication,
        Capability::MetroReplication,
        Capability::EventualReplication,
        Capability::Promotion,
        Capability::Demotion,
        Capability::Resync,
        Capability::Failover,
        Capability::Failback,
        Capability::ConsistencyGroups,
        Capability::VolumeGroups,
        Capability::Snapshots,
        Capability::SnapshotSchedules,
        Capability::ScheduledReplication,
        Capability::BandwidthLimiting,
        Capability::Compression,
        Capability::Encryption,
        Capability::Deduplication,
        Capability::MultiSite,
        Capability::CrossCluster,
        Capability::AutoResync,
        Capability::PointInTimeRecovery,
        Capability::PauseResume,
        Capability::HealthMonitoring,
        Capability::MetricsReporting,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            Capability::AsyncReplication => "async-replication",
            Capability::SyncReplication => "sync-replication",
            Capability::MetroReplication => "metro-replication",
            Capability::EventualReplication => "eventual-replication",
            Capability::Promotion => "promotion",
            Capability::Demotion => "demotion",
            Capability::Resync => "resync",
            Capability::Failover => "failover",
            Capability::Failback => "failback",
            Capability::ConsistencyGroups => "consistency-groups",
            Capability::VolumeGroups => "volume-groups",
            Capability::Snapshots => "snapshots",
            Capability::SnapshotSchedules => "snapshot-schedules",
            Capability::ScheduledReplication => "scheduled-replication",
            Capability::BandwidthLimiting => "bandwidth-limiting",
            Capability::Compression => "compression",
            Capability::Encryption => "encryption",
            Capability::Deduplication => "deduplication",
            Capability::MultiSite => "multi-site",
            Capability::CrossCluster => "cross-cluster",
            Capability::AutoResync => "auto-resync",
            Capability::PointInTimeRecovery => "point-in-time-recovery",
            Capability::PauseResume => "pause-resume",
            Capability::HealthMonitoring => "health-monitoring",
            Capability::MetricsReporting => "metrics-reporting",
        }
    }
}

impl std::fmt::Display for Capability {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

// =============================================================================
// Capability Level
// =============================================================================

/// Graded support level
///
/// Ordered `None < Unknown < Basic < Partial < Full`; a minimum level of
/// `Basic` therefore excludes levels that have not been determined.
#[derive(
    Debug, Clone, Copy, Default, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize,
)]
pub enum CapabilityLevel {
    None,
    #[default]
    Unknown,
    Basic,
    Partial,
    Full,
}

impl CapabilityLevel {
    /// Scoring weight used by capability ranking
    pub fn weight(&self) -> f64 {
        match self {
            CapabilityLevel::Full => 1.0,
            CapabilityLevel::Partial => 0.7,
            CapabilityLevel::Basic => 0.5,
            CapabilityLevel::Unknown | CapabilityLevel::None => 0.0,
        }
    }

    /// Whether the level permits using the feature at all
    pub fn is_supported(&self) -> bool {
        !matches!(self, CapabilityLevel::None)
    }
}

impl std::fmt::Display for CapabilityLevel {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            CapabilityLevel::None => write!(f, "None"),
            CapabilityLevel::Unknown => write!(f, "Unknown"),
            CapabilityLevel::Basic => write!(f, "Basic"),
            CapabilityLevel::Partial => write!(f, "Partial"),
            CapabilityLevel::Full => write!(f, "Full"),
        }
    }
}

/// Support details for one capability on one backend
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CapabilityInfo {
    pub capability: Capability,
    pub level: CapabilityLevel,
    #[serde(default)]
    pub description: String,
    #[serde(default)]
    pub limitations: Vec<String>,
    #[serde(default)]
    pub requirements: Vec<String>,
    pub last_checked: DateTime<Utc>,
}

impl CapabilityInfo {
    pub fn new(capability: Capability, level: CapabilityLevel, description: impl Into<String>) -> Self {
        Self {
            capability,
            level,
            description: description.into(),
            limitations: Vec::new(),
            requirements: Vec::new(),
            last_checked: Utc::now(),
        }
    }

    pub fn with_limitation(mut self, limitation: impl Into<String>) -> Self {
        self.limitations.push(limitation.into());
        self
    }

    pub fn with_requirement(mut self, requirement: impl Into<String>) -> Self {
        self.requirements.push(requirement.into());
        self
    }
}

// =============================================================================
// Health
// =============================================================================

/// Health grade
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum HealthLevel {
    Healthy,
    Degraded,
    Unhealthy,
    #[default]
    Unknown,
}

impl std::fmt::Display for HealthLevel {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            HealthLevel::Healthy => write!(f, "Healthy"),
            HealthLevel::Degraded => write!(f, "Degraded"),
            HealthLevel::Unhealthy => write!(f, "Unhealthy"),
            HealthLevel::Unknown => write!(f, "Unknown"),
        }
    }
}

/// One named sub-check
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct HealthCheck {
    pub name: String,
    pub level: HealthLevel,
    #[serde(default)]
    pub message: String,
    pub duration: Duration,
    /// Only required checks feed the overall grade
    pub required: bool,
}

/// Health snapshot for a backend
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct HealthStatus {
    pub level: HealthLevel,
    #[serde(default)]
    pub message: String,
    /// `None` until the backend has been checked
    #[serde(default)]
    pub last_checked: Option<DateTime<Utc>>,
    #[serde(default)]
    pub checks: Vec<HealthCheck>,
}

impl HealthStatus {
    /// Status for a backend that has not been checked
    pub fn unknown() -> Self {
        Self::default()
    }

    /// Single-level status without sub-checks
    pub fn with_level(level: HealthLevel, message: impl Into<String>) -> Self {
        Self {
            level,
            message: message.into(),
            last_checked: Some(Utc::now()),
            checks: Vec::new(),
        }
    }

    /// Grade a set of sub-checks
    ///
    /// Healthy iff every required check is healthy, Unhealthy iff none is,
    /// Degraded otherwise. With no required checks the status is Unknown.
    pub fn from_checks(checks: Vec<HealthCheck>) -> Self {
        let required: Vec<&HealthCheck> = checks.iter().filter(|c| c.required).collect();
        let healthy = required
            .iter()
            .filter(|c| c.level == HealthLevel::Healthy)
            .count();

        let (level, message) = if required.is_empty() {
            (HealthLevel::Unknown, "no required checks".to_string())
        } else if healthy == required.len() {
            (HealthLevel::Healthy, format!("all {} checks healthy", healthy))
        } else if healthy == 0 {
            (HealthLevel::Unhealthy, "no required checks healthy".to_string())
        } else {
            (
                HealthLevel::Degraded,
                format!("{}/{} required checks healthy", healthy, required.len()),
            )
        };

        Self {
            level,
            message,
            last_checked: Some(Utc::now()),
            checks,
        }
    }

    pub fn is_healthy(&self) -> bool {
        self.level == HealthLevel::Healthy
    }
}

// =============================================================================
// Performance / Version
// =============================================================================

/// Performance profile of a backend
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PerformanceCharacteristics {
    /// Lowest achievable RPO in seconds (0 for synchronous)
    pub min_rpo_seconds: u64,
    /// Typical failover time in seconds
    pub typical_rto_seconds: u64,
    pub max_volumes_per_group: Option<u32>,
    pub max_throughput_mbps: Option<u64>,
    /// Round-trip latency of a store lookup measured at sampling time
    pub api_latency_ms: Option<f64>,
    pub sampled_at: Option<DateTime<Utc>>,
}

/// Version details derived from a backend's schema declarations
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct VersionInfo {
    /// `group/version` of the backend's primary schema
    pub api_version: String,
    /// Storage version per installed schema
    pub schema_versions: BTreeMap<String, String>,
    pub detected_at: Option<DateTime<Utc>>,
}

// =============================================================================
// Backend Capabilities
// =============================================================================

/// Everything known about one backend's capabilities
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct BackendCapabilities {
    pub backend: Backend,
    pub capabilities: BTreeMap<Capability, CapabilityInfo>,
    #[serde(default)]
    pub version: Option<VersionInfo>,
    #[serde(default)]
    pub health: HealthStatus,
    #[serde(default)]
    pub performance: Option<PerformanceCharacteristics>,
    pub last_updated: DateTime<Utc>,
}

impl BackendCapabilities {
    pub fn new(backend: Backend) -> Self {
        Self {
            backend,
            capabilities: BTreeMap::new(),
            version: None,
            health: HealthStatus::unknown(),
            performance: None,
            last_updated: Utc::now(),
        }
    }

    pub fn with_capability(mut self, info: CapabilityInfo) -> Self {
        self.capabilities.insert(info.capability, info);
        self
    }

    pub fn with_health(mut self, health: HealthStatus) -> Self {
        self.health = health;
        self
    }

    /// Level recorded for a capability, if any
    pub fn level(&self, capability: Capability) -> Option<CapabilityLevel> {
        self.capabilities.get(&capability).map(|info| info.level)
    }

    /// Merge an update into this entry
    ///
    /// Capabilities present in the update overwrite; those it omits are kept.
    /// Health, version and performance are replaced only when the update
    /// carries them.
    pub fn merge(&mut self, update: BackendCapabilities) {
        self.capabilities.extend(update.capabilities);
        if update.version.is_some() {
            self.version = update.version;
        }
        if update.performance.is_some() {
            self.performance = update.performance;
        }
        if update.health.last_checked.is_some() {
            self.health = update.health;
        }
        self.last_updated = Utc::now();
    }
}

// =============================================================================
// Query / Score
// =============================================================================

/// Capability-based backend selection request
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CapabilityQuery {
    #[serde(default)]
    pub required: Vec<Capability>,
    #[serde(default)]
    pub optional: Vec<Capability>,
    /// Required capabilities below this level disqualify a backend
    #[serde(default)]
    pub min_level: CapabilityLevel,
    #[serde(default)]
    pub require_healthy: bool,
    /// Backend to choose when it is eligible, regardless of rank
    #[serde(default)]
    pub preferred: Option<Backend>,
}

impl CapabilityQuery {
    pub fn new(required: impl IntoIterator<Item = Capability>) -> Self {
        Self {
            required: required.into_iter().collect(),
            min_level: CapabilityLevel::None,
            ..Default::default()
        }
    }

    pub fn with_optional(mut self, optional: impl IntoIterator<Item = Capability>) -> Self {
        self.optional.extend(optional);
        self
    }

    pub fn with_min_level(mut self, level: CapabilityLevel) -> Self {
        self.min_level = level;
        self
    }

    pub fn require_healthy(mut self) -> Self {
        self.require_healthy = true;
        self
    }

    pub fn prefer(mut self, backend: Option<Backend>) -> Self {
        self.preferred = backend;
        self
    }
}

/// Ranking entry for an eligible backend
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct BackendScore {
    pub backend: Backend,
    pub score: f64,
    pub health: HealthLevel,
    /// Optional capabilities the backend supports
    pub matched_optional: Vec<Capability>,
}

/// Registry-wide counts
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RegistryStatistics {
    pub total_backends: usize,
    pub healthy: usize,
    pub degraded: usize,
    pub unhealthy: usize,
    pub unknown: usize,
    pub total_capabilities: usize,
}
