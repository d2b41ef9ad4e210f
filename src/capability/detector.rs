//! Capability Detector
//!
//! Combines static per-backend feature knowledge with live health checks
//! against the backend's schema declarations.

use crate::capability::types::{
    BackendCapabilities, Capability, CapabilityInfo, CapabilityLevel, HealthCheck, HealthLevel,
    HealthStatus, PerformanceCharacteristics, VersionInfo,
};
use crate::discovery::types::{schema_requirements, SchemaRequirement};
use crate::domain::ports::{Backend, ResourceStoreRef};
use crate::error::{Error, Result};
use chrono::Utc;
use std::collections::BTreeMap;
use std::future::Future;
use std::time::{Duration, Instant};
use tokio_util::sync::CancellationToken;
use tracing::{debug, instrument};

use crate::capability::types::{Capability as C, CapabilityLevel as L};

// =============================================================================
// Static Capability Tables
// =============================================================================

type CapabilityEntry = (Capability, CapabilityLevel, &'static str);

const CEPH_CAPABILITIES: &[CapabilityEntry] = &[
    (C::AsyncReplication, L::Full, "RBD mirroring in journal or snapshot mode"),
    (C::SyncReplication, L::None, "RBD mirroring is asynchronous only"),
    (C::MetroReplication, L::None, ""),
    (C::EventualReplication, L::Partial, "snapshot mirroring on a schedule"),
    (C::Promotion, L::Full, "image promotion"),
    (C::Demotion, L::Full, "image demotion"),
    (C::Resync, L::Full, "image resync after split brain"),
    (C::Failover, L::Full, ""),
    (C::Failback, L::Full, ""),
    (C::ConsistencyGroups, L::Partial, "via VolumeGroupReplication"),
    (C::VolumeGroups, L::Partial, "via VolumeGroupReplication"),
    (C::Snapshots, L::Full, ""),
    (C::SnapshotSchedules, L::Full, "mirror snapshot schedules"),
    (C::ScheduledReplication, L::Full, ""),
    (C::BandwidthLimiting, L::None, ""),
    (C::Compression, L::None, ""),
    (C::Encryption, L::Partial, "requires encrypted pools on both sites"),
    (C::Deduplication, L::None, ""),
    (C::MultiSite, L::Partial, "one-to-many peers per pool"),
    (C::CrossCluster, L::Full, ""),
    (C::AutoResync, L::Basic, "auto-resync flag on VolumeReplication"),
    (C::PointInTimeRecovery, L::Basic, "restore from mirror snapshots"),
    (C::PauseResume, L::None, ""),
    (C::HealthMonitoring, L::Full, "mirror image status"),
    (C::MetricsReporting, L::Full, "ceph-mgr exporter"),
];

const TRIDENT_CAPABILITIES: &[CapabilityEntry] = &[
    (C::AsyncReplication, L::Full, "SnapMirror asynchronous policies"),
    (C::SyncReplication, L::Full, "SnapMirror synchronous policies"),
    (C::MetroReplication, L::Partial, "SnapMirror active sync"),
    (C::EventualReplication, L::None, ""),
    (C::Promotion, L::Full, "mirror relationship promotion"),
    (C::Demotion, L::Full, "re-establish as destination"),
    (C::Resync, L::Full, "SnapMirror resync"),
    (C::Failover, L::Full, ""),
    (C::Failback, L::Partial, "requires manual reverse resync"),
    (C::ConsistencyGroups, L::Partial, ""),
    (C::VolumeGroups, L::Basic, ""),
    (C::Snapshots, L::Full, ""),
    (C::SnapshotSchedules, L::Full, "ONTAP snapshot policies"),
    (C::ScheduledReplication, L::Full, "SnapMirror schedules"),
    (C::BandwidthLimiting, L::Partial, "SnapMirror throttle"),
    (C::Compression, L::Full, "network compression"),
    (C::Encryption, L::Full, "TLS peering and NVE"),
    (C::Deduplication, L::Full, ""),
    (C::MultiSite, L::Basic, "cascade topologies"),
    (C::CrossCluster, L::Full, ""),
    (C::AutoResync, L::Partial, ""),
    (C::PointInTimeRecovery, L::Partial, "snapshot restore"),
    (C::PauseResume, L::Full, "quiesce and resume"),
    (C::HealthMonitoring, L::Full, "mirror state reporting"),
    (C::MetricsReporting, L::Partial, ""),
];

const POWERSTORE_CAPABILITIES: &[CapabilityEntry] = &[
    (C::AsyncReplication, L::Full, "asynchronous replication sessions"),
    (C::SyncReplication, L::Full, "synchronous replication sessions"),
    (C::MetroReplication, L::Full, "metro volumes"),
    (C::EventualReplication, L::None, ""),
    (C::Promotion, L::Full, "planned failover"),
    (C::Demotion, L::Full, "reprotect"),
    (C::Resync, L::Full, ""),
    (C::Failover, L::Full, "planned and unplanned failover"),
    (C::Failback, L::Full, ""),
    (C::ConsistencyGroups, L::Full, "replication groups"),
    (C::VolumeGroups, L::Full, ""),
    (C::Snapshots, L::Full, ""),
    (C::SnapshotSchedules, L::Partial, "protection policy rules"),
    (C::ScheduledReplication, L::Full, "RPO-driven replication rules"),
    (C::BandwidthLimiting, L::Basic, ""),
    (C::Compression, L::Full, ""),
    (C::Encryption, L::Full, "data at rest encryption"),
    (C::Deduplication, L::Full, ""),
    (C::MultiSite, L::Partial, ""),
    (C::CrossCluster, L::Full, ""),
    (C::AutoResync, L::Full, ""),
    (C::PointInTimeRecovery, L::Basic, ""),
    (C::PauseResume, L::Full, "pause and resume sessions"),
    (C::HealthMonitoring, L::Full, ""),
    (C::MetricsReporting, L::Full, ""),
];

fn capability_table(backend: Backend) -> &'static [CapabilityEntry] {
    match backend {
        Backend::Ceph => CEPH_CAPABILITIES,
        Backend::Trident => TRIDENT_CAPABILITIES,
        Backend::PowerStore => POWERSTORE_CAPABILITIES,
    }
}

/// Static performance profile: (min RPO s, typical RTO s, max volumes per group, throughput MB/s)
fn performance_profile(backend: Backend) -> (u64, u64, Option<u32>, Option<u64>) {
    match backend {
        Backend::Ceph => (60, 120, Some(100), None),
        Backend::Trident => (0, 60, Some(64), Some(1_000)),
        Backend::PowerStore => (0, 30, Some(75), Some(2_000)),
    }
}

// =============================================================================
// Capability Detector
// =============================================================================

/// Capability detector for a single backend
pub struct CapabilityDetector {
    backend: Backend,
    store: ResourceStoreRef,
    requirements: &'static [SchemaRequirement],
    check_timeout: Duration,
}

impl CapabilityDetector {
    pub fn new(backend: Backend, store: ResourceStoreRef) -> Self {
        Self {
            backend,
            store,
            requirements: schema_requirements(backend),
            check_timeout: Duration::from_secs(10),
        }
    }

    /// Bound every store lookup by `timeout`
    pub fn with_check_timeout(mut self, timeout: Duration) -> Self {
        self.check_timeout = timeout;
        self
    }

    pub fn backend(&self) -> Backend {
        self.backend
    }

    /// Run a store lookup under the check timeout, aborting on cancellation
    async fn guarded<T>(
        &self,
        cancel: &CancellationToken,
        schema: &str,
        lookup: impl Future<Output = Result<T>>,
    ) -> Result<T> {
        tokio::select! {
            biased;
            _ = cancel.cancelled() => Err(Error::Cancelled {
                operation: format!("capability check for {}", self.backend),
            }),
            res = tokio::time::timeout(self.check_timeout, lookup) => match res {
                Ok(inner) => inner.map_err(|e| e.with_discovery_context(self.backend.as_str(), schema)),
                Err(_) => Err(Error::DiscoveryTimeout {
                    backend: self.backend.to_string(),
                    schema: schema.to_string(),
                    timeout: self.check_timeout,
                }),
            },
        }
    }

    /// Static capability map with a live health check
    #[instrument(skip(self, cancel), fields(backend = %self.backend))]
    pub async fn detect_capabilities(&self, cancel: &CancellationToken) -> Result<BackendCapabilities> {
        let health = self.check_health(cancel).await?;
        let version = self.get_version_info(cancel).await.ok();

        let mut caps = BackendCapabilities::new(self.backend).with_health(health);
        for (capability, level, description) in capability_table(self.backend) {
            caps.capabilities.insert(
                *capability,
                CapabilityInfo::new(*capability, *level, *description),
            );
        }
        caps.version = version;

        debug!(
            capabilities = caps.capabilities.len(),
            health = %caps.health.level,
            "Detected capabilities"
        );
        Ok(caps)
    }

    /// One sub-check per declared schema
    ///
    /// Lookup failures mark that check unhealthy; only cancellation aborts.
    pub async fn check_health(&self, cancel: &CancellationToken) -> Result<HealthStatus> {
        let mut checks = Vec::with_capacity(self.requirements.len());

        for req in self.requirements {
            let started = Instant::now();
            let outcome = self
                .guarded(cancel, req.name, self.store.schema_established(req.name))
                .await;

            let (level, message) = match outcome {
                Ok(true) => (HealthLevel::Healthy, "established".to_string()),
                Ok(false) => (HealthLevel::Unhealthy, "not established".to_string()),
                Err(e) if e.is_cancelled() => return Err(e),
                Err(e) => (HealthLevel::Unhealthy, e.to_string()),
            };

            checks.push(HealthCheck {
                name: req.name.to_string(),
                level,
                message,
                duration: started.elapsed(),
                required: req.required,
            });
        }

        Ok(HealthStatus::from_checks(checks))
    }

    /// Static performance profile plus a measured lookup latency
    pub async fn get_performance_characteristics(
        &self,
        cancel: &CancellationToken,
    ) -> Result<PerformanceCharacteristics> {
        let (min_rpo_seconds, typical_rto_seconds, max_volumes_per_group, max_throughput_mbps) =
            performance_profile(self.backend);

        let api_latency_ms = match self.requirements.first() {
            Some(primary) => {
                let started = Instant::now();
                self.guarded(cancel, primary.name, self.store.schema_established(primary.name))
                    .await?;
                Some(started.elapsed().as_secs_f64() * 1000.0)
            }
            None => None,
        };

        Ok(PerformanceCharacteristics {
            min_rpo_seconds,
            typical_rto_seconds,
            max_volumes_per_group,
            max_throughput_mbps,
            api_latency_ms,
            sampled_at: Some(Utc::now()),
        })
    }

    /// Versions of the installed schemas
    pub async fn get_version_info(&self, cancel: &CancellationToken) -> Result<VersionInfo> {
        let mut schema_versions = BTreeMap::new();
        let mut api_version = String::new();

        for req in self.requirements {
            match self.guarded(cancel, req.name, self.store.schema_info(req.name)).await {
                Ok(info) => {
                    if api_version.is_empty() {
                        api_version = format!("{}/{}", info.group, info.version);
                    }
                    schema_versions.insert(info.name, info.version);
                }
                Err(Error::SchemaNotFound { .. }) => continue,
                Err(e) => return Err(e),
            }
        }

        if schema_versions.is_empty() {
            return Err(Error::SchemaNotFound {
                backend: self.backend.to_string(),
                schema: self
                    .requirements
                    .first()
                    .map(|r| r.name.to_string())
                    .unwrap_or_default(),
            });
        }

        Ok(VersionInfo {
            api_version,
            schema_versions,
            detected_at: Some(Utc::now()),
        })
    }

    /// Check a single capability against current health
    ///
    /// A supported capability on an unhealthy backend is reported `Unknown`.
    pub async fn validate_capability(
        &self,
        cancel: &CancellationToken,
        capability: Capability,
    ) -> Result<CapabilityInfo> {
        let (level, description) = capability_table(self.backend)
            .iter()
            .find(|(c, _, _)| *c == capability)
            .map(|(_, level, description)| (*level, *description))
            .unwrap_or((CapabilityLevel::None, ""));

        let info = CapabilityInfo::new(capability, level, description);
        if !level.is_supported() {
            return Ok(info);
        }

        let health = self.check_health(cancel).await?;
        if health.level == HealthLevel::Unhealthy {
            let mut info = info.with_limitation(format!("backend unhealthy: {}", health.message));
            info.level = CapabilityLevel::Unknown;
            return Ok(info);
        }

        Ok(info)
    }
}

impl std::fmt::Debug for CapabilityDetector {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("CapabilityDetector")
            .field("backend", &self.backend)
            .field("check_timeout", &self.check_timeout)
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::store::MemoryResourceStore;
    use assert_matches::assert_matches;
    use std::sync::Arc;

    #[test]
    fn test_tables_cover_every_capability() {
        for backend in Backend::ALL {
            let table = capability_table(backend);
            for capability in Capability::ALL {
                assert!(
                    table.iter().any(|(c, _, _)| *c == capability),
                    "{} missing {}",
                    backend,
                    capability
                );
            }
        }
    }

    #[tokio::test]
    async fn test_detect_capabilities() {
        let store = Arc::new(MemoryResourceStore::new());
        store.install_backend(Backend::Trident);

        let detector = CapabilityDetector::new(Backend::Trident, store);
        let caps = detector
            .detect_capabilities(&CancellationToken::new())
            .await
            .unwrap();

        assert_eq!(caps.capabilities.len(), 25);
        assert_eq!(caps.level(Capability::SyncReplication), Some(CapabilityLevel::Full));
        assert_eq!(caps.health.level, HealthLevel::Healthy);
        assert_eq!(caps.version.unwrap().api_version, "trident.netapp.io/v1");
    }

    #[tokio::test]
    async fn test_health_degraded_when_one_schema_missing() {
        let store = Arc::new(MemoryResourceStore::new());
        store.add_schema_for(
            Backend::Ceph,
            "volumereplications.replication.storage.openshift.io",
            true,
        );

        let detector = CapabilityDetector::new(Backend::Ceph, store);
        let health = detector.check_health(&CancellationToken::new()).await.unwrap();

        assert_eq!(health.level, HealthLevel::Degraded);
        assert_eq!(health.checks.len(), 3);
    }

    #[tokio::test]
    async fn test_health_unhealthy_on_denied_lookup() {
        let store = Arc::new(MemoryResourceStore::new());
        store.deny_schema("dellcsireplicationgroups.replication.storage.dell.com");

        let detector = CapabilityDetector::new(Backend::PowerStore, store);
        let health = detector.check_health(&CancellationToken::new()).await.unwrap();
        assert_eq!(health.level, HealthLevel::Unhealthy);
    }

    #[tokio::test]
    async fn test_check_health_cancelled() {
        let store = Arc::new(MemoryResourceStore::new());
        store.set_latency(Duration::from_secs(5));
        let detector = CapabilityDetector::new(Backend::Ceph, store);

        let cancel = CancellationToken::new();
        cancel.cancel();
        let err = detector.check_health(&cancel).await.unwrap_err();
        assert_matches!(err, Error::Cancelled { .. });
    }

    #[tokio::test]
    async fn test_validate_capability() {
        let store = Arc::new(MemoryResourceStore::new());
        let detector = CapabilityDetector::new(Backend::Ceph, store.clone());
        let cancel = CancellationToken::new();

        let info = detector
            .validate_capability(&cancel, Capability::SyncReplication)
            .await
            .unwrap();
        assert_eq!(info.level, CapabilityLevel::None);

        let info = detector
            .validate_capability(&cancel, Capability::AsyncReplication)
            .await
            .unwrap();
        assert_eq!(info.level, CapabilityLevel::Unknown);

        store.install_backend(Backend::Ceph);
        let info = detector
            .validate_capability(&cancel, Capability::AsyncReplication)
            .await
            .unwrap();
        assert_eq!(info.level, CapabilityLevel::Full);
    }

    #[tokio::test]
    async fn test_performance_characteristics() {
        let store = Arc::new(MemoryResourceStore::new());
        store.install_backend(Backend::PowerStore);

        let detector = CapabilityDetector::new(Backend::PowerStore, store);
        let perf = detector
            .get_performance_characteristics(&CancellationToken::new())
            .await
            .unwrap();
        assert_eq!(perf.min_rpo_seconds, 0);
        assert!(perf.api_latency_ms.is_some());
    }
}
