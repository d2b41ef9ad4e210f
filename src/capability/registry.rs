//! Capability Registry
//!
//! Owns one [`BackendCapabilities`] entry per backend and answers
//! capability queries. Entries keep registration order so that ranking
//! ties resolve in discovery order.

use crate::capability::detector::CapabilityDetector;
use crate::capability::types::{
    BackendCapabilities, BackendScore, Capability, CapabilityLevel, CapabilityQuery, HealthLevel,
    HealthStatus, PerformanceCharacteristics, RegistryStatistics,
};
use crate::crd::{ReplicationMode, ReplicationState, ScheduleMode, UnifiedVolumeReplicationSpec};
use crate::domain::ports::Backend;
use crate::error::{Error, Result};
use indexmap::IndexMap;
use parking_lot::RwLock;
use std::collections::HashMap;
use std::sync::Arc;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info};

/// Shared registry handle
pub type CapabilityRegistryRef = Arc<CapabilityRegistry>;

/// Weight of optional-capability coverage in the final score
const OPTIONAL_BONUS: f64 = 0.3;

// =============================================================================
// Spec Mapping
// =============================================================================

/// Capabilities a replication spec needs, each paired with the field requiring it
pub fn required_capabilities_for(spec: &UnifiedVolumeReplicationSpec) -> Vec<(Capability, &'static str)> {
    let mut required = Vec::new();

    required.push(match spec.replication_mode {
        ReplicationMode::Synchronous => (Capability::SyncReplication, "replicationMode"),
        ReplicationMode::Asynchronous => (Capability::AsyncReplication, "replicationMode"),
        ReplicationMode::Eventual => (Capability::EventualReplication, "replicationMode"),
    });

    match spec.replication_state {
        ReplicationState::Promoting => required.push((Capability::Promotion, "replicationState")),
        ReplicationState::Demoting => required.push((Capability::Demotion, "replicationState")),
        ReplicationState::Syncing => required.push((Capability::Resync, "replicationState")),
        _ => {}
    }

    if spec.schedule.mode == ScheduleMode::Interval {
        required.push((Capability::ScheduledReplication, "schedule.mode"));
    }

    if let Some(ext) = &spec.extensions {
        if ext
            .ceph
            .as_ref()
            .map(|c| c.scheduling_start_time.is_some())
            .unwrap_or(false)
        {
            required.push((
                Capability::SnapshotSchedules,
                "extensions.ceph.schedulingStartTime",
            ));
        }
        if ext
            .trident
            .as_ref()
            .map(|t| !t.actions.is_empty())
            .unwrap_or(false)
        {
            required.push((Capability::Resync, "extensions.trident.actions"));
        }
        if let Some(powerstore) = &ext.powerstore {
            if !powerstore.volume_groups.is_empty() {
                required.push((
                    Capability::ConsistencyGroups,
                    "extensions.powerstore.volumeGroups",
                ));
            }
            if powerstore.rpo_settings.is_some() {
                required.push((
                    Capability::ScheduledReplication,
                    "extensions.powerstore.rpoSettings",
                ));
            }
        }
    }

    required
}

/// Query selecting backends able to serve a spec, preferring a pinned backend
pub fn query_for_spec(spec: &UnifiedVolumeReplicationSpec) -> CapabilityQuery {
    let mut required: Vec<Capability> = Vec::new();
    for (capability, _) in required_capabilities_for(spec) {
        if !required.contains(&capability) {
            required.push(capability);
        }
    }

    CapabilityQuery::new(required)
        .with_optional([Capability::HealthMonitoring, Capability::AutoResync])
        .prefer(spec.extensions.as_ref().and_then(|e| e.pinned_backend()))
}

// =============================================================================
// Scoring
// =============================================================================

/// Score one backend against a query; 0.0 means ineligible
pub fn score_backend(caps: &BackendCapabilities, query: &CapabilityQuery) -> f64 {
    if query.require_healthy && caps.health.level != HealthLevel::Healthy {
        return 0.0;
    }

    let mut required_score = 1.0;
    if !query.required.is_empty() {
        let mut total = 0.0;
        for capability in &query.required {
            match caps.level(*capability) {
                None | Some(CapabilityLevel::None) => return 0.0,
                Some(level) if level < query.min_level => return 0.0,
                Some(level) => total += level.weight(),
            }
        }
        required_score = total / query.required.len() as f64;
    }

    let bonus = if query.optional.is_empty() {
        0.0
    } else {
        let coverage: f64 = query
            .optional
            .iter()
            .map(|c| caps.level(*c).map(|l| l.weight()).unwrap_or(0.0))
            .sum();
        OPTIONAL_BONUS * coverage / query.optional.len() as f64
    };

    required_score + bonus
}

/// Rank eligible backends, best first; ties keep input order
pub fn rank_backends<'a>(
    entries: impl IntoIterator<Item = &'a BackendCapabilities>,
    query: &CapabilityQuery,
) -> Vec<BackendScore> {
    let mut scores: Vec<BackendScore> = entries
        .into_iter()
        .filter_map(|caps| {
            let score = score_backend(caps, query);
            (score > 0.0).then(|| BackendScore {
                backend: caps.backend,
                score,
                health: caps.health.level,
                matched_optional: query
                    .optional
                    .iter()
                    .copied()
                    .filter(|c| caps.level(*c).map(|l| l.weight() > 0.0).unwrap_or(false))
                    .collect(),
            })
        })
        .collect();

    // Stable sort keeps registration order among equal scores
    scores.sort_by(|a, b| b.score.total_cmp(&a.score));
    scores
}

/// Pick the preferred backend when eligible, otherwise the top-ranked one
pub fn choose_backend(ranking: &[BackendScore], query: &CapabilityQuery) -> Result<Backend> {
    if let Some(preferred) = query.preferred {
        if ranking.iter().any(|s| s.backend == preferred) {
            return Ok(preferred);
        }
    }

    ranking
        .first()
        .map(|s| s.backend)
        .ok_or_else(|| Error::NoSuitableBackend {
            reason: if query.required.is_empty() {
                "no eligible backends registered".to_string()
            } else {
                format!(
                    "no backend supports {}",
                    query
                        .required
                        .iter()
                        .map(|c| c.as_str())
                        .collect::<Vec<_>>()
                        .join(", ")
                )
            },
        })
}

// =============================================================================
// Capability Registry
// =============================================================================

/// Registry of backend capabilities
#[derive(Default)]
pub struct CapabilityRegistry {
    entries: RwLock<IndexMap<Backend, BackendCapabilities>>,
    detectors: RwLock<HashMap<Backend, Arc<CapabilityDetector>>>,
}

impl CapabilityRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register (or replace) a backend's capabilities
    pub fn register_capabilities(&self, caps: BackendCapabilities) {
        info!(
            backend = %caps.backend,
            capabilities = caps.capabilities.len(),
            "Registered backend capabilities"
        );
        self.entries.write().insert(caps.backend, caps);
    }

    /// Register the detector used by refreshes and health checks
    pub fn register_detector(&self, detector: Arc<CapabilityDetector>) {
        self.detectors.write().insert(detector.backend(), detector);
    }

    pub fn detector(&self, backend: Backend) -> Option<Arc<CapabilityDetector>> {
        self.detectors.read().get(&backend).cloned()
    }

    /// Remove a backend and its detector
    pub fn unregister(&self, backend: Backend) -> Option<BackendCapabilities> {
        self.detectors.write().remove(&backend);
        let removed = self.entries.write().shift_remove(&backend);
        if removed.is_some() {
            info!(backend = %backend, "Unregistered backend");
        }
        removed
    }

    pub fn get_capabilities(&self, backend: Backend) -> Option<BackendCapabilities> {
        self.entries.read().get(&backend).cloned()
    }

    /// All entries in registration order
    pub fn get_all_capabilities(&self) -> Vec<BackendCapabilities> {
        self.entries.read().values().cloned().collect()
    }

    pub fn registered_backends(&self) -> Vec<Backend> {
        self.entries.read().keys().copied().collect()
    }

    /// Merge an update, registering the backend if it is new
    pub fn update_capabilities(&self, update: BackendCapabilities) {
        let mut entries = self.entries.write();
        match entries.get_mut(&update.backend) {
            Some(existing) => {
                debug!(backend = %update.backend, "Merging capability update");
                existing.merge(update);
            }
            None => {
                entries.insert(update.backend, update);
            }
        }
    }

    /// Re-run the registered detector and merge its result
    pub async fn refresh_capabilities(
        &self,
        cancel: &CancellationToken,
        backend: Backend,
    ) -> Result<BackendCapabilities> {
        let detector = self.detector(backend).ok_or_else(|| Error::BackendNotRegistered {
            backend: backend.to_string(),
        })?;

        let detected = detector.detect_capabilities(cancel).await?;
        self.update_capabilities(detected);

        self.get_capabilities(backend)
            .ok_or_else(|| Error::BackendNotRegistered {
                backend: backend.to_string(),
            })
    }

    /// Replace a registered backend's health; never creates an entry
    pub fn update_health(&self, backend: Backend, health: HealthStatus) -> Result<()> {
        let mut entries = self.entries.write();
        let entry = entries
            .get_mut(&backend)
            .ok_or_else(|| Error::BackendNotRegistered {
                backend: backend.to_string(),
            })?;

        if entry.health.level != health.level {
            info!(
                backend = %backend,
                from = %entry.health.level,
                to = %health.level,
                "Backend health changed"
            );
        }
        entry.health = health;
        Ok(())
    }

    pub fn update_performance(
        &self,
        backend: Backend,
        performance: PerformanceCharacteristics,
    ) -> Result<()> {
        let mut entries = self.entries.write();
        let entry = entries
            .get_mut(&backend)
            .ok_or_else(|| Error::BackendNotRegistered {
                backend: backend.to_string(),
            })?;
        entry.performance = Some(performance);
        Ok(())
    }

    /// Level recorded for a capability; `None` when the backend or entry is unknown
    pub fn is_capability_supported(
        &self,
        backend: Backend,
        capability: Capability,
    ) -> Option<CapabilityLevel> {
        self.entries
            .read()
            .get(&backend)
            .and_then(|caps| caps.level(capability))
    }

    /// Backends whose level for `capability` is at least `min_level`
    pub fn get_supported_backends(
        &self,
        capability: Capability,
        min_level: CapabilityLevel,
    ) -> Vec<Backend> {
        self.entries
            .read()
            .values()
            .filter(|caps| {
                caps.level(capability)
                    .map(|level| level >= min_level)
                    .unwrap_or(false)
            })
            .map(|caps| caps.backend)
            .collect()
    }

    /// Fail when a spec needs a capability the backend lacks
    pub fn validate_configuration(
        &self,
        backend: Backend,
        spec: &UnifiedVolumeReplicationSpec,
    ) -> Result<()> {
        let entries = self.entries.read();
        let caps = entries.get(&backend).ok_or_else(|| Error::BackendNotRegistered {
            backend: backend.to_string(),
        })?;

        for (capability, field) in required_capabilities_for(spec) {
            let supported = caps
                .level(capability)
                .map(|level| level.is_supported())
                .unwrap_or(false);
            if !supported {
                return Err(Error::CapabilityNotSupported {
                    backend: backend.to_string(),
                    capability: capability.to_string(),
                    field: field.to_string(),
                });
            }
        }

        Ok(())
    }

    /// Eligible backends ranked by fit
    pub fn query_backends_by_capabilities(&self, query: &CapabilityQuery) -> Vec<BackendScore> {
        let entries = self.entries.read();
        rank_backends(entries.values(), query)
    }

    /// Best backend for a query
    pub fn select_backend(&self, query: &CapabilityQuery) -> Result<Backend> {
        let ranking = self.query_backends_by_capabilities(query);
        choose_backend(&ranking, query)
    }

    pub fn get_statistics(&self) -> RegistryStatistics {
        let entries = self.entries.read();
        let mut stats = RegistryStatistics {
            total_backends: entries.len(),
            ..Default::default()
        };

        for caps in entries.values() {
            match caps.health.level {
                HealthLevel::Healthy => stats.healthy += 1,
                HealthLevel::Degraded => stats.degraded += 1,
                HealthLevel::Unhealthy => stats.unhealthy += 1,
                HealthLevel::Unknown => stats.unknown += 1,
            }
            stats.total_capabilities += caps.capabilities.len();
        }

        stats
    }
}
