//! Enhanced Discovery
//!
//! Runs backend discovery, then detects capabilities for every available
//! backend and records them in the capability registry. The auto-refresh
//! loop repeats the whole pass so backends installed later get registered.

use crate::capability::detector::CapabilityDetector;
use crate::capability::registry::{choose_backend, rank_backends, CapabilityRegistryRef};
use crate::capability::types::{BackendCapabilities, BackendScore, CapabilityQuery, HealthLevel, HealthStatus};
use crate::discovery::{DiscoveryEngine, DiscoveryResult};
use crate::domain::ports::{Backend, ResourceStoreRef};
use crate::error::{Error, Result};
use chrono::{DateTime, Utc};
use indexmap::IndexMap;
use parking_lot::Mutex;
use serde::Serialize;
use std::collections::BTreeMap;
use std::sync::{Arc, Weak};
use std::time::Duration;
use tokio::sync::Semaphore;
use tokio::task::{JoinHandle, JoinSet};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

/// Enhanced discovery configuration
#[derive(Debug, Clone)]
pub struct EnhancedDiscoveryConfig {
    /// Concurrent capability detections
    pub max_concurrent_checks: usize,
    /// Timeout for each store lookup made by capability detection
    pub check_timeout: Duration,
    /// Mark registered backends that disappear from discovery unhealthy
    pub mark_missing_unhealthy: bool,
}

impl Default for EnhancedDiscoveryConfig {
    fn default() -> Self {
        Self {
            max_concurrent_checks: 5,
            check_timeout: Duration::from_secs(10),
            mark_missing_unhealthy: true,
        }
    }
}

/// Discovery plus capabilities of every available backend
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct EnhancedDiscoveryResult {
    pub discovery: DiscoveryResult,
    /// Capabilities in discovery order
    pub capabilities: IndexMap<Backend, BackendCapabilities>,
    /// Capability detection failures per backend
    pub errors: BTreeMap<Backend, String>,
    pub timestamp: DateTime<Utc>,
}

impl EnhancedDiscoveryResult {
    /// Full ranking of available backends for a query
    pub fn recommend_backends(&self, query: &CapabilityQuery) -> Vec<BackendScore> {
        rank_backends(self.capabilities.values(), query)
    }

    /// Top-ranked (or preferred) backend for a query
    pub fn select_backend(&self, query: &CapabilityQuery) -> Result<Backend> {
        choose_backend(&self.recommend_backends(query), query)
    }

    /// Backends that are available and healthy
    pub fn healthy_backends(&self) -> Vec<Backend> {
        self.capabilities
            .values()
            .filter(|c| c.health.level == HealthLevel::Healthy)
            .map(|c| c.backend)
            .collect()
    }
}

struct RefreshTask {
    token: CancellationToken,
    handle: JoinHandle<()>,
}

/// Discovery engine that also maintains the capability registry
pub struct EnhancedDiscoveryEngine {
    config: EnhancedDiscoveryConfig,
    discovery: Arc<DiscoveryEngine>,
    registry: CapabilityRegistryRef,
    store: ResourceStoreRef,
    semaphore: Arc<Semaphore>,
    refresh: Mutex<Option<RefreshTask>>,
}

impl EnhancedDiscoveryEngine {
    pub fn new(
        config: EnhancedDiscoveryConfig,
        discovery: Arc<DiscoveryEngine>,
        registry: CapabilityRegistryRef,
        store: ResourceStoreRef,
    ) -> Self {
        let permits = config.max_concurrent_checks.max(1);
        Self {
            config,
            discovery,
            registry,
            store,
            semaphore: Arc::new(Semaphore::new(permits)),
            refresh: Mutex::new(None),
        }
    }

    pub fn discovery(&self) -> &Arc<DiscoveryEngine> {
        &self.discovery
    }

    pub fn registry(&self) -> &CapabilityRegistryRef {
        &self.registry
    }

    fn detector_for(&self, backend: Backend) -> Arc<CapabilityDetector> {
        if let Some(detector) = self.registry.detector(backend) {
            return detector;
        }
        let detector = Arc::new(
            CapabilityDetector::new(backend, self.store.clone())
                .with_check_timeout(self.config.check_timeout),
        );
        self.registry.register_detector(detector.clone());
        detector
    }

    /// Discover backends and detect capabilities of the available ones
    ///
    /// A capability failure for one backend is recorded in the result and
    /// does not affect the others.
    pub async fn discover_with_capabilities(
        &self,
        cancel: &CancellationToken,
    ) -> Result<EnhancedDiscoveryResult> {
        let discovery = self.discovery.discover_backends(cancel).await?;

        let detectors: Vec<Arc<CapabilityDetector>> = discovery
            .available
            .iter()
            .map(|backend| self.detector_for(*backend))
            .collect();

        let mut tasks = JoinSet::new();
        for detector in detectors {
            let semaphore = self.semaphore.clone();
            let cancel = cancel.clone();
            tasks.spawn(async move {
                let backend = detector.backend();
                let Ok(_permit) = semaphore.acquire_owned().await else {
                    return (backend, Err(Error::Internal("check limiter closed".into())));
                };
                (backend, detector.detect_capabilities(&cancel).await)
            });
        }

        let mut detected: Vec<(Backend, Result<BackendCapabilities>)> = Vec::new();
        while let Some(joined) = tasks.join_next().await {
            match joined {
                Ok(outcome) => detected.push(outcome),
                Err(e) => warn!(error = %e, "Capability detection task failed"),
            }
        }

        if cancel.is_cancelled() {
            return Err(Error::Cancelled {
                operation: "capability discovery".into(),
            });
        }

        let mut by_backend: BTreeMap<Backend, Result<BackendCapabilities>> =
            detected.into_iter().collect();
        let mut capabilities = IndexMap::new();
        let mut errors = BTreeMap::new();

        // Register in discovery order so ranking ties follow it
        for backend in &discovery.available {
            match by_backend.remove(backend) {
                Some(Ok(caps)) => {
                    self.registry.update_capabilities(caps);
                    if let Some(merged) = self.registry.get_capabilities(*backend) {
                        capabilities.insert(*backend, merged);
                    }
                }
                Some(Err(e)) => {
                    warn!(backend = %backend, error = %e, "Capability detection failed");
                    errors.insert(*backend, e.to_string());
                }
                None => {}
            }
        }

        if self.config.mark_missing_unhealthy {
            for backend in self.registry.registered_backends() {
                if !discovery.is_available(backend) {
                    let health = HealthStatus::with_level(
                        HealthLevel::Unhealthy,
                        format!("backend {} is {}", backend, discovery.status_of(backend)),
                    );
                    if let Err(e) = self.registry.update_health(backend, health) {
                        debug!(backend = %backend, error = %e, "Backend unregistered before health update");
                    }
                }
            }
        }

        info!(
            available = discovery.available.len(),
            with_capabilities = capabilities.len(),
            failed = errors.len(),
            "Enhanced discovery complete"
        );

        Ok(EnhancedDiscoveryResult {
            discovery,
            capabilities,
            errors,
            timestamp: Utc::now(),
        })
    }

    /// Ready once a cached discovery lists an available backend whose
    /// registered health is `Healthy`
    ///
    /// Never starts a discovery pass; an expired cache reports not ready.
    pub fn is_ready(&self) -> bool {
        let Some(cached) = self.discovery.get_cached_result() else {
            return false;
        };
        cached.available.iter().any(|backend| {
            self.registry
                .get_capabilities(*backend)
                .map(|caps| caps.health.level == HealthLevel::Healthy)
                .unwrap_or(false)
        })
    }

    // =========================================================================
    // Auto Refresh
    // =========================================================================

    /// Re-run [`Self::discover_with_capabilities`] every discovery
    /// `refresh_interval` until stopped or `cancel` fires
    pub fn start_auto_refresh(self: &Arc<Self>, cancel: &CancellationToken) -> Result<()> {
        let mut refresh = self.refresh.lock();
        if let Some(task) = refresh.as_ref() {
            if !task.handle.is_finished() {
                return Err(Error::AlreadyRunning {
                    component: "capability auto-refresh".into(),
                });
            }
        }

        let token = cancel.child_token();
        let interval = self.discovery.config().refresh_interval;
        let engine: Weak<Self> = Arc::downgrade(self);
        let loop_token = token.clone();

        let handle = tokio::spawn(async move {
            let mut ticker =
                tokio::time::interval_at(tokio::time::Instant::now() + interval, interval);
            ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);

            loop {
                tokio::select! {
                    _ = loop_token.cancelled() => break,
                    _ = ticker.tick() => {
                        let Some(engine) = engine.upgrade() else { break };
                        if let Err(e) = engine.discover_with_capabilities(&loop_token).await {
                            if e.is_cancelled() {
                                break;
                            }
                            warn!(error = %e, "Capability auto-refresh failed");
                        }
                    }
                }
            }
            debug!("Capability auto-refresh stopped");
        });

        info!(interval_secs = interval.as_secs_f64(), "Capability auto-refresh started");
        *refresh = Some(RefreshTask { token, handle });
        Ok(())
    }

    /// Stop the auto-refresh loop; no-op when not running
    pub fn stop_auto_refresh(&self) {
        if let Some(task) = self.refresh.lock().take() {
            task.token.cancel();
            info!("Capability auto-refresh stopping");
        }
    }

    pub fn is_auto_refresh_running(&self) -> bool {
        self.refresh
            .lock()
            .as_ref()
            .map(|t| !t.handle.is_finished() && !t.token.is_cancelled())
            .unwrap_or(false)
    }

    /// Rank registered backends for a query
    pub fn recommend_backends(&self, query: &CapabilityQuery) -> Vec<BackendScore> {
        self.registry.query_backends_by_capabilities(query)
    }

    /// Best registered backend for a query
    pub fn select_backend(&self, query: &CapabilityQuery) -> Result<Backend> {
        self.registry.select_backend(query)
    }
}

impl Drop for EnhancedDiscoveryEngine {
    fn drop(&mut self) {
        if let Some(task) = self.refresh.get_mut().take() {
            task.token.cancel();
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::capability::registry::CapabilityRegistry;
    use crate::capability::types::{Capability, CapabilityLevel};
    use crate::discovery::DiscoveryConfig;
    use crate::store::MemoryResourceStore;
    use assert_matches::assert_matches;

    fn engine(store: Arc<MemoryResourceStore>) -> EnhancedDiscoveryEngine {
        engine_with_refresh(store, Duration::from_secs(240))
    }

    fn engine_with_refresh(
        store: Arc<MemoryResourceStore>,
        refresh_interval: Duration,
    ) -> EnhancedDiscoveryEngine {
        let config = DiscoveryConfig {
            max_retries: 0,
            retry_delay: Duration::from_millis(1),
            check_controllers: false,
            refresh_interval,
            ..Default::default()
        };
        let discovery = DiscoveryEngine::new(config, store.clone());
        EnhancedDiscoveryEngine::new(
            EnhancedDiscoveryConfig::default(),
            discovery,
            Arc::new(CapabilityRegistry::new()),
            store,
        )
    }

    #[tokio::test]
    async fn test_discover_with_capabilities() {
        let store = Arc::new(MemoryResourceStore::new());
        store.install_backend(Backend::Ceph);
        store.install_backend(Backend::PowerStore);

        let engine = engine(store);
        let result = engine
            .discover_with_capabilities(&CancellationToken::new())
            .await
            .unwrap();

        let order: Vec<Backend> = result.capabilities.keys().copied().collect();
        assert_eq!(order, vec![Backend::Ceph, Backend::PowerStore]);
        assert!(result.errors.is_empty());
        assert_eq!(result.healthy_backends().len(), 2);
        assert_eq!(engine.registry().registered_backends().len(), 2);

        let query = CapabilityQuery::new([Capability::SyncReplication]);
        assert_eq!(result.select_backend(&query).unwrap(), Backend::PowerStore);

        let query = CapabilityQuery::new([Capability::AsyncReplication]);
        let ranking = result.recommend_backends(&query);
        assert_eq!(ranking.len(), 2);
        assert_eq!(ranking[0].backend, Backend::Ceph);
    }

    #[tokio::test]
    async fn test_no_suitable_backend() {
        let store = Arc::new(MemoryResourceStore::new());
        store.install_backend(Backend::Ceph);

        let engine = engine(store);
        let result = engine
            .discover_with_capabilities(&CancellationToken::new())
            .await
            .unwrap();

        let err = result
            .select_backend(&CapabilityQuery::new([Capability::MetroReplication]))
            .unwrap_err();
        assert_matches!(err, Error::NoSuitableBackend { .. });
    }

    #[tokio::test]
    async fn test_vanished_backend_marked_unhealthy() {
        let store = Arc::new(MemoryResourceStore::new());
        store.install_backend(Backend::Trident);

        let engine = engine(store.clone());
        let cancel = CancellationToken::new();
        engine.discover_with_capabilities(&cancel).await.unwrap();

        store.remove_schema("tridentmirrorrelationships.trident.netapp.io");
        store.remove_schema("tridentbackendconfigs.trident.netapp.io");
        let result = engine.discover_with_capabilities(&cancel).await.unwrap();

        assert!(result.capabilities.is_empty());
        let caps = engine.registry().get_capabilities(Backend::Trident).unwrap();
        assert_eq!(caps.health.level, HealthLevel::Unhealthy);
        assert_eq!(
            engine
                .registry()
                .is_capability_supported(Backend::Trident, Capability::SyncReplication),
            Some(CapabilityLevel::Full)
        );
    }

    #[tokio::test]
    async fn test_cancelled_discovery() {
        let store = Arc::new(MemoryResourceStore::new());
        let engine = engine(store);
        let cancel = CancellationToken::new();
        cancel.cancel();

        let err = engine.discover_with_capabilities(&cancel).await.unwrap_err();
        assert!(err.is_cancelled());
    }

    #[tokio::test]
    async fn test_detection_bounded_by_check_limit() {
        let store = Arc::new(MemoryResourceStore::new());
        for backend in Backend::ALL {
            store.install_backend(backend);
        }
        let discovery = DiscoveryEngine::new(
            DiscoveryConfig {
                max_retries: 0,
                check_controllers: false,
                ..Default::default()
            },
            store.clone(),
        );
        let cancel = CancellationToken::new();
        store.set_latency(Duration::from_millis(30));
        let engine = EnhancedDiscoveryEngine::new(
            EnhancedDiscoveryConfig {
                max_concurrent_checks: 1,
                ..Default::default()
            },
            discovery,
            Arc::new(CapabilityRegistry::new()),
            store,
        );

        let started = std::time::Instant::now();
        let result = engine.discover_with_capabilities(&cancel).await.unwrap();
        assert_eq!(result.capabilities.len(), 3);
        // One permit: each backend's lookups wait for the previous backend
        assert!(started.elapsed() >= Duration::from_millis(90));
    }

    #[tokio::test]
    async fn test_backend_installed_after_first_pass_registered() {
        let store = Arc::new(MemoryResourceStore::new());
        let engine = engine(store.clone());
        let cancel = CancellationToken::new();

        let first = engine.discover_with_capabilities(&cancel).await.unwrap();
        assert!(first.capabilities.is_empty());
        assert!(engine.registry().registered_backends().is_empty());

        store.install_backend(Backend::Ceph);
        let second = engine.discover_with_capabilities(&cancel).await.unwrap();

        assert_eq!(second.discovery.available, vec![Backend::Ceph]);
        assert_eq!(engine.registry().registered_backends(), vec![Backend::Ceph]);
        let query = CapabilityQuery::new([Capability::AsyncReplication]);
        assert_eq!(engine.select_backend(&query).unwrap(), Backend::Ceph);
    }

    #[tokio::test]
    async fn test_auto_refresh_registers_new_backends() {
        let store = Arc::new(MemoryResourceStore::new());
        let engine = Arc::new(engine_with_refresh(store.clone(), Duration::from_millis(20)));
        let cancel = CancellationToken::new();

        engine.discover_with_capabilities(&cancel).await.unwrap();
        engine.start_auto_refresh(&cancel).unwrap();
        assert!(engine.is_auto_refresh_running());
        assert_matches!(
            engine.start_auto_refresh(&cancel),
            Err(Error::AlreadyRunning { .. })
        );

        store.install_backend(Backend::Trident);
        tokio::time::sleep(Duration::from_millis(150)).await;

        let caps = engine.registry().get_capabilities(Backend::Trident).unwrap();
        assert_eq!(caps.health.level, HealthLevel::Healthy);
        assert!(engine.is_ready());

        engine.stop_auto_refresh();
        tokio::time::sleep(Duration::from_millis(30)).await;
        assert!(!engine.is_auto_refresh_running());
        engine.stop_auto_refresh();
    }

    #[tokio::test]
    async fn test_readiness_uses_cached_discovery_only() {
        let store = Arc::new(MemoryResourceStore::new());
        store.install_backend(Backend::PowerStore);
        let engine = engine(store.clone());
        assert!(!engine.is_ready());

        engine
            .discover_with_capabilities(&CancellationToken::new())
            .await
            .unwrap();
        assert!(engine.is_ready());

        let lookups = store.schema_lookups("dellcsireplicationgroups.replication.storage.dell.com");
        engine.discovery().invalidate_cache();
        assert!(!engine.is_ready());
        assert_eq!(
            store.schema_lookups("dellcsireplicationgroups.replication.storage.dell.com"),
            lookups
        );
    }
}
