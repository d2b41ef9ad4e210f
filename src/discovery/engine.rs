//! Discovery Engine
//!
//! Runs one detector per backend in parallel, each under its own timeout
//! and bounded retries, and caches the aggregate result with a TTL.

use crate::discovery::detector::BackendDetector;
use crate::discovery::types::{BackendDiscoveryResult, DiscoveryConfig, DiscoveryResult};
use crate::domain::ports::{Backend, ResourceStoreRef};
use crate::error::{DiscoveryErrorKind, Error, Result};
use chrono::Utc;
use parking_lot::{Mutex, RwLock};
use std::collections::BTreeMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Weak};
use std::time::Instant;
use tokio::task::{JoinHandle, JoinSet};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

// =============================================================================
// Cache Entry
// =============================================================================

#[derive(Debug, Clone)]
struct CachedDiscovery {
    result: DiscoveryResult,
    cached_at: Instant,
}

struct RefreshTask {
    token: CancellationToken,
    handle: JoinHandle<()>,
}

// =============================================================================
// Discovery Engine
// =============================================================================

/// Discovers which replication backends are installed in the cluster
pub struct DiscoveryEngine {
    config: DiscoveryConfig,
    detectors: Vec<BackendDetector>,
    /// Last aggregate result
    cache: RwLock<Option<CachedDiscovery>>,
    /// Auto-refresh loop, if running
    refresh: Mutex<Option<RefreshTask>>,
    closed: AtomicBool,
}

impl DiscoveryEngine {
    /// Create an engine with one detector per configured backend
    pub fn new(config: DiscoveryConfig, store: ResourceStoreRef) -> Arc<Self> {
        let detectors = config
            .backends
            .iter()
            .map(|backend| {
                let detector = BackendDetector::new(*backend, store.clone());
                if config.check_controllers {
                    detector
                } else {
                    detector.with_controller(None)
                }
            })
            .collect();

        Self::with_detectors(config, detectors)
    }

    /// Create an engine from explicit detectors
    pub fn with_detectors(config: DiscoveryConfig, detectors: Vec<BackendDetector>) -> Arc<Self> {
        Arc::new(Self {
            config,
            detectors,
            cache: RwLock::new(None),
            refresh: Mutex::new(None),
            closed: AtomicBool::new(false),
        })
    }

    pub fn config(&self) -> &DiscoveryConfig {
        &self.config
    }

    /// Detector for a backend, if the backend is configured
    pub fn detector(&self, backend: Backend) -> Option<&BackendDetector> {
        self.detectors.iter().find(|d| d.backend() == backend)
    }

    /// Detect all configured backends concurrently and replace the cache
    ///
    /// A failing backend is reported with status `Unknown` and counted in the
    /// aggregate error; it never aborts discovery of the others. The cache is
    /// only written once every detector has finished.
    pub async fn discover_backends(&self, cancel: &CancellationToken) -> Result<DiscoveryResult> {
        if cancel.is_cancelled() {
            return Err(cancelled("backend discovery"));
        }

        let started = Instant::now();
        let mut tasks = JoinSet::new();
        for detector in self.detectors.iter().cloned() {
            let config = self.config.clone();
            let token = cancel.child_token();
            tasks.spawn(async move {
                let backend = detector.backend();
                let outcome = detect_with_retry(&detector, &config, &token).await;
                (backend, outcome)
            });
        }

        let mut backends = BTreeMap::new();
        let mut failures = Vec::new();

        loop {
            let joined = tokio::select! {
                biased;
                _ = cancel.cancelled() => {
                    tasks.abort_all();
                    return Err(cancelled("backend discovery"));
                }
                joined = tasks.join_next() => joined,
            };

            match joined {
                None => break,
                Some(Ok((backend, Ok(result)))) => {
                    debug!(backend = %backend, status = %result.status, "Backend detected");
                    backends.insert(backend, result);
                }
                Some(Ok((_, Err(e)))) if e.is_cancelled() => {
                    tasks.abort_all();
                    return Err(e);
                }
                Some(Ok((backend, Err(e)))) => {
                    warn!(backend = %backend, error = %e, "Backend discovery failed");
                    failures.push(format!("{}: {}", backend, e));
                    backends.insert(backend, BackendDiscoveryResult::unknown(backend, e.to_string()));
                }
                Some(Err(join_err)) => {
                    warn!(error = %join_err, "Discovery task aborted");
                    failures.push(format!("task: {}", join_err));
                }
            }
        }

        let available: Vec<Backend> = self
            .detectors
            .iter()
            .map(|d| d.backend())
            .filter(|b| backends.get(b).map(|r| r.is_available()).unwrap_or(false))
            .collect();

        let error = if failures.is_empty() {
            None
        } else {
            Some(format!(
                "{} backend(s) failed discovery: {}",
                failures.len(),
                failures.join("; ")
            ))
        };

        let result = DiscoveryResult {
            backends,
            available,
            timestamp: Utc::now(),
            error,
        };

        *self.cache.write() = Some(CachedDiscovery {
            result: result.clone(),
            cached_at: Instant::now(),
        });

        info!(
            available = ?result.available,
            failed = failures.len(),
            elapsed_ms = started.elapsed().as_millis() as u64,
            "Backend discovery complete"
        );

        Ok(result)
    }

    /// Detect a single backend without touching the cache
    pub async fn discover_backend(
        &self,
        cancel: &CancellationToken,
        backend: Backend,
    ) -> Result<BackendDiscoveryResult> {
        let detector = self.detector(backend).ok_or_else(|| Error::BackendNotRegistered {
            backend: backend.to_string(),
        })?;
        detect_with_retry(detector, &self.config, cancel).await
    }

    /// Cached result, if one exists and is younger than the TTL
    pub fn get_cached_result(&self) -> Option<DiscoveryResult> {
        let cache = self.cache.read();
        cache
            .as_ref()
            .filter(|c| c.cached_at.elapsed() < self.config.cache_ttl)
            .map(|c| c.result.clone())
    }

    /// Re-run discovery and replace the cache
    pub async fn refresh_cache(&self, cancel: &CancellationToken) -> Result<DiscoveryResult> {
        self.discover_backends(cancel).await
    }

    /// Drop the cached result
    pub fn invalidate_cache(&self) {
        *self.cache.write() = None;
    }

    /// Cached result if still valid, otherwise a fresh discovery
    pub async fn current_result(&self, cancel: &CancellationToken) -> Result<DiscoveryResult> {
        match self.get_cached_result() {
            Some(result) => Ok(result),
            None => self.discover_backends(cancel).await,
        }
    }

    pub async fn is_backend_available(
        &self,
        cancel: &CancellationToken,
        backend: Backend,
    ) -> Result<bool> {
        Ok(self.current_result(cancel).await?.is_available(backend))
    }

    pub async fn get_available_backends(&self, cancel: &CancellationToken) -> Result<Vec<Backend>> {
        Ok(self.current_result(cancel).await?.available)
    }

    // =========================================================================
    // Auto Refresh
    // =========================================================================

    /// Start re-running discovery every `refresh_interval`
    ///
    /// The loop ends on [`DiscoveryEngine::stop_auto_refresh`] or when `cancel`
    /// fires.
    pub fn start_auto_refresh(self: &Arc<Self>, cancel: &CancellationToken) -> Result<()> {
        if self.closed.load(Ordering::Acquire) {
            return Err(Error::Stopped {
                component: "discovery engine".into(),
            });
        }

        let mut refresh = self.refresh.lock();
        if let Some(task) = refresh.as_ref() {
            if !task.handle.is_finished() {
                return Err(Error::AlreadyRunning {
                    component: "discovery auto-refresh".into(),
                });
            }
        }

        let token = cancel.child_token();
        let interval = self.config.refresh_interval;
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
                        if let Err(e) = engine.refresh_cache(&loop_token).await {
                            if e.is_cancelled() {
                                break;
                            }
                            warn!(error = %e, "Discovery auto-refresh failed");
                        }
                    }
                }
            }
            debug!("Discovery auto-refresh stopped");
        });

        info!(interval_secs = interval.as_secs_f64(), "Discovery auto-refresh started");
        *refresh = Some(RefreshTask { token, handle });
        Ok(())
    }

    /// Stop the auto-refresh loop; no-op when not running
    pub fn stop_auto_refresh(&self) {
        if let Some(task) = self.refresh.lock().take() {
            task.token.cancel();
            info!("Discovery auto-refresh stopping");
        }
    }

    pub fn is_auto_refresh_running(&self) -> bool {
        self.refresh
            .lock()
            .as_ref()
            .map(|t| !t.handle.is_finished())
            .unwrap_or(false)
    }

    /// Stop background work; the engine cannot be restarted afterwards
    pub fn close(&self) {
        self.closed.store(true, Ordering::Release);
        self.stop_auto_refresh();
    }
}

impl Drop for DiscoveryEngine {
    fn drop(&mut self) {
        if let Some(task) = self.refresh.get_mut().take() {
            task.token.cancel();
        }
    }
}

// =============================================================================
// Detection With Retry
// =============================================================================

/// Run one detector under the per-backend timeout, retrying with a fixed delay
///
/// Permission errors are returned immediately.
async fn detect_with_retry(
    detector: &BackendDetector,
    config: &DiscoveryConfig,
    cancel: &CancellationToken,
) -> Result<BackendDiscoveryResult> {
    let backend = detector.backend();
    let mut attempt = 0u32;

    loop {
        let outcome = tokio::select! {
            biased;
            _ = cancel.cancelled() => {
                return Err(cancelled(&format!("discovery of {}", backend)));
            }
            outcome = tokio::time::timeout(config.timeout, detector.detect()) => outcome,
        };

        let err = match outcome {
            Ok(Ok(result)) => return Ok(result),
            Ok(Err(e)) => e,
            Err(_) => Error::DiscoveryTimeout {
                backend: backend.to_string(),
                schema: String::new(),
                timeout: config.timeout,
            },
        };

        if err.discovery_kind() == DiscoveryErrorKind::PermissionDenied {
            warn!(backend = %backend, error = %err, "Permission denied, not retrying");
            return Err(err);
        }

        if attempt >= config.max_retries {
            return Err(err);
        }
        attempt += 1;

        debug!(
            backend = %backend,
            attempt,
            max_retries = config.max_retries,
            error = %err,
            "Retrying backend detection"
        );

        tokio::select! {
            biased;
            _ = cancel.cancelled() => {
                return Err(cancelled(&format!("discovery of {}", backend)));
            }
            _ = tokio::time::sleep(config.retry_delay) => {}
        }
    }
}

fn cancelled(operation: &str) -> Error {
    Error::Cancelled {
        operation: operation.to_string(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::discovery::types::DiscoveryStatus;
    use crate::store::MemoryResourceStore;
    use assert_matches::assert_matches;
    use std::time::Duration;

    const DELL_RG: &str = "dellcsireplicationgroups.replication.storage.dell.com";
    const TMR: &str = "tridentmirrorrelationships.trident.netapp.io";

    fn fast_config() -> DiscoveryConfig {
        DiscoveryConfig {
            timeout: Duration::from_millis(500),
            max_retries: 3,
            retry_delay: Duration::from_millis(1),
            cache_ttl: Duration::from_secs(60),
            refresh_interval: Duration::from_millis(20),
            backends: Backend::ALL.to_vec(),
            check_controllers: false,
        }
    }

    #[tokio::test]
    async fn test_discover_mixed_cluster() {
        let store = Arc::new(MemoryResourceStore::new());
        store.install_backend(Backend::Ceph);
        store.add_schema_for(Backend::Trident, TMR, true);

        let engine = DiscoveryEngine::new(fast_config(), store);
        let result = engine
            .discover_backends(&CancellationToken::new())
            .await
            .unwrap();

        assert_eq!(result.available, vec![Backend::Ceph]);
        assert_eq!(result.status_of(Backend::Trident), DiscoveryStatus::Partial);
        assert_eq!(result.status_of(Backend::PowerStore), DiscoveryStatus::Unavailable);
        assert!(result.error.is_none());
    }

    #[tokio::test]
    async fn test_failure_isolated_per_backend() {
        let store = Arc::new(MemoryResourceStore::new());
        store.install_backend(Backend::Ceph);
        store.deny_schema(DELL_RG);

        let engine = DiscoveryEngine::new(fast_config(), store);
        let result = engine
            .discover_backends(&CancellationToken::new())
            .await
            .unwrap();

        assert!(result.is_available(Backend::Ceph));
        assert_eq!(result.status_of(Backend::PowerStore), DiscoveryStatus::Unknown);
        let summary = result.error.unwrap();
        assert!(summary.starts_with("1 backend(s) failed discovery"));
        assert!(summary.contains("powerstore"));
    }

    #[tokio::test]
    async fn test_permission_denied_not_retried() {
        let store = Arc::new(MemoryResourceStore::new());
        store.deny_schema(DELL_RG);

        let engine = DiscoveryEngine::new(fast_config(), store.clone());
        let err = engine
            .discover_backend(&CancellationToken::new(), Backend::PowerStore)
            .await
            .unwrap_err();

        assert_matches!(err, Error::PermissionDenied { .. });
        assert_eq!(store.schema_lookups(DELL_RG), 1);
    }

    #[tokio::test]
    async fn test_transient_failure_retried() {
        let store = Arc::new(MemoryResourceStore::new());
        store.install_backend(Backend::PowerStore);
        store.fail_schema(DELL_RG, 2);

        let engine = DiscoveryEngine::new(fast_config(), store.clone());
        let result = engine
            .discover_backend(&CancellationToken::new(), Backend::PowerStore)
            .await
            .unwrap();

        assert_eq!(result.status, DiscoveryStatus::Available);
        assert_eq!(store.schema_lookups(DELL_RG), 3);
    }

    #[tokio::test]
    async fn test_retries_exhausted() {
        let store = Arc::new(MemoryResourceStore::new());
        store.install_backend(Backend::PowerStore);
        store.fail_schema(DELL_RG, 10);

        let mut config = fast_config();
        config.max_retries = 2;
        let engine = DiscoveryEngine::new(config, store.clone());
        let err = engine
            .discover_backend(&CancellationToken::new(), Backend::PowerStore)
            .await
            .unwrap_err();

        assert_matches!(err, Error::DiscoveryFailed { .. });
        assert_eq!(store.schema_lookups(DELL_RG), 3);
    }

    #[tokio::test]
    async fn test_detection_timeout() {
        let store = Arc::new(MemoryResourceStore::new());
        store.install_backend(Backend::Ceph);
        store.set_latency(Duration::from_millis(200));

        let mut config = fast_config();
        config.timeout = Duration::from_millis(20);
        config.max_retries = 0;
        config.backends = vec![Backend::Ceph];

        let engine = DiscoveryEngine::new(config, store);
        let result = engine
            .discover_backends(&CancellationToken::new())
            .await
            .unwrap();

        assert_eq!(result.status_of(Backend::Ceph), DiscoveryStatus::Unknown);
        assert!(result.error.unwrap().contains("timed out"));
    }

    #[tokio::test]
    async fn test_cache_expiry() {
        let store = Arc::new(MemoryResourceStore::new());
        store.install_backend(Backend::Ceph);

        let mut config = fast_config();
        config.cache_ttl = Duration::from_millis(50);
        let engine = DiscoveryEngine::new(config, store);

        assert!(engine.get_cached_result().is_none());
        engine
            .discover_backends(&CancellationToken::new())
            .await
            .unwrap();
        assert!(engine.get_cached_result().is_some());

        tokio::time::sleep(Duration::from_millis(80)).await;
        assert!(engine.get_cached_result().is_none());
    }

    #[tokio::test]
    async fn test_cached_result_served_without_lookup() {
        let store = Arc::new(MemoryResourceStore::new());
        store.install_backend(Backend::PowerStore);

        let engine = DiscoveryEngine::new(fast_config(), store.clone());
        let cancel = CancellationToken::new();
        assert!(engine
            .is_backend_available(&cancel, Backend::PowerStore)
            .await
            .unwrap());
        assert!(engine
            .is_backend_available(&cancel, Backend::PowerStore)
            .await
            .unwrap());

        assert_eq!(store.schema_lookups(DELL_RG), 1);
    }

    #[tokio::test]
    async fn test_discovery_cancelled() {
        let store = Arc::new(MemoryResourceStore::new());
        store.install_backend(Backend::Ceph);
        store.set_latency(Duration::from_secs(5));

        let engine = DiscoveryEngine::new(fast_config(), store);
        let cancel = CancellationToken::new();
        let trigger = cancel.clone();
        tokio::spawn(async move {
            tokio::time::sleep(Duration::from_millis(20)).await;
            trigger.cancel();
        });

        let started = Instant::now();
        let err = engine.discover_backends(&cancel).await.unwrap_err();
        assert!(err.is_cancelled());
        assert!(started.elapsed() < Duration::from_secs(2));
        assert!(engine.get_cached_result().is_none());
    }

    #[tokio::test]
    async fn test_auto_refresh_lifecycle() {
        let store = Arc::new(MemoryResourceStore::new());
        store.install_backend(Backend::Ceph);

        let engine = DiscoveryEngine::new(fast_config(), store);
        let cancel = CancellationToken::new();

        // Stopping when not running is a no-op
        engine.stop_auto_refresh();

        engine.start_auto_refresh(&cancel).unwrap();
        assert_matches!(
            engine.start_auto_refresh(&cancel),
            Err(Error::AlreadyRunning { .. })
        );

        tokio::time::sleep(Duration::from_millis(80)).await;
        assert!(engine.get_cached_result().is_some());

        engine.close();
        assert!(!engine.is_auto_refresh_running());
        assert_matches!(
            engine.start_auto_refresh(&cancel),
            Err(Error::Stopped { .. })
        );
    }
}
