//! Health Monitor
//!
//! Background loop that keeps registered backends' health, capabilities
//! and performance samples fresh. Per-tick work fans out across backends
//! with a bounded number of concurrent checks.

use crate::capability::detector::CapabilityDetector;
use crate::capability::registry::CapabilityRegistryRef;
use crate::capability::types::{HealthLevel, HealthStatus};
use crate::domain::ports::Backend;
use crate::error::{Error, Result};
use parking_lot::Mutex;
use serde::Serialize;
use std::collections::BTreeMap;
use std::future::Future;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Weak};
use std::time::Duration;
use tokio::sync::Semaphore;
use tokio::task::{JoinHandle, JoinSet};
use tokio::time::{interval_at, Instant, MissedTickBehavior};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

// =============================================================================
// Configuration
// =============================================================================

/// Health monitor configuration
#[derive(Debug, Clone)]
pub struct HealthMonitorConfig {
    pub health_check_interval: Duration,
    pub capability_refresh_interval: Duration,
    /// Performance sampling interval; `None` disables sampling
    pub performance_interval: Option<Duration>,
    pub max_concurrent_checks: usize,
    /// Upper bound for a single backend check
    pub check_timeout: Duration,
}

impl Default for HealthMonitorConfig {
    fn default() -> Self {
        Self {
            health_check_interval: Duration::from_secs(30),
            capability_refresh_interval: Duration::from_secs(300),
            performance_interval: Some(Duration::from_secs(600)),
            max_concurrent_checks: 5,
            check_timeout: Duration::from_secs(10),
        }
    }
}

// =============================================================================
// Health Summary
// =============================================================================

/// Aggregate health across registered backends
#[derive(Debug, Clone, Default, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct HealthSummary {
    pub total: usize,
    pub healthy: usize,
    pub degraded: usize,
    pub unhealthy: usize,
    pub unknown: usize,
    pub backends: BTreeMap<Backend, HealthLevel>,
}

impl HealthSummary {
    /// True when no backend is degraded, unhealthy or unknown
    pub fn is_healthy(&self) -> bool {
        self.degraded == 0 && self.unhealthy == 0 && self.unknown == 0
    }

    pub fn health_percentage(&self) -> f64 {
        if self.total == 0 {
            return 0.0;
        }
        self.healthy as f64 * 100.0 / self.total as f64
    }
}

// =============================================================================
// Health Monitor
// =============================================================================

struct MonitorTask {
    token: CancellationToken,
    handle: JoinHandle<()>,
}

/// Periodic health, capability and performance checks
pub struct HealthMonitor {
    config: HealthMonitorConfig,
    registry: CapabilityRegistryRef,
    semaphore: Arc<Semaphore>,
    task: Mutex<Option<MonitorTask>>,
    stopped: AtomicBool,
}

impl HealthMonitor {
    pub fn new(config: HealthMonitorConfig, registry: CapabilityRegistryRef) -> Arc<Self> {
        let permits = config.max_concurrent_checks.max(1);
        Arc::new(Self {
            config,
            registry,
            semaphore: Arc::new(Semaphore::new(permits)),
            task: Mutex::new(None),
            stopped: AtomicBool::new(false),
        })
    }

    pub fn config(&self) -> &HealthMonitorConfig {
        &self.config
    }

    /// Start the background loop
    ///
    /// The loop ends on [`HealthMonitor::stop`] or when `cancel` fires. A
    /// stopped monitor cannot be started again.
    pub fn start(self: &Arc<Self>, cancel: &CancellationToken) -> Result<()> {
        if self.stopped.load(Ordering::SeqCst) {
            return Err(Error::Stopped {
                component: "health monitor".into(),
            });
        }

        let mut task = self.task.lock();
        if task.as_ref().map(|t| !t.handle.is_finished()).unwrap_or(false) {
            return Err(Error::AlreadyRunning {
                component: "health monitor".into(),
            });
        }

        let token = cancel.child_token();
        let handle = tokio::spawn(Self::run(Arc::downgrade(self), self.config.clone(), token.clone()));
        *task = Some(MonitorTask { token, handle });

        info!(
            health_interval = ?self.config.health_check_interval,
            refresh_interval = ?self.config.capability_refresh_interval,
            performance_interval = ?self.config.performance_interval,
            "Health monitor started"
        );
        Ok(())
    }

    /// Stop the background loop; the monitor cannot be restarted
    pub fn stop(&self) {
        self.stopped.store(true, Ordering::SeqCst);
        if let Some(task) = self.task.lock().take() {
            task.token.cancel();
            info!("Health monitor stopped");
        }
    }

    pub fn is_running(&self) -> bool {
        self.task
            .lock()
            .as_ref()
            .map(|t| !t.handle.is_finished() && !t.token.is_cancelled())
            .unwrap_or(false)
    }

    async fn run(monitor: Weak<Self>, config: HealthMonitorConfig, token: CancellationToken) {
        let start = Instant::now();
        let mut health = interval_at(start + config.health_check_interval, config.health_check_interval);
        let mut refresh = interval_at(
            start + config.capability_refresh_interval,
            config.capability_refresh_interval,
        );
        let performance_period = config.performance_interval.unwrap_or(Duration::from_secs(3600));
        let mut performance = interval_at(start + performance_period, performance_period);
        for ticker in [&mut health, &mut refresh, &mut performance] {
            ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
        }

        loop {
            tokio::select! {
                _ = token.cancelled() => break,
                _ = health.tick() => {
                    let Some(monitor) = monitor.upgrade() else { break };
                    monitor.run_health_checks(&token).await;
                }
                _ = refresh.tick() => {
                    let Some(monitor) = monitor.upgrade() else { break };
                    monitor.run_capability_refresh(&token).await;
                }
                _ = performance.tick(), if config.performance_interval.is_some() => {
                    let Some(monitor) = monitor.upgrade() else { break };
                    monitor.run_performance_sampling(&token).await;
                }
            }
        }

        debug!("Health monitor loop exited");
    }

    /// Run `work` for every registered backend that has a detector
    async fn for_each_backend<F, Fut>(&self, cancel: &CancellationToken, work: F) -> usize
    where
        F: Fn(Arc<CapabilityDetector>, CapabilityRegistryRef, CancellationToken) -> Fut,
        Fut: Future<Output = ()> + Send + 'static,
    {
        let mut tasks = JoinSet::new();
        for backend in self.registry.registered_backends() {
            let Some(detector) = self.registry.detector(backend) else {
                continue;
            };
            let semaphore = self.semaphore.clone();
            let job = work(detector, self.registry.clone(), cancel.clone());
            tasks.spawn(async move {
                // Closed only if the semaphore is dropped, which outlives this task
                let Ok(_permit) = semaphore.acquire_owned().await else {
                    return;
                };
                job.await;
            });
        }

        let mut completed = 0;
        while let Some(joined) = tasks.join_next().await {
            match joined {
                Ok(()) => completed += 1,
                Err(e) => warn!(error = %e, "Backend check task failed"),
            }
        }
        completed
    }

    /// Check every registered backend's health once
    pub async fn run_health_checks(&self, cancel: &CancellationToken) -> usize {
        let timeout = self.config.check_timeout;
        self.for_each_backend(cancel, move |detector, registry, cancel| async move {
            let backend = detector.backend();
            let health = match tokio::time::timeout(timeout, detector.check_health(&cancel)).await {
                Ok(Ok(health)) => health,
                Ok(Err(e)) if e.is_cancelled() => return,
                Ok(Err(e)) => HealthStatus::with_level(HealthLevel::Unhealthy, e.to_string()),
                Err(_) => HealthStatus::with_level(
                    HealthLevel::Unknown,
                    format!("health check timed out after {:?}", timeout),
                ),
            };
            debug!(backend = %backend, level = %health.level, "Health check complete");
            if let Err(e) = registry.update_health(backend, health) {
                debug!(backend = %backend, error = %e, "Backend unregistered during health check");
            }
        })
        .await
    }

    /// Refresh every registered backend's capabilities once
    pub async fn run_capability_refresh(&self, cancel: &CancellationToken) -> usize {
        let timeout = self.config.check_timeout;
        self.for_each_backend(cancel, move |detector, registry, cancel| async move {
            let backend = detector.backend();
            match tokio::time::timeout(timeout, registry.refresh_capabilities(&cancel, backend)).await {
                Ok(Ok(_)) => debug!(backend = %backend, "Capabilities refreshed"),
                Ok(Err(e)) if e.is_cancelled() => {}
                Ok(Err(e)) => warn!(backend = %backend, error = %e, "Capability refresh failed"),
                Err(_) => warn!(backend = %backend, "Capability refresh timed out"),
            }
        })
        .await
    }

    /// Sample every registered backend's performance once
    pub async fn run_performance_sampling(&self, cancel: &CancellationToken) -> usize {
        let timeout = self.config.check_timeout;
        self.for_each_backend(cancel, move |detector, registry, cancel| async move {
            let backend = detector.backend();
            match tokio::time::timeout(timeout, detector.get_performance_characteristics(&cancel))
                .await
            {
                Ok(Ok(performance)) => {
                    if let Err(e) = registry.update_performance(backend, performance) {
                        debug!(backend = %backend, error = %e, "Backend unregistered during performance sampling");
                    }
                }
                Ok(Err(e)) if e.is_cancelled() => {}
                Ok(Err(e)) => warn!(backend = %backend, error = %e, "Performance sampling failed"),
                Err(_) => warn!(backend = %backend, "Performance sampling timed out"),
            }
        })
        .await
    }

    /// Counts per health level across registered backends
    pub fn get_health_summary(&self) -> HealthSummary {
        let mut summary = HealthSummary::default();
        for caps in self.registry.get_all_capabilities() {
            summary.total += 1;
            match caps.health.level {
                HealthLevel::Healthy => summary.healthy += 1,
                HealthLevel::Degraded => summary.degraded += 1,
                HealthLevel::Unhealthy => summary.unhealthy += 1,
                HealthLevel::Unknown => summary.unknown += 1,
            }
            summary.backends.insert(caps.backend, caps.health.level);
        }
        summary
    }
}

impl Drop for HealthMonitor {
    fn drop(&mut self) {
        if let Some(task) = self.task.get_mut().take() {
            task.token.cancel();
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::capability::registry::CapabilityRegistry;
    use crate::capability::types::BackendCapabilities;
    use crate::store::MemoryResourceStore;
    use assert_matches::assert_matches;

    fn registry_with(store: &Arc<MemoryResourceStore>, backends: &[Backend]) -> CapabilityRegistryRef {
        let registry = Arc::new(CapabilityRegistry::new());
        for backend in backends {
            registry.register_capabilities(BackendCapabilities::new(*backend));
            registry.register_detector(Arc::new(CapabilityDetector::new(*backend, store.clone())));
        }
        registry
    }

    #[tokio::test]
    async fn test_health_checks_update_registry() {
        let store = Arc::new(MemoryResourceStore::new());
        store.install_backend(Backend::Ceph);
        let registry = registry_with(&store, &[Backend::Ceph, Backend::Trident]);

        let monitor = HealthMonitor::new(HealthMonitorConfig::default(), registry.clone());
        let checked = monitor.run_health_checks(&CancellationToken::new()).await;
        assert_eq!(checked, 2);

        let summary = monitor.get_health_summary();
        assert_eq!(summary.total, 2);
        assert_eq!(summary.healthy, 1);
        assert_eq!(summary.unhealthy, 1);
        assert!(!summary.is_healthy());
        assert_eq!(summary.health_percentage(), 50.0);
    }

    #[tokio::test]
    async fn test_health_checks_skip_unregistered_backends() {
        let store = Arc::new(MemoryResourceStore::new());
        store.install_backend(Backend::PowerStore);
        let registry = Arc::new(CapabilityRegistry::new());
        registry.register_detector(Arc::new(CapabilityDetector::new(
            Backend::PowerStore,
            store.clone(),
        )));

        let monitor = HealthMonitor::new(HealthMonitorConfig::default(), registry.clone());
        assert_eq!(monitor.run_health_checks(&CancellationToken::new()).await, 0);
        assert!(registry.get_capabilities(Backend::PowerStore).is_none());
    }

    #[tokio::test]
    async fn test_capability_refresh_and_performance() {
        let store = Arc::new(MemoryResourceStore::new());
        store.install_backend(Backend::Trident);
        let registry = registry_with(&store, &[Backend::Trident]);
        let monitor = HealthMonitor::new(HealthMonitorConfig::default(), registry.clone());
        let cancel = CancellationToken::new();

        monitor.run_capability_refresh(&cancel).await;
        monitor.run_performance_sampling(&cancel).await;

        let caps = registry.get_capabilities(Backend::Trident).unwrap();
        assert_eq!(caps.capabilities.len(), 25);
        assert!(caps.performance.is_some());
    }

    #[tokio::test]
    async fn test_sampling_tolerates_backend_unregistered_mid_check() {
        let store = Arc::new(MemoryResourceStore::new());
        store.install_backend(Backend::Ceph);
        store.set_latency(Duration::from_millis(60));
        let registry = registry_with(&store, &[Backend::Ceph]);
        let monitor = HealthMonitor::new(HealthMonitorConfig::default(), registry.clone());

        let sampling = {
            let monitor = monitor.clone();
            tokio::spawn(async move {
                monitor
                    .run_performance_sampling(&CancellationToken::new())
                    .await
            })
        };
        tokio::time::sleep(Duration::from_millis(15)).await;
        registry.unregister(Backend::Ceph);

        assert_eq!(sampling.await.unwrap(), 1);
        assert!(registry.get_capabilities(Backend::Ceph).is_none());
    }

    #[tokio::test]
    async fn test_background_loop_runs_and_stops() {
        let store = Arc::new(MemoryResourceStore::new());
        store.install_backend(Backend::Ceph);
        let registry = registry_with(&store, &[Backend::Ceph]);

        let config = HealthMonitorConfig {
            health_check_interval: Duration::from_millis(20),
            performance_interval: None,
            ..Default::default()
        };
        let monitor = HealthMonitor::new(config, registry.clone());
        let cancel = CancellationToken::new();

        monitor.start(&cancel).unwrap();
        assert!(monitor.is_running());
        assert_matches!(monitor.start(&cancel), Err(Error::AlreadyRunning { .. }));

        tokio::time::sleep(Duration::from_millis(120)).await;
        assert!(monitor.get_health_summary().is_healthy());

        monitor.stop();
        assert!(!monitor.is_running());
        assert_matches!(monitor.start(&cancel), Err(Error::Stopped { .. }));
    }

    #[tokio::test]
    async fn test_loop_ends_on_parent_cancellation() {
        let registry = Arc::new(CapabilityRegistry::new());
        let monitor = HealthMonitor::new(HealthMonitorConfig::default(), registry);
        let cancel = CancellationToken::new();

        monitor.start(&cancel).unwrap();
        cancel.cancel();
        tokio::time::sleep(Duration::from_millis(20)).await;
        assert!(!monitor.is_running());
    }

    #[test]
    fn test_empty_summary() {
        let summary = HealthSummary::default();
        assert!(summary.is_healthy());
        assert_eq!(summary.health_percentage(), 0.0);
    }
}
