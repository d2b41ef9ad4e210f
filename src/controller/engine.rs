//! Controller Engine
//!
//! Reconciles one UnifiedVolumeReplication end to end: backend selection,
//! capability validation, state transition validation, guarded adapter
//! calls and unified status reporting.

use crate::capability::registry::{choose_backend, query_for_spec, CapabilityRegistryRef};
use crate::crd::{
    ConditionStatus, ReplicationCondition, ReplicationPhase, ReplicationState,
    UnifiedVolumeReplication, UnifiedVolumeReplicationStatus, CONDITION_READY, CONDITION_VALID,
};
use crate::discovery::DiscoveryEngine;
use crate::domain::ports::{AdapterFactoryRef, Backend, ReplicationStoreRef};
use crate::error::{Error, ErrorAction, Result};
use crate::resilience::{CircuitBreaker, CircuitBreakerConfig, RetryConfig, RetryManager};
use crate::state::{ReplicationStateMachine, StateMachineConfig};
use chrono::Utc;
use parking_lot::RwLock;
use std::collections::HashMap;
use std::sync::Arc;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, instrument, warn};

// =============================================================================
// Configuration
// =============================================================================

/// Controller configuration
#[derive(Debug, Clone, Default)]
pub struct ControllerConfig {
    pub retry: RetryConfig,
    /// Applied to each backend's breaker
    pub circuit_breaker: CircuitBreakerConfig,
    pub state_machine: StateMachineConfig,
    /// Only select backends whose health is `Healthy`
    pub require_healthy_backend: bool,
}

/// Result of one reconcile pass
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ReconcileOutcome {
    /// The resource no longer exists
    NotFound,
    /// Backend resources were removed for a deleting resource
    Deleted { backend: Option<Backend> },
    /// Status was written
    Reconciled {
        backend: Backend,
        state: ReplicationState,
        phase: ReplicationPhase,
    },
}

// =============================================================================
// Controller Engine
// =============================================================================

/// Reconciles UnifiedVolumeReplication resources onto vendor backends
pub struct ControllerEngine {
    config: ControllerConfig,
    store: ReplicationStoreRef,
    discovery: Arc<DiscoveryEngine>,
    registry: CapabilityRegistryRef,
    adapters: AdapterFactoryRef,
    retry: RetryManager,
    state_machine: ReplicationStateMachine,
    breakers: RwLock<HashMap<Backend, Arc<CircuitBreaker>>>,
}

impl ControllerEngine {
    pub fn new(
        config: ControllerConfig,
        store: ReplicationStoreRef,
        discovery: Arc<DiscoveryEngine>,
        registry: CapabilityRegistryRef,
        adapters: AdapterFactoryRef,
    ) -> Self {
        Self {
            retry: RetryManager::new(config.retry.clone()),
            state_machine: ReplicationStateMachine::new(config.state_machine.clone()),
            config,
            store,
            discovery,
            registry,
            adapters,
            breakers: RwLock::new(HashMap::new()),
        }
    }

    pub fn state_machine(&self) -> &ReplicationStateMachine {
        &self.state_machine
    }

    pub fn retry_manager(&self) -> &RetryManager {
        &self.retry
    }

    /// Breaker guarding calls to one backend's adapter
    pub fn breaker(&self, backend: Backend) -> Arc<CircuitBreaker> {
        if let Some(breaker) = self.breakers.read().get(&backend) {
            return breaker.clone();
        }
        self.breakers
            .write()
            .entry(backend)
            .or_insert_with(|| {
                Arc::new(CircuitBreaker::new(
                    format!("adapter-{}", backend),
                    self.config.circuit_breaker.clone(),
                ))
            })
            .clone()
    }

    /// Requeue decision for a reconcile error
    pub fn error_action(&self, err: &Error) -> ErrorAction {
        match err {
            Error::RetryExhausted { last_error, .. } => match last_error.action() {
                ErrorAction::NoRequeue => ErrorAction::NoRequeue,
                _ => ErrorAction::RequeueWithBackoff,
            },
            other => other.action(),
        }
    }

    /// Backend recorded in status, else the best available one for the resource
    pub async fn select_backend(
        &self,
        cancel: &CancellationToken,
        resource: &UnifiedVolumeReplication,
    ) -> Result<Backend> {
        if let Some(backend) = resource.status.as_ref().and_then(|s| s.backend) {
            return Ok(backend);
        }

        let available = self.discovery.get_available_backends(cancel).await?;
        let mut query = query_for_spec(&resource.spec);
        if self.config.require_healthy_backend {
            query = query.require_healthy();
        }

        let ranking: Vec<_> = self
            .registry
            .query_backends_by_capabilities(&query)
            .into_iter()
            .filter(|score| available.contains(&score.backend))
            .collect();

        choose_backend(&ranking, &query)
    }

    /// Reconcile one resource
    #[instrument(skip(self, cancel))]
    pub async fn reconcile(
        &self,
        cancel: &CancellationToken,
        namespace: &str,
        name: &str,
    ) -> Result<ReconcileOutcome> {
        let Some(resource) = self.store.get(namespace, name).await? else {
            debug!("Resource not found");
            return Ok(ReconcileOutcome::NotFound);
        };
        let key = resource.key();

        if resource.is_deleting() {
            return self.finalize(cancel, &resource).await;
        }

        let backend = match self.select_backend(cancel, &resource).await {
            Ok(backend) => backend,
            Err(e) => {
                self.report_failure(&resource, None, "NoSuitableBackend", &e).await;
                return Err(e);
            }
        };

        if let Err(e) = self.registry.validate_configuration(backend, &resource.spec) {
            self.report_failure(&resource, Some(backend), "CapabilityNotSupported", &e)
                .await;
            return Err(e);
        }

        let from = resource.observed_state();
        let to = resource.spec.replication_state;
        if let Err(e) = self.state_machine.validate_transition(from, to) {
            self.report_failure(&resource, Some(backend), "InvalidTransition", &e)
                .await;
            return Err(e);
        }

        let adapter = self.adapters.create(backend)?;
        let breaker = self.breaker(backend);

        let ensured = self
            .retry
            .with_retry(cancel, &key, || async {
                breaker.call(|| adapter.ensure_replication(&resource)).await
            })
            .await;
        if let Err(e) = ensured {
            // A failed reconcile starts the next one with a full attempt allowance
            self.retry.reset_attempts(&key);
            self.report_failure(&resource, Some(backend), "BackendOperationFailed", &e)
                .await;
            return Err(e);
        }

        let observed = self
            .retry
            .with_retry(cancel, &key, || async {
                breaker.call(|| adapter.replication_status(&resource)).await
            })
            .await;
        let observed = match observed {
            Ok(observed) => observed,
            Err(e) => {
                self.retry.reset_attempts(&key);
                self.report_failure(&resource, Some(backend), "StatusUnavailable", &e)
                    .await;
                return Err(e);
            }
        };

        let request_id = format!(
            "{}@{}",
            key,
            resource.metadata.generation.unwrap_or_default()
        );
        if from != to {
            self.state_machine
                .transition(from, to, "reconcile", request_id)?;
        }

        let phase = if !observed.healthy {
            ReplicationPhase::Degraded
        } else if observed.state == to {
            ReplicationPhase::Ready
        } else {
            ReplicationPhase::Pending
        };

        let mut status = resource.status.clone().unwrap_or_default();
        status.phase = phase;
        status.state = observed.state;
        status.backend = Some(backend);
        status.message = Some(observed.message.clone());
        status.observed_generation = resource.metadata.generation;
        status.last_sync_time = observed.last_sync_time.or(status.last_sync_time);
        status.last_reconcile_time = Some(Utc::now());
        status.set_condition(ReplicationCondition::new(
            CONDITION_VALID,
            ConditionStatus::True,
            "Validated",
            format!("{} supports the requested configuration", backend),
        ));
        status.set_condition(ReplicationCondition::new(
            CONDITION_READY,
            if phase == ReplicationPhase::Ready {
                ConditionStatus::True
            } else {
                ConditionStatus::False
            },
            &phase.to_string(),
            observed.message,
        ));

        self.store.update_status(namespace, name, status).await?;

        info!(
            backend = %backend,
            state = observed.state.describe(),
            phase = %phase,
            "Reconciled replication"
        );

        Ok(ReconcileOutcome::Reconciled {
            backend,
            state: observed.state,
            phase,
        })
    }

    async fn finalize(
        &self,
        cancel: &CancellationToken,
        resource: &UnifiedVolumeReplication,
    ) -> Result<ReconcileOutcome> {
        let key = resource.key();
        let backend = resource.status.as_ref().and_then(|s| s.backend);

        if let Some(backend) = backend {
            let adapter = self.adapters.create(backend)?;
            let breaker = self.breaker(backend);
            let deleted = self
                .retry
                .with_retry(cancel, &key, || async {
                    breaker.call(|| adapter.delete_replication(resource)).await
                })
                .await;
            if let Err(e) = deleted {
                self.retry.reset_attempts(&key);
                return Err(e);
            }
            info!(backend = %backend, key = %key, "Removed backend replication");
        }

        self.retry.reset_attempts(&key);
        Ok(ReconcileOutcome::Deleted { backend })
    }

    /// Write an error status; failures to write are logged, not returned
    async fn report_failure(
        &self,
        resource: &UnifiedVolumeReplication,
        backend: Option<Backend>,
        reason: &str,
        err: &Error,
    ) {
        let mut status: UnifiedVolumeReplicationStatus = resource.status.clone().unwrap_or_default();
        status.phase = ReplicationPhase::Error;
        if backend.is_some() {
            status.backend = backend;
        }
        status.message = Some(err.to_string());
        status.last_reconcile_time = Some(Utc::now());

        let validation = matches!(
            err,
            Error::InvalidTransition { .. }
                | Error::CapabilityNotSupported { .. }
                | Error::NoSuitableBackend { .. }
        );
        if validation {
            status.set_condition(ReplicationCondition::new(
                CONDITION_VALID,
                ConditionStatus::False,
                reason,
                err.to_string(),
            ));
        }
        status.set_condition(ReplicationCondition::new(
            CONDITION_READY,
            ConditionStatus::False,
            reason,
            err.to_string(),
        ));

        if let Err(write_err) = self
            .store
            .update_status(resource.namespace(), resource.name(), status)
            .await
        {
            warn!(
                key = %resource.key(),
                error = %write_err,
                "Failed to write error status"
            );
        }
    }
}
