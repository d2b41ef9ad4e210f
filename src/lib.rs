//! Unified Replication Operator
//!
//! Backend discovery, capability ranking and resilience core for a
//! Kubernetes operator that maps one vendor-neutral replication resource
//! onto Ceph, Trident or PowerStore.
//!
//! # Architecture
//!
//! ```text
//! ┌─────────────────────────────────────────────────────────────────────┐
//! │                         Controller Engine                           │
//! │     (backend selection, retry + circuit breaker, status report)     │
//! ├──────────────────┬──────────────────────┬───────────────────────────┤
//! │ Discovery Engine │ Capability Registry  │ Replication State Machine │
//! │ (TTL cache,      │ (scored queries,     │ (transition graph,        │
//! │  auto-refresh)   │  health monitor)     │  bounded history)         │
//! ├──────────────────┴──────────────────────┴───────────────────────────┤
//! │                     Resource Store Gateway                          │
//! │            (kube client  |  in-memory fixture store)                │
//! └─────────────────────────────────────────────────────────────────────┘
//! ```
//!
//! # Modules
//!
//! - [`discovery`]: Backend detection from schema declarations
//! - [`capability`]: Capability detection, registry, health monitoring
//! - [`resilience`]: Retry manager and circuit breaker
//! - [`state`]: Replication lifecycle state machine
//! - [`controller`]: Reconcile orchestration
//! - [`store`]: Resource store implementations
//! - [`crd`]: Custom Resource Definitions
//! - [`domain`]: Core domain types and traits
//! - [`error`]: Error types and handling

pub mod capability;
pub mod controller;
pub mod crd;
pub mod discovery;
pub mod domain;
pub mod error;
pub mod resilience;
pub mod state;
pub mod store;

// Re-export commonly used types
pub use capability::{
    BackendCapabilities, Capability, CapabilityLevel, CapabilityQuery, CapabilityRegistry,
    CapabilityRegistryRef, EnhancedDiscoveryConfig, EnhancedDiscoveryEngine, HealthLevel,
    HealthMonitor, HealthMonitorConfig, HealthSummary,
};

pub use controller::{ControllerConfig, ControllerEngine, ReconcileOutcome};

pub use crd::{
    ReplicationMode, ReplicationPhase, ReplicationState, UnifiedVolumeReplication,
    UnifiedVolumeReplicationSpec, UnifiedVolumeReplicationStatus,
};

pub use discovery::{DiscoveryConfig, DiscoveryEngine, DiscoveryResult, DiscoveryStatus};

pub use domain::ports::{
    AdapterFactory, Backend, ReplicationAdapter, ReplicationStore, ResourceStore, SchemaInfo,
};

pub use error::{Error, ErrorAction, Result};

pub use resilience::{CircuitBreaker, CircuitBreakerConfig, CircuitState, RetryConfig, RetryManager};

pub use state::{ReplicationStateMachine, StateMachineConfig};

pub use store::{KubeResourceStore, MemoryResourceStore};

/// Library version
pub const VERSION: &str = env!("CARGO_PKG_VERSION");

/// Library name
pub const NAME: &str = env!("CARGO_PKG_NAME");
