//! Backend Capabilities
//!
//! Graded feature support per backend, live health, and capability-based
//! backend ranking.
//!
//! ```text
//! ┌───────────────────────────┐      ┌──────────────────────────┐
//! │ Enhanced Discovery Engine │─────▶│   Capability Registry    │
//! │ (discovery + detection)   │      │ (scored queries, stats)  │
//! └─────────────┬─────────────┘      └────────────▲─────────────┘
//!               │                                 │ health / refresh
//!      ┌────────┴────────┐               ┌────────┴─────────┐
//!      │ Capability      │◀──────────────│  Health Monitor  │
//!      │ Detectors       │               │  (3 tickers)     │
//!      └─────────────────┘               └──────────────────┘
//! ```

pub mod detector;
pub mod enhanced;
pub mod monitor;
pub mod registry;
pub mod types;

pub use detector::CapabilityDetector;
pub use enhanced::{EnhancedDiscoveryConfig, EnhancedDiscoveryEngine, EnhancedDiscoveryResult};
pub use monitor::{HealthMonitor, HealthMonitorConfig, HealthSummary};
pub use registry::{
    query_for_spec, required_capabilities_for, score_backend, CapabilityRegistry,
    CapabilityRegistryRef,
};
pub use types::{
    BackendCapabilities, BackendScore, Capability, CapabilityInfo, CapabilityLevel,
    CapabilityQuery, HealthCheck, HealthLevel, HealthStatus, PerformanceCharacteristics,
    RegistryStatistics, VersionInfo,
};
