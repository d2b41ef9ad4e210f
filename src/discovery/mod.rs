//! Backend Discovery
//!
//! Determines which replication backends are installed and ready in the
//! cluster from the presence and readiness of their schema declarations.
//!
//! ```text
//! ┌──────────────────────────────────────────────────────────────┐
//! │                      Discovery Engine                        │
//! │        (parallel detection, timeout + retry, TTL cache)      │
//! ├──────────────────┬──────────────────┬────────────────────────┤
//! │  Ceph detector   │ Trident detector │  PowerStore detector   │
//! └────────┬─────────┴────────┬─────────┴───────────┬────────────┘
//!          └──────────────────┼─────────────────────┘
//!                     ┌───────┴────────┐
//!                     │ Resource Store │
//!                     └────────────────┘
//! ```

pub mod detector;
pub mod engine;
pub mod types;

pub use detector::BackendDetector;
pub use engine::DiscoveryEngine;
pub use types::{
    schema_requirements, BackendDiscoveryResult, ControllerRef, DiscoveryConfig, DiscoveryResult,
    DiscoveryStatus, SchemaAvailability, SchemaRequirement,
};
