//! Custom Resource Definitions for unified replication
//!
//! - UnifiedVolumeReplication: vendor-neutral replication of one volume

pub mod unified_replication;

pub use unified_replication::*;

// Re-export common types for convenience
pub use chrono::{DateTime, Utc};
