//! Domain layer - Backend identity and port definitions
//!
//! This module defines the traits (ports) that stores and replication
//! adapters implement, keeping the discovery core transport-agnostic.

pub mod ports;

pub use ports::*;
