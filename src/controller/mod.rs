//! Controller layer
//!
//! Ties discovery, capability ranking, resilience and the state machine
//! together for a single reconcile pass.

pub mod engine;

pub use engine::{ControllerConfig, ControllerEngine, ReconcileOutcome};
