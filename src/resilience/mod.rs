//! Resilience Primitives
//!
//! Guards for outbound backend operations:
//! - [`RetryManager`]: per-key attempt tracking with exponential backoff
//! - [`CircuitBreaker`]: three-state failure isolation per operation class

pub mod circuit_breaker;
pub mod retry;

pub use circuit_breaker::{CircuitBreaker, CircuitBreakerConfig, CircuitBreakerMetrics, CircuitState};
pub use retry::{RetryConfig, RetryManager};
