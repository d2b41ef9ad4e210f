//! Circuit Breaker
//!
//! Three-state failure isolation for one class of outbound operation.
//!
//! ```text
//!            failures >= threshold
//!   Closed ─────────────────────────▶ Open
//!     ▲                                │ timeout elapsed
//!     │ successes >= threshold         ▼
//!     └────────────────────────── Half-Open ──▶ Open (any failure)
//! ```

use crate::error::{Error, Result};
use chrono::{DateTime, Utc};
use parking_lot::RwLock;
use serde::Serialize;
use std::future::Future;
use std::time::{Duration, Instant};
use tracing::{debug, info, warn};

/// Breaker state
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub enum CircuitState {
    #[default]
    Closed,
    Open,
    HalfOpen,
}

impl std::fmt::Display for CircuitState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            CircuitState::Closed => write!(f, "Closed"),
            CircuitState::Open => write!(f, "Open"),
            CircuitState::HalfOpen => write!(f, "HalfOpen"),
        }
    }
}

/// Circuit breaker configuration
#[derive(Debug, Clone)]
pub struct CircuitBreakerConfig {
    /// Consecutive failures that open the breaker
    pub failure_threshold: u32,
    /// Consecutive half-open successes that close it
    pub success_threshold: u32,
    /// Time spent open before a trial call is allowed
    pub timeout: Duration,
}

impl Default for CircuitBreakerConfig {
    fn default() -> Self {
        Self {
            failure_threshold: 5,
            success_threshold: 2,
            timeout: Duration::from_secs(60),
        }
    }
}

/// Point-in-time view of a breaker
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct CircuitBreakerMetrics {
    pub name: String,
    pub state: CircuitState,
    pub failure_count: u32,
    pub success_count: u32,
    pub rejected_calls: u64,
    pub opened_at: Option<DateTime<Utc>>,
    pub last_failure: Option<DateTime<Utc>>,
    pub last_success: Option<DateTime<Utc>>,
}

#[derive(Debug, Default)]
struct BreakerState {
    state: CircuitState,
    failure_count: u32,
    success_count: u32,
    rejected_calls: u64,
    opened_at: Option<Instant>,
    opened_at_wall: Option<DateTime<Utc>>,
    last_failure: Option<DateTime<Utc>>,
    last_success: Option<DateTime<Utc>>,
}

impl BreakerState {
    fn open(&mut self) {
        self.state = CircuitState::Open;
        self.opened_at = Some(Instant::now());
        self.opened_at_wall = Some(Utc::now());
        self.success_count = 0;
    }
}

/// Named circuit breaker shared by every caller of one operation class
#[derive(Debug)]
pub struct CircuitBreaker {
    name: String,
    config: CircuitBreakerConfig,
    inner: RwLock<BreakerState>,
}

impl CircuitBreaker {
    pub fn new(name: impl Into<String>, config: CircuitBreakerConfig) -> Self {
        Self {
            name: name.into(),
            config,
            inner: RwLock::new(BreakerState::default()),
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn get_state(&self) -> CircuitState {
        self.inner.read().state
    }

    /// Admit or reject a call
    ///
    /// An open breaker whose timeout has elapsed moves to half-open and
    /// admits the call that observed it. The decision is made under the
    /// write lock so racing callers see one transition.
    pub fn allow_request(&self) -> Result<()> {
        let mut inner = self.inner.write();
        match inner.state {
            CircuitState::Closed | CircuitState::HalfOpen => Ok(()),
            CircuitState::Open => {
                let elapsed = inner.opened_at.map(|t| t.elapsed()).unwrap_or_default();
                if elapsed > self.config.timeout {
                    inner.state = CircuitState::HalfOpen;
                    inner.success_count = 0;
                    info!(breaker = %self.name, "Circuit breaker half-open");
                    Ok(())
                } else {
                    inner.rejected_calls += 1;
                    Err(Error::CircuitOpen {
                        name: self.name.clone(),
                    })
                }
            }
        }
    }

    pub fn record_success(&self) {
        let mut inner = self.inner.write();
        inner.last_success = Some(Utc::now());
        match inner.state {
            CircuitState::Closed => inner.failure_count = 0,
            CircuitState::HalfOpen => {
                inner.success_count += 1;
                if inner.success_count >= self.config.success_threshold {
                    inner.state = CircuitState::Closed;
                    inner.failure_count = 0;
                    inner.success_count = 0;
                    inner.opened_at = None;
                    inner.opened_at_wall = None;
                    info!(breaker = %self.name, "Circuit breaker closed");
                }
            }
            CircuitState::Open => {}
        }
    }

    pub fn record_failure(&self) {
        let mut inner = self.inner.write();
        inner.last_failure = Some(Utc::now());
        match inner.state {
            CircuitState::Closed => {
                inner.failure_count += 1;
                inner.success_count = 0;
                if inner.failure_count >= self.config.failure_threshold {
                    inner.open();
                    warn!(
                        breaker = %self.name,
                        failures = inner.failure_count,
                        "Circuit breaker opened"
                    );
                }
            }
            CircuitState::HalfOpen => {
                inner.failure_count += 1;
                inner.open();
                warn!(breaker = %self.name, "Circuit breaker re-opened from half-open");
            }
            CircuitState::Open => {}
        }
    }

    /// Run `op` through the breaker
    ///
    /// Rejected calls return [`Error::CircuitOpen`] without running `op`.
    /// Cancellation is not counted as a failure.
    pub async fn call<T, F, Fut>(&self, op: F) -> Result<T>
    where
        F: FnOnce() -> Fut,
        Fut: Future<Output = Result<T>>,
    {
        self.allow_request()?;

        match op().await {
            Ok(value) => {
                self.record_success();
                Ok(value)
            }
            Err(e) if e.is_cancelled() => Err(e),
            Err(e) => {
                debug!(breaker = %self.name, error = %e, "Guarded call failed");
                self.record_failure();
                Err(e)
            }
        }
    }

    /// Force the breaker closed with zero counters
    pub fn reset(&self) {
        let mut inner = self.inner.write();
        let (last_failure, last_success) = (inner.last_failure, inner.last_success);
        *inner = BreakerState {
            last_failure,
            last_success,
            ..Default::default()
        };
        info!(breaker = %self.name, "Circuit breaker reset");
    }

    pub fn get_metrics(&self) -> CircuitBreakerMetrics {
        let inner = self.inner.read();
        CircuitBreakerMetrics {
            name: self.name.clone(),
            state: inner.state,
            failure_count: inner.failure_count,
            success_count: inner.success_count,
            rejected_calls: inner.rejected_calls,
            opened_at: inner.opened_at_wall,
            last_failure: inner.last_failure,
            last_success: inner.last_success,
        }
    }
}
