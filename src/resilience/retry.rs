//! Retry Manager
//!
//! Per-key attempt tracking with exponential backoff and jitter. Keys are
//! caller supplied, typically `namespace/name` of the reconciled resource;
//! callers reset a key once the work completes.

use crate::error::{Error, Result};
use chrono::{DateTime, Utc};
use parking_lot::RwLock;
use rand::Rng;
use std::collections::HashMap;
use std::future::Future;
use std::time::Duration;
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

// =============================================================================
// Configuration
// =============================================================================

/// Retry policy
#[derive(Debug, Clone)]
pub struct RetryConfig {
    /// Attempts allowed per key, including the first
    pub max_attempts: u32,
    pub initial_delay: Duration,
    pub max_delay: Duration,
    pub multiplier: f64,
    /// Random extra delay as a fraction of the computed delay
    pub jitter: f64,
    /// Message substrings that mark an error retryable
    pub retryable_errors: Vec<String>,
    /// Message substrings that mark an error terminal
    pub non_retryable_errors: Vec<String>,
}

impl Default for RetryConfig {
    fn default() -> Self {
        Self {
            max_attempts: 5,
            initial_delay: Duration::from_secs(1),
            max_delay: Duration::from_secs(300),
            multiplier: 2.0,
            jitter: 0.1,
            retryable_errors: [
                "connection refused",
                "timeout",
                "timed out",
                "temporary failure",
                "service unavailable",
            ]
            .iter()
            .map(|s| s.to_string())
            .collect(),
            non_retryable_errors: ["permission denied", "forbidden", "unauthorized", "not supported"]
                .iter()
                .map(|s| s.to_string())
                .collect(),
        }
    }
}

#[derive(Debug, Clone, Default)]
struct RetryState {
    attempts: u32,
    last_attempt: Option<DateTime<Utc>>,
}

// =============================================================================
// Retry Manager
// =============================================================================

/// Tracks attempts per key and computes backoff delays
#[derive(Debug, Default)]
pub struct RetryManager {
    config: RetryConfig,
    states: RwLock<HashMap<String, RetryState>>,
}

impl RetryManager {
    pub fn new(config: RetryConfig) -> Self {
        Self {
            config,
            states: RwLock::new(HashMap::new()),
        }
    }

    pub fn config(&self) -> &RetryConfig {
        &self.config
    }

    /// Classify an error
    ///
    /// Cancellation, exhausted retries, open breakers and rejected
    /// transitions never retry. Otherwise the retryable list wins over the
    /// non-retryable list, and an error matching neither is retryable.
    pub fn is_retryable_error(&self, err: &Error) -> bool {
        if matches!(
            err,
            Error::Cancelled { .. }
                | Error::RetryExhausted { .. }
                | Error::CircuitOpen { .. }
                | Error::InvalidTransition { .. }
        ) {
            return false;
        }

        let message = err.to_string().to_lowercase();
        if self
            .config
            .retryable_errors
            .iter()
            .any(|s| message.contains(&s.to_lowercase()))
        {
            return true;
        }
        !self
            .config
            .non_retryable_errors
            .iter()
            .any(|s| message.contains(&s.to_lowercase()))
    }

    /// Whether another attempt is allowed for `key` after `err`
    pub fn should_retry(&self, key: &str, err: &Error) -> bool {
        self.get_attempt_count(key) < self.config.max_attempts && self.is_retryable_error(err)
    }

    /// Count an attempt, returning the new total
    pub fn record_attempt(&self, key: &str) -> u32 {
        let mut states = self.states.write();
        let state = states.entry(key.to_string()).or_default();
        state.attempts += 1;
        state.last_attempt = Some(Utc::now());
        state.attempts
    }

    pub fn reset_attempts(&self, key: &str) {
        self.states.write().remove(key);
    }

    pub fn get_attempt_count(&self, key: &str) -> u32 {
        self.states
            .read()
            .get(key)
            .map(|s| s.attempts)
            .unwrap_or(0)
    }

    pub fn last_attempt(&self, key: &str) -> Option<DateTime<Utc>> {
        self.states.read().get(key).and_then(|s| s.last_attempt)
    }

    /// Number of keys currently tracked
    pub fn tracked_keys(&self) -> usize {
        self.states.read().len()
    }

    /// Delay before the next attempt, without jitter
    ///
    /// `initial_delay * multiplier^(attempts - 1)`, capped at `max_delay`.
    pub fn base_delay(&self, attempts: u32) -> Duration {
        let exponent = attempts.saturating_sub(1).min(i32::MAX as u32) as i32;
        let secs = self.config.initial_delay.as_secs_f64() * self.config.multiplier.powi(exponent);
        let max = self.config.max_delay.as_secs_f64();
        if !secs.is_finite() || secs >= max {
            return self.config.max_delay;
        }
        Duration::from_secs_f64(secs.max(0.0))
    }

    /// Delay before the next attempt for `key`, never above `max_delay`
    pub fn get_next_delay(&self, key: &str) -> Duration {
        let base = self.base_delay(self.get_attempt_count(key).max(1));
        if self.config.jitter <= 0.0 {
            return base;
        }

        let spread = base.as_secs_f64() * self.config.jitter;
        let extra = rand::thread_rng().gen_range(0.0..=spread);
        (base + Duration::from_secs_f64(extra)).min(self.config.max_delay)
    }

    /// Run `op` until it succeeds, fails terminally, or attempts run out
    ///
    /// The key is reset on success. Cancellation is checked before every
    /// attempt and during each backoff.
    pub async fn with_retry<T, F, Fut>(
        &self,
        cancel: &CancellationToken,
        key: &str,
        mut op: F,
    ) -> Result<T>
    where
        F: FnMut() -> Fut,
        Fut: Future<Output = Result<T>>,
    {
        loop {
            if cancel.is_cancelled() {
                return Err(Error::Cancelled {
                    operation: format!("retry of {}", key),
                });
            }

            let attempt = self.record_attempt(key);
            let err = match op().await {
                Ok(value) => {
                    self.reset_attempts(key);
                    return Ok(value);
                }
                Err(e) => e,
            };

            if !self.is_retryable_error(&err) {
                debug!(key, attempt, error = %err, "Error is not retryable");
                return Err(err);
            }

            if attempt >= self.config.max_attempts {
                warn!(key, attempts = attempt, error = %err, "Retry attempts exhausted");
                return Err(Error::RetryExhausted {
                    key: key.to_string(),
                    attempts: attempt,
                    last_error: Box::new(err),
                });
            }

            let delay = self.get_next_delay(key);
            debug!(key, attempt, delay_ms = delay.as_millis() as u64, error = %err, "Retrying");

            tokio::select! {
                biased;
                _ = cancel.cancelled() => {
                    return Err(Error::Cancelled {
                        operation: format!("retry of {}", key),
                    });
                }
                _ = tokio::time::sleep(delay) => {}
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use assert_matches::assert_matches;
    use std::sync::atomic::{AtomicU32, Ordering};
    use std::sync::Arc;

    fn fast_config() -> RetryConfig {
        RetryConfig {
            max_attempts: 3,
            initial_delay: Duration::from_millis(1),
            max_delay: Duration::from_millis(10),
            jitter: 0.0,
            ..Default::default()
        }
    }

    fn transient() -> Error {
        Error::Internal("connection refused".into())
    }

    #[test]
    fn test_delay_monotonic_and_capped() {
        let manager = RetryManager::new(RetryConfig {
            jitter: 0.0,
            ..Default::default()
        });

        let mut previous = Duration::ZERO;
        for attempts in 1..=20 {
            let delay = manager.base_delay(attempts);
            assert!(delay >= previous);
            assert!(delay <= Duration::from_secs(300));
            previous = delay;
        }
        assert_eq!(manager.base_delay(1), Duration::from_secs(1));
        assert_eq!(manager.base_delay(3), Duration::from_secs(4));
        assert_eq!(manager.base_delay(1000), Duration::from_secs(300));
    }

    #[test]
    fn test_jitter_never_exceeds_max_delay() {
        let manager = RetryManager::new(RetryConfig {
            jitter: 0.5,
            ..Default::default()
        });
        for _ in 0..20 {
            manager.record_attempt("k");
        }
        for _ in 0..50 {
            assert!(manager.get_next_delay("k") <= Duration::from_secs(300));
        }

        manager.reset_attempts("k");
        manager.record_attempt("k");
        let delay = manager.get_next_delay("k");
        assert!(delay >= Duration::from_secs(1) && delay <= Duration::from_millis(1500));
    }

    #[test]
    fn test_should_retry_exhaustion() {
        let manager = RetryManager::new(fast_config());
        for _ in 0..3 {
            assert!(manager.should_retry("ns/a", &transient()));
            manager.record_attempt("ns/a");
        }
        assert!(!manager.should_retry("ns/a", &transient()));
        assert!(!manager.should_retry("ns/a", &Error::Internal("anything".into())));

        manager.reset_attempts("ns/a");
        assert_eq!(manager.get_attempt_count("ns/a"), 0);
        assert!(manager.should_retry("ns/a", &transient()));
    }

    #[test]
    fn test_classification() {
        let manager = RetryManager::new(RetryConfig::default());

        assert!(manager.is_retryable_error(&Error::Internal("something odd".into())));
        assert!(manager.is_retryable_error(&Error::Internal("Service Unavailable".into())));
        assert!(!manager.is_retryable_error(&Error::PermissionDenied {
            backend: "ceph".into(),
            schema: String::new(),
            message: "forbidden".into(),
        }));
        assert!(!manager.is_retryable_error(&Error::InvalidTransition {
            from: "replica".into(),
            to: "source".into(),
        }));
        assert!(!manager.is_retryable_error(&Error::Cancelled {
            operation: "x".into()
        }));
    }

    #[tokio::test]
    async fn test_with_retry_succeeds_after_failures() {
        let manager = RetryManager::new(fast_config());
        let calls = Arc::new(AtomicU32::new(0));

        let counter = calls.clone();
        let value = manager
            .with_retry(&CancellationToken::new(), "ns/db", move || {
                let counter = counter.clone();
                async move {
                    if counter.fetch_add(1, Ordering::SeqCst) < 2 {
                        Err(transient())
                    } else {
                        Ok(42)
                    }
                }
            })
            .await
            .unwrap();

        assert_eq!(value, 42);
        assert_eq!(calls.load(Ordering::SeqCst), 3);
        assert_eq!(manager.get_attempt_count("ns/db"), 0);
    }

    #[tokio::test]
    async fn test_with_retry_exhausted() {
        let manager = RetryManager::new(fast_config());
        let calls = AtomicU32::new(0);

        let err = manager
            .with_retry(&CancellationToken::new(), "ns/db", || {
                calls.fetch_add(1, Ordering::SeqCst);
                async { Err::<(), _>(transient()) }
            })
            .await
            .unwrap_err();

        assert_matches!(err, Error::RetryExhausted { attempts: 3, .. });
        assert_eq!(calls.load(Ordering::SeqCst), 3);
        assert_eq!(manager.get_attempt_count("ns/db"), 3);
    }

    #[tokio::test]
    async fn test_with_retry_stops_on_terminal_error() {
        let manager = RetryManager::new(fast_config());
        let calls = AtomicU32::new(0);

        let err = manager
            .with_retry(&CancellationToken::new(), "ns/db", || {
                calls.fetch_add(1, Ordering::SeqCst);
                async { Err::<(), _>(Error::Internal("permission denied".into())) }
            })
            .await
            .unwrap_err();

        assert_matches!(err, Error::Internal(_));
        assert_eq!(calls.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn test_with_retry_cancelled_during_backoff() {
        let manager = RetryManager::new(RetryConfig {
            initial_delay: Duration::from_secs(30),
            jitter: 0.0,
            ..Default::default()
        });
        let cancel = CancellationToken::new();
        let calls = AtomicU32::new(0);

        let trigger = cancel.clone();
        tokio::spawn(async move {
            tokio::time::sleep(Duration::from_millis(20)).await;
            trigger.cancel();
        });

        let started = std::time::Instant::now();
        let err = manager
            .with_retry(&cancel, "ns/db", || {
                calls.fetch_add(1, Ordering::SeqCst);
                async { Err::<(), _>(transient()) }
            })
            .await
            .unwrap_err();

        assert!(err.is_cancelled());
        assert_eq!(calls.load(Ordering::SeqCst), 1);
        assert!(started.elapsed() < Duration::from_secs(5));
    }
}
