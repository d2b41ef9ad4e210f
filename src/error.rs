//! Error types for the Unified Replication Operator
//!
//! Provides structured error types for backend discovery, capability
//! management, the resilience layer and the replication state machine.

use std::time::Duration;
use thiserror::Error;

/// Unified error type for the operator
#[derive(Error, Debug)]
pub enum Error {
    // =========================================================================
    // Internal Errors
    // =========================================================================
    #[error("Internal error: {0}")]
    Internal(String),

    #[error("Configuration error: {0}")]
    Configuration(String),

    // =========================================================================
    // Kubernetes Errors
    // =========================================================================
    #[error("Kubernetes API error: {0}")]
    Kube(#[from] kube::Error),

    #[error("Resource not found: {kind}/{name}")]
    ResourceNotFound { kind: String, name: String },

    // =========================================================================
    // Discovery Errors
    // =========================================================================
    #[error("Schema {schema} not found for backend {backend}")]
    SchemaNotFound { backend: String, schema: String },

    #[error("Controller for backend {backend} not found: {message}")]
    ControllerNotFound {
        backend: String,
        schema: String,
        message: String,
    },

    #[error("Discovery of backend {backend} timed out after {timeout:?} (schema: {schema})")]
    DiscoveryTimeout {
        backend: String,
        schema: String,
        timeout: Duration,
    },

    #[error("Permission denied while checking schema {schema} for backend {backend}: {message}")]
    PermissionDenied {
        backend: String,
        schema: String,
        message: String,
    },

    #[error("Discovery failed for backend {backend} (schema: {schema}): {message}")]
    DiscoveryFailed {
        backend: String,
        schema: String,
        message: String,
    },

    // =========================================================================
    // Capability Errors
    // =========================================================================
    #[error("Backend {backend} does not support {capability} required by {field}")]
    CapabilityNotSupported {
        backend: String,
        capability: String,
        field: String,
    },

    #[error("Backend not registered: {backend}")]
    BackendNotRegistered { backend: String },

    #[error("No suitable backend: {reason}")]
    NoSuitableBackend { reason: String },

    #[error("Backend operation failed: {backend} - {operation}: {reason}")]
    BackendOperationFailed {
        backend: String,
        operation: String,
        reason: String,
    },

    // =========================================================================
    // Resilience Errors
    // =========================================================================
    #[error("circuit breaker is open: {name}")]
    CircuitOpen { name: String },

    #[error("max retry attempts ({attempts}) exceeded for {key}: {last_error}")]
    RetryExhausted {
        key: String,
        attempts: u32,
        last_error: Box<Error>,
    },

    #[error("Operation cancelled: {operation}")]
    Cancelled { operation: String },

    // =========================================================================
    // State Machine Errors
    // =========================================================================
    #[error("invalid transition from {from} to {to}")]
    InvalidTransition { from: String, to: String },

    // =========================================================================
    // Lifecycle Errors
    // =========================================================================
    #[error("{component} is already running")]
    AlreadyRunning { component: String },

    #[error("{component} has been stopped and cannot be restarted")]
    Stopped { component: String },

    // =========================================================================
    // Parse / IO Errors
    // =========================================================================
    #[error("JSON parse error: {0}")]
    JsonParse(#[from] serde_json::Error),

    #[error("YAML parse error: {0}")]
    Yaml(#[from] serde_yaml::Error),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

/// Classification of discovery failures
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum DiscoveryErrorKind {
    SchemaNotFound,
    ControllerNotFound,
    Timeout,
    PermissionDenied,
    Unknown,
}

impl std::fmt::Display for DiscoveryErrorKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            DiscoveryErrorKind::SchemaNotFound => write!(f, "SchemaNotFound"),
            DiscoveryErrorKind::ControllerNotFound => write!(f, "ControllerNotFound"),
            DiscoveryErrorKind::Timeout => write!(f, "Timeout"),
            DiscoveryErrorKind::PermissionDenied => write!(f, "PermissionDenied"),
            DiscoveryErrorKind::Unknown => write!(f, "Unknown"),
        }
    }
}

/// Action to take on error during reconciliation
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorAction {
    /// Requeue with exponential backoff
    RequeueWithBackoff,
    /// Requeue after specific duration
    RequeueAfter(Duration),
    /// Don't requeue, wait for changes
    NoRequeue,
}

impl Error {
    /// Build the error for a Kubernetes API failure hit while checking a schema
    pub fn from_schema_lookup(backend: &str, schema: &str, err: kube::Error) -> Self {
        match &err {
            kube::Error::Api(resp) if resp.code == 403 || resp.code == 401 => {
                Error::PermissionDenied {
                    backend: backend.to_string(),
                    schema: schema.to_string(),
                    message: resp.message.clone(),
                }
            }
            kube::Error::Api(resp) if resp.code == 404 => Error::SchemaNotFound {
                backend: backend.to_string(),
                schema: schema.to_string(),
            },
            _ => Error::DiscoveryFailed {
                backend: backend.to_string(),
                schema: schema.to_string(),
                message: err.to_string(),
            },
        }
    }

    /// Attach backend and schema context to an error raised by a store lookup
    pub fn with_discovery_context(self, backend: &str, schema: &str) -> Self {
        let backend = backend.to_string();
        let schema = schema.to_string();
        match self {
            Error::Kube(err) => Error::from_schema_lookup(&backend, &schema, err),
            Error::SchemaNotFound { .. } => Error::SchemaNotFound { backend, schema },
            Error::PermissionDenied { message, .. } => Error::PermissionDenied {
                backend,
                schema,
                message,
            },
            Error::DiscoveryTimeout { timeout, .. } => Error::DiscoveryTimeout {
                backend,
                schema,
                timeout,
            },
            Error::ControllerNotFound { message, .. } => Error::ControllerNotFound {
                backend,
                schema,
                message,
            },
            Error::DiscoveryFailed { message, .. } => Error::DiscoveryFailed {
                backend,
                schema,
                message,
            },
            err @ Error::Cancelled { .. } => err,
            other => Error::DiscoveryFailed {
                backend,
                schema,
                message: other.to_string(),
            },
        }
    }

    /// Classify this error for the discovery retry loop
    pub fn discovery_kind(&self) -> DiscoveryErrorKind {
        match self {
            Error::SchemaNotFound { .. } => DiscoveryErrorKind::SchemaNotFound,
            Error::ControllerNotFound { .. } => DiscoveryErrorKind::ControllerNotFound,
            Error::DiscoveryTimeout { .. } => DiscoveryErrorKind::Timeout,
            Error::PermissionDenied { .. } => DiscoveryErrorKind::PermissionDenied,
            Error::Kube(kube::Error::Api(resp)) if resp.code == 403 || resp.code == 401 => {
                DiscoveryErrorKind::PermissionDenied
            }
            Error::Kube(kube::Error::Api(resp)) if resp.code == 404 => {
                DiscoveryErrorKind::SchemaNotFound
            }
            _ => DiscoveryErrorKind::Unknown,
        }
    }

    /// Check if this error is a cancellation
    pub fn is_cancelled(&self) -> bool {
        matches!(self, Error::Cancelled { .. })
    }

    /// Determine what action to take for this error
    pub fn action(&self) -> ErrorAction {
        match self {
            // Transient errors - retry with backoff
            Error::Kube(_)
            | Error::DiscoveryTimeout { .. }
            | Error::DiscoveryFailed { .. }
            | Error::BackendOperationFailed { .. }
            | Error::RetryExhausted { .. } => ErrorAction::RequeueWithBackoff,

            // Breaker needs time to cool down before a trial call is allowed
            Error::CircuitOpen { .. } => ErrorAction::RequeueAfter(Duration::from_secs(60)),

            // Backend machinery may still be installing
            Error::SchemaNotFound { .. }
            | Error::ControllerNotFound { .. }
            | Error::BackendNotRegistered { .. }
            | Error::NoSuitableBackend { .. } => {
                ErrorAction::RequeueAfter(Duration::from_secs(120))
            }

            // Configuration/validation errors - don't retry automatically
            Error::Configuration(_)
            | Error::PermissionDenied { .. }
            | Error::CapabilityNotSupported { .. }
            | Error::InvalidTransition { .. }
            | Error::Cancelled { .. } => ErrorAction::NoRequeue,

            // All other errors - retry with backoff
            _ => ErrorAction::RequeueWithBackoff,
        }
    }

    /// Check if this error is retryable
    pub fn is_retryable(&self) -> bool {
        !matches!(self.action(), ErrorAction::NoRequeue)
    }
}

/// Result type alias for the operator
pub type Result<T> = std::result::Result<T, Error>;

#[cfg(test)]
mod tests {
    use super::*;

    fn api_error(code: u16) -> kube::Error {
        kube::Error::Api(kube::core::ErrorResponse {
            status: "Failure".into(),
            message: "denied".into(),
            reason: "Forbidden".into(),
            code,
        })
    }

    #[test]
    fn test_error_actions() {
        let err = Error::CircuitOpen {
            name: "ceph".into(),
        };
        assert_eq!(
            err.action(),
            ErrorAction::RequeueAfter(Duration::from_secs(60))
        );

        let err = Error::InvalidTransition {
            from: "Promoting".into(),
            to: "Demoting".into(),
        };
        assert_eq!(err.action(), ErrorAction::NoRequeue);

        let err = Error::Configuration("bad config".into());
        assert_eq!(err.action(), ErrorAction::NoRequeue);
    }

    #[test]
    fn test_error_retryable() {
        let transient = Error::DiscoveryTimeout {
            backend: "ceph".into(),
            schema: String::new(),
            timeout: Duration::from_secs(1),
        };
        assert!(transient.is_retryable());

        let denied = Error::PermissionDenied {
            backend: "trident".into(),
            schema: "tridentmirrorrelationships.trident.netapp.io".into(),
            message: "forbidden".into(),
        };
        assert!(!denied.is_retryable());
    }

    #[test]
    fn test_schema_lookup_classification() {
        let err = Error::from_schema_lookup("ceph", "volumereplications", api_error(403));
        assert_eq!(err.discovery_kind(), DiscoveryErrorKind::PermissionDenied);

        let err = Error::from_schema_lookup("ceph", "volumereplications", api_error(404));
        assert_eq!(err.discovery_kind(), DiscoveryErrorKind::SchemaNotFound);

        let err = Error::from_schema_lookup("ceph", "volumereplications", api_error(500));
        assert_eq!(err.discovery_kind(), DiscoveryErrorKind::Unknown);

        assert_eq!(
            Error::Kube(api_error(401)).discovery_kind(),
            DiscoveryErrorKind::PermissionDenied
        );
    }

    #[test]
    fn test_invalid_transition_message() {
        let err = Error::InvalidTransition {
            from: "Replica".into(),
            to: "Source".into(),
        };
        assert_eq!(err.to_string(), "invalid transition from Replica to Source");
    }
}
