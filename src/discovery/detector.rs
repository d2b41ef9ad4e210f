//! Backend Detector
//!
//! Checks whether a backend's schema declarations exist and are
//! established, grading the backend Available, Partial or Unavailable.

use crate::discovery::types::{
    schema_requirements, BackendDiscoveryResult, ControllerRef, DiscoveryStatus,
    SchemaAvailability, SchemaRequirement,
};
use crate::domain::ports::{Backend, ResourceStoreRef};
use crate::error::{DiscoveryErrorKind, Error, Result};
use chrono::Utc;
use tracing::{debug, warn};

/// Detector for a single backend
#[derive(Clone)]
pub struct BackendDetector {
    backend: Backend,
    store: ResourceStoreRef,
    requirements: &'static [SchemaRequirement],
    controller: Option<ControllerRef>,
}

impl std::fmt::Debug for BackendDetector {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("BackendDetector")
            .field("backend", &self.backend)
            .field("controller", &self.controller)
            .finish()
    }
}

impl BackendDetector {
    /// Create a detector using the backend's schema table and default controller
    pub fn new(backend: Backend, store: ResourceStoreRef) -> Self {
        Self {
            backend,
            store,
            requirements: schema_requirements(backend),
            controller: Some(ControllerRef::default_for(backend)),
        }
    }

    /// Override (or disable) the controller deployment check
    pub fn with_controller(mut self, controller: Option<ControllerRef>) -> Self {
        self.controller = controller;
        self
    }

    pub fn backend(&self) -> Backend {
        self.backend
    }

    pub fn requirements(&self) -> &'static [SchemaRequirement] {
        self.requirements
    }

    /// Check every declared schema and grade the backend
    ///
    /// A schema that does not exist counts as unavailable. Lookups that
    /// cannot be answered abort detection with a classified error.
    pub async fn detect(&self) -> Result<BackendDiscoveryResult> {
        let mut schemas = Vec::with_capacity(self.requirements.len());
        let mut required_total = 0usize;
        let mut required_present = 0usize;

        for req in self.requirements {
            let available = match self.store.schema_established(req.name).await {
                Ok(established) => established,
                Err(e) if e.discovery_kind() == DiscoveryErrorKind::SchemaNotFound => false,
                Err(e) => return Err(e.with_discovery_context(self.backend.as_str(), req.name)),
            };

            debug!(
                backend = %self.backend,
                schema = req.name,
                available,
                "Checked schema"
            );

            if req.required {
                required_total += 1;
                if available {
                    required_present += 1;
                }
            }

            schemas.push(SchemaAvailability {
                name: req.name.to_string(),
                group: req.group.to_string(),
                version: req.version.to_string(),
                kind: req.kind.to_string(),
                required: req.required,
                available,
            });
        }

        let status = DiscoveryStatus::from_counts(required_present, required_total);
        let message = match status {
            DiscoveryStatus::Available => {
                format!("all {} required schemas established", required_total)
            }
            _ => format!(
                "{}/{} required schemas established",
                required_present, required_total
            ),
        };

        Ok(BackendDiscoveryResult {
            backend: self.backend,
            status,
            schemas,
            message,
            last_updated: Utc::now(),
        })
    }

    /// Detect the backend and fail unless it is fully available
    ///
    /// When a controller is configured its deployment must also report a
    /// ready replica.
    pub async fn validate_backend(&self) -> Result<BackendDiscoveryResult> {
        let result = self.detect().await?;

        if result.status != DiscoveryStatus::Available {
            let schema = result
                .missing_required()
                .first()
                .map(|s| s.to_string())
                .unwrap_or_default();
            warn!(
                backend = %self.backend,
                status = %result.status,
                schema = %schema,
                "Backend validation failed"
            );
            return Err(Error::SchemaNotFound {
                backend: self.backend.to_string(),
                schema,
            });
        }

        if let Some(controller) = &self.controller {
            let ready = self
                .store
                .deployment_ready(&controller.namespace, &controller.name)
                .await
                .map_err(|e| e.with_discovery_context(self.backend.as_str(), ""))?;

            if !ready {
                return Err(Error::ControllerNotFound {
                    backend: self.backend.to_string(),
                    schema: String::new(),
                    message: format!(
                        "deployment {}/{} has no ready replicas",
                        controller.namespace, controller.name
                    ),
                });
            }
        }

        Ok(result)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::store::MemoryResourceStore;
    use assert_matches::assert_matches;
    use std::sync::Arc;

    const VR: &str = "volumereplications.replication.storage.openshift.io";
    const VRC: &str = "volumereplicationclasses.replication.storage.openshift.io";

    #[tokio::test]
    async fn test_detect_available() {
        let store = Arc::new(MemoryResourceStore::new());
        store.install_backend(Backend::Ceph);

        let detector = BackendDetector::new(Backend::Ceph, store);
        let result = detector.detect().await.unwrap();

        assert_eq!(result.status, DiscoveryStatus::Available);
        assert_eq!(result.schemas.len(), 3);
        assert!(result.missing_required().is_empty());
    }

    #[tokio::test]
    async fn test_detect_partial() {
        let store = Arc::new(MemoryResourceStore::new());
        store.add_schema_for(Backend::Ceph, VR, true);

        let detector = BackendDetector::new(Backend::Ceph, store);
        let result = detector.detect().await.unwrap();

        assert_eq!(result.status, DiscoveryStatus::Partial);
        assert_eq!(result.missing_required(), vec![VRC]);
    }

    #[tokio::test]
    async fn test_detect_unavailable_when_not_established() {
        let store = Arc::new(MemoryResourceStore::new());
        store.add_schema_for(Backend::Ceph, VR, false);
        store.add_schema_for(Backend::Ceph, VRC, false);

        let detector = BackendDetector::new(Backend::Ceph, store);
        let result = detector.detect().await.unwrap();

        assert_eq!(result.status, DiscoveryStatus::Unavailable);
    }

    #[tokio::test]
    async fn test_detect_permission_denied_propagates() {
        let store = Arc::new(MemoryResourceStore::new());
        store.deny_schema(VR);

        let detector = BackendDetector::new(Backend::Ceph, store);
        let err = detector.detect().await.unwrap_err();

        assert_matches!(err, Error::PermissionDenied { ref backend, ref schema, .. }
            if backend == "ceph" && schema == VR);
    }

    #[tokio::test]
    async fn test_validate_backend_requires_controller() {
        let store = Arc::new(MemoryResourceStore::new());
        store.install_backend(Backend::PowerStore);

        let detector = BackendDetector::new(Backend::PowerStore, store.clone());
        let err = detector.validate_backend().await.unwrap_err();
        assert_matches!(err, Error::ControllerNotFound { .. });

        let controller = ControllerRef::default_for(Backend::PowerStore);
        store.set_deployment_ready(&controller.namespace, &controller.name, true);
        assert!(detector.validate_backend().await.is_ok());
    }

    #[tokio::test]
    async fn test_validate_backend_not_available() {
        let store = Arc::new(MemoryResourceStore::new());
        let detector = BackendDetector::new(Backend::Trident, store).with_controller(None);

        let err = detector.validate_backend().await.unwrap_err();
        assert_matches!(err, Error::SchemaNotFound { ref schema, .. }
            if schema == "tridentmirrorrelationships.trident.netapp.io");
    }
}
