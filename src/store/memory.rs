//! In-Memory Resource Store
//!
//! Implements both store ports without a cluster. Used by standalone mode
//! (seeded from a YAML fixture) and by tests, which can inject permission
//! errors, transient failures and latency per schema.

use crate::crd::{UnifiedVolumeReplication, UnifiedVolumeReplicationStatus};
use crate::discovery::types::schema_requirements;
use crate::domain::ports::{Backend, ReplicationStore, ResourceStore, SchemaInfo};
use crate::error::{Error, Result};
use crate::store::matches_selector;
use async_trait::async_trait;
use parking_lot::{Mutex, RwLock};
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, HashMap};
use std::path::Path;
use std::time::Duration;
use tracing::{debug, info};

// =============================================================================
// Fixtures
// =============================================================================

/// Seed data for a standalone store
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct StoreFixture {
    #[serde(default)]
    pub schemas: Vec<SchemaInfo>,
    #[serde(default)]
    pub deployments: Vec<DeploymentFixture>,
    #[serde(default)]
    pub replications: Vec<UnifiedVolumeReplication>,
}

/// Controller deployment readiness
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct DeploymentFixture {
    pub namespace: String,
    pub name: String,
    #[serde(default)]
    pub ready: bool,
}

#[derive(Debug, Clone, Copy)]
enum Fault {
    Deny,
    Fail { remaining: u32 },
}

type ObjectKey = (String, String);

// =============================================================================
// Memory Store
// =============================================================================

/// Resource store backed by in-process maps
#[derive(Default)]
pub struct MemoryResourceStore {
    schemas: RwLock<BTreeMap<String, SchemaInfo>>,
    deployments: RwLock<BTreeMap<ObjectKey, bool>>,
    replications: RwLock<BTreeMap<ObjectKey, UnifiedVolumeReplication>>,
    faults: Mutex<HashMap<String, Fault>>,
    lookups: Mutex<HashMap<String, usize>>,
    latency: Mutex<Option<Duration>>,
}

impl MemoryResourceStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Build a store from fixture data
    pub fn from_fixture(fixture: StoreFixture) -> Self {
        let store = Self::new();
        for schema in fixture.schemas {
            store.add_schema(schema);
        }
        for deployment in fixture.deployments {
            store.set_deployment_ready(&deployment.namespace, &deployment.name, deployment.ready);
        }
        for resource in fixture.replications {
            store.insert_replication(resource);
        }
        store
    }

    /// Load a YAML fixture file
    pub fn from_yaml_file(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();
        let contents = std::fs::read_to_string(path)?;
        let fixture: StoreFixture = serde_yaml::from_str(&contents)?;
        info!(
            path = %path.display(),
            schemas = fixture.schemas.len(),
            replications = fixture.replications.len(),
            "Loaded store fixture"
        );
        Ok(Self::from_fixture(fixture))
    }

    // =========================================================================
    // Seeding
    // =========================================================================

    pub fn add_schema(&self, schema: SchemaInfo) {
        self.schemas.write().insert(schema.name.clone(), schema);
    }

    /// Add one of a backend's declared schemas by name
    pub fn add_schema_for(&self, backend: Backend, name: &str, established: bool) {
        let info = schema_requirements(backend)
            .iter()
            .find(|req| req.name == name)
            .map(|req| SchemaInfo {
                name: req.name.to_string(),
                group: req.group.to_string(),
                version: req.version.to_string(),
                kind: req.kind.to_string(),
                established,
            })
            .unwrap_or_else(|| SchemaInfo {
                name: name.to_string(),
                group: String::new(),
                version: String::new(),
                kind: String::new(),
                established,
            });
        self.add_schema(info);
    }

    /// Establish every schema a backend declares
    pub fn install_backend(&self, backend: Backend) {
        for req in schema_requirements(backend) {
            self.add_schema_for(backend, req.name, true);
        }
    }

    pub fn set_established(&self, name: &str, established: bool) {
        if let Some(schema) = self.schemas.write().get_mut(name) {
            schema.established = established;
        }
    }

    pub fn remove_schema(&self, name: &str) {
        self.schemas.write().remove(name);
    }

    pub fn set_deployment_ready(&self, namespace: &str, name: &str, ready: bool) {
        self.deployments
            .write()
            .insert((namespace.to_string(), name.to_string()), ready);
    }

    pub fn insert_replication(&self, resource: UnifiedVolumeReplication) {
        let key = (resource.namespace().to_string(), resource.name().to_string());
        self.replications.write().insert(key, resource);
    }

    /// Current copy of a stored resource
    pub fn replication(&self, namespace: &str, name: &str) -> Option<UnifiedVolumeReplication> {
        self.replications
            .read()
            .get(&(namespace.to_string(), name.to_string()))
            .cloned()
    }

    // =========================================================================
    // Fault Injection
    // =========================================================================

    /// Answer every lookup of `name` with a permission error
    pub fn deny_schema(&self, name: &str) {
        self.faults.lock().insert(name.to_string(), Fault::Deny);
    }

    /// Fail the next `times` lookups of `name` with a transient error
    pub fn fail_schema(&self, name: &str, times: u32) {
        self.faults
            .lock()
            .insert(name.to_string(), Fault::Fail { remaining: times });
    }

    pub fn clear_faults(&self) {
        self.faults.lock().clear();
    }

    /// Delay every schema lookup
    pub fn set_latency(&self, latency: Duration) {
        *self.latency.lock() = Some(latency);
    }

    /// Number of lookups made for a schema
    pub fn schema_lookups(&self, name: &str) -> usize {
        self.lookups.lock().get(name).copied().unwrap_or(0)
    }

    async fn before_lookup(&self, name: &str) -> Result<()> {
        *self.lookups.lock().entry(name.to_string()).or_insert(0) += 1;

        let latency = *self.latency.lock();
        if let Some(latency) = latency {
            tokio::time::sleep(latency).await;
        }

        let mut faults = self.faults.lock();
        match faults.get_mut(name) {
            Some(Fault::Deny) => Err(Error::PermissionDenied {
                backend: String::new(),
                schema: name.to_string(),
                message: "customresourcedefinitions is forbidden".into(),
            }),
            Some(Fault::Fail { remaining }) if *remaining > 0 => {
                *remaining -= 1;
                Err(Error::DiscoveryFailed {
                    backend: String::new(),
                    schema: name.to_string(),
                    message: "connection refused".into(),
                })
            }
            _ => Ok(()),
        }
    }
}

#[async_trait]
impl ResourceStore for MemoryResourceStore {
    async fn schema_established(&self, name: &str) -> Result<bool> {
        self.before_lookup(name).await?;
        Ok(self
            .schemas
            .read()
            .get(name)
            .map(|s| s.established)
            .unwrap_or(false))
    }

    async fn schema_info(&self, name: &str) -> Result<SchemaInfo> {
        self.before_lookup(name).await?;
        self.schemas
            .read()
            .get(name)
            .cloned()
            .ok_or_else(|| Error::SchemaNotFound {
                backend: String::new(),
                schema: name.to_string(),
            })
    }

    async fn list_schemas(&self, group_filter: Option<&str>) -> Result<Vec<SchemaInfo>> {
        Ok(self
            .schemas
            .read()
            .values()
            .filter(|s| group_filter.map(|g| s.group == g).unwrap_or(true))
            .cloned()
            .collect())
    }

    async fn deployment_ready(&self, namespace: &str, name: &str) -> Result<bool> {
        Ok(self
            .deployments
            .read()
            .get(&(namespace.to_string(), name.to_string()))
            .copied()
            .unwrap_or(false))
    }
}

#[async_trait]
impl ReplicationStore for MemoryResourceStore {
    async fn get(&self, namespace: &str, name: &str) -> Result<Option<UnifiedVolumeReplication>> {
        Ok(self.replication(namespace, name))
    }

    async fn list(&self, label_selector: Option<&str>) -> Result<Vec<UnifiedVolumeReplication>> {
        Ok(self
            .replications
            .read()
            .values()
            .filter(|r| {
                label_selector
                    .map(|sel| matches_selector(r.metadata.labels.as_ref(), sel))
                    .unwrap_or(true)
            })
            .cloned()
            .collect())
    }

    async fn update_status(
        &self,
        namespace: &str,
        name: &str,
        status: UnifiedVolumeReplicationStatus,
    ) -> Result<()> {
        let mut replications = self.replications.write();
        let resource = replications
            .get_mut(&(namespace.to_string(), name.to_string()))
            .ok_or_else(|| Error::ResourceNotFound {
                kind: "UnifiedVolumeReplication".into(),
                name: format!("{}/{}", namespace, name),
            })?;

        debug!(namespace, name, phase = %status.phase, "Updated replication status");
        resource.status = Some(status);
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::crd::{ReplicationState, UnifiedVolumeReplicationSpec};
    use std::io::Write;

    fn replication(name: &str, labels: &[(&str, &str)]) -> UnifiedVolumeReplication {
        let mut resource = UnifiedVolumeReplication::new(
            name,
            UnifiedVolumeReplicationSpec {
                source_endpoint: Default::default(),
                destination_endpoint: Default::default(),
                volume_mapping: Default::default(),
                replication_state: ReplicationState::Replica,
                replication_mode: Default::default(),
                schedule: Default::default(),
                extensions: None,
            },
        );
        resource.metadata.namespace = Some("prod".into());
        resource.metadata.labels = Some(
            labels
                .iter()
                .map(|(k, v)| (k.to_string(), v.to_string()))
                .collect(),
        );
        resource
    }

    #[tokio::test]
    async fn test_schema_lookup() {
        let store = MemoryResourceStore::new();
        store.install_backend(Backend::Trident);

        assert!(store
            .schema_established("tridentmirrorrelationships.trident.netapp.io")
            .await
            .unwrap());
        assert!(!store.schema_established("missing.example.io").await.unwrap());

        let info = store
            .schema_info("tridentbackendconfigs.trident.netapp.io")
            .await
            .unwrap();
        assert_eq!(info.kind, "TridentBackendConfig");

        let listed = store.list_schemas(Some("trident.netapp.io")).await.unwrap();
        assert_eq!(listed.len(), 3);
        assert!(store.list_schemas(Some("other.io")).await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_fail_schema_recovers() {
        let store = MemoryResourceStore::new();
        store.install_backend(Backend::PowerStore);
        let name = "dellcsireplicationgroups.replication.storage.dell.com";
        store.fail_schema(name, 1);

        assert!(store.schema_established(name).await.is_err());
        assert!(store.schema_established(name).await.unwrap());
        assert_eq!(store.schema_lookups(name), 2);
    }

    #[tokio::test]
    async fn test_list_by_label_selector() {
        let store = MemoryResourceStore::new();
        store.insert_replication(replication("db", &[("app", "db"), ("tier", "gold")]));
        store.insert_replication(replication("web", &[("app", "web")]));

        assert_eq!(store.list(None).await.unwrap().len(), 2);
        let gold = store.list(Some("app=db,tier=gold")).await.unwrap();
        assert_eq!(gold.len(), 1);
        assert_eq!(gold[0].name(), "db");
        assert_eq!(store.list(Some("app!=db")).await.unwrap().len(), 1);
    }

    #[tokio::test]
    async fn test_update_status_missing_resource() {
        let store = MemoryResourceStore::new();
        let err = store
            .update_status("prod", "ghost", UnifiedVolumeReplicationStatus::default())
            .await
            .unwrap_err();
        assert!(matches!(err, Error::ResourceNotFound { .. }));
    }

    #[tokio::test]
    async fn test_load_yaml_fixture() {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        writeln!(
            file,
            r#"
schemas:
  - name: dellcsireplicationgroups.replication.storage.dell.com
    group: replication.storage.dell.com
    version: v1
    kind: DellCSIReplicationGroup
    established: true
deployments:
  - namespace: dell-replication-controller
    name: dell-replication-controller-manager
    ready: true
replications:
  - apiVersion: replication.unified.io/v1alpha1
    kind: UnifiedVolumeReplication
    metadata:
      name: orders
      namespace: prod
    spec:
      replicationState: source
"#
        )
        .unwrap();

        let store = MemoryResourceStore::from_yaml_file(file.path()).unwrap();
        assert!(store
            .schema_established("dellcsireplicationgroups.replication.storage.dell.com")
            .await
            .unwrap());
        assert!(store
            .deployment_ready("dell-replication-controller", "dell-replication-controller-manager")
            .await
            .unwrap());
        let orders = store.get("prod", "orders").await.unwrap().unwrap();
        assert_eq!(orders.spec.replication_state, ReplicationState::Source);
    }
}
