//! Kubernetes Resource Store
//!
//! Answers schema lookups from CustomResourceDefinitions, controller
//! readiness from Deployments, and reads/writes UnifiedVolumeReplication
//! resources.

use crate::crd::{UnifiedVolumeReplication, UnifiedVolumeReplicationStatus};
use crate::domain::ports::{ReplicationStore, ResourceStore, SchemaInfo};
use crate::error::{Error, Result};
use async_trait::async_trait;
use k8s_openapi::api::apps::v1::Deployment;
use k8s_openapi::apiextensions_apiserver::pkg::apis::apiextensions::v1::CustomResourceDefinition;
use kube::api::{ListParams, Patch, PatchParams};
use kube::{Api, Client};
use tracing::{debug, instrument};

/// Field manager used for status patches
const FIELD_MANAGER: &str = "unified-replication-operator";

/// Resource store backed by the Kubernetes API server
#[derive(Clone)]
pub struct KubeResourceStore {
    client: Client,
}

impl KubeResourceStore {
    pub fn new(client: Client) -> Self {
        Self { client }
    }

    /// Connect using the ambient kubeconfig or in-cluster configuration
    pub async fn try_default() -> Result<Self> {
        let client = Client::try_default().await?;
        Ok(Self::new(client))
    }

    fn crds(&self) -> Api<CustomResourceDefinition> {
        Api::all(self.client.clone())
    }

    fn replications(&self, namespace: &str) -> Api<UnifiedVolumeReplication> {
        Api::namespaced(self.client.clone(), namespace)
    }

    fn to_schema_info(crd: &CustomResourceDefinition) -> SchemaInfo {
        let version = crd
            .spec
            .versions
            .iter()
            .find(|v| v.storage)
            .or_else(|| crd.spec.versions.first())
            .map(|v| v.name.clone())
            .unwrap_or_default();

        SchemaInfo {
            name: crd.metadata.name.clone().unwrap_or_default(),
            group: crd.spec.group.clone(),
            version,
            kind: crd.spec.names.kind.clone(),
            established: is_established(crd),
        }
    }
}

/// A CRD is usable once its `Established` condition is `True`
fn is_established(crd: &CustomResourceDefinition) -> bool {
    crd.status
        .as_ref()
        .and_then(|s| s.conditions.as_ref())
        .map(|conditions| {
            conditions
                .iter()
                .any(|c| c.type_ == "Established" && c.status == "True")
        })
        .unwrap_or(false)
}

#[async_trait]
impl ResourceStore for KubeResourceStore {
    #[instrument(skip(self))]
    async fn schema_established(&self, name: &str) -> Result<bool> {
        match self.crds().get_opt(name).await? {
            Some(crd) => Ok(is_established(&crd)),
            None => {
                debug!(schema = name, "Schema not installed");
                Ok(false)
            }
        }
    }

    async fn schema_info(&self, name: &str) -> Result<SchemaInfo> {
        self.crds()
            .get_opt(name)
            .await?
            .map(|crd| Self::to_schema_info(&crd))
            .ok_or_else(|| Error::SchemaNotFound {
                backend: String::new(),
                schema: name.to_string(),
            })
    }

    async fn list_schemas(&self, group_filter: Option<&str>) -> Result<Vec<SchemaInfo>> {
        let crds = self.crds().list(&ListParams::default()).await?;
        Ok(crds
            .items
            .iter()
            .filter(|crd| group_filter.map(|g| crd.spec.group == g).unwrap_or(true))
            .map(Self::to_schema_info)
            .collect())
    }

    async fn deployment_ready(&self, namespace: &str, name: &str) -> Result<bool> {
        let deployments: Api<Deployment> = Api::namespaced(self.client.clone(), namespace);
        Ok(deployments
            .get_opt(name)
            .await?
            .and_then(|d| d.status)
            .and_then(|s| s.ready_replicas)
            .map(|ready| ready > 0)
            .unwrap_or(false))
    }
}

#[async_trait]
impl ReplicationStore for KubeResourceStore {
    async fn get(&self, namespace: &str, name: &str) -> Result<Option<UnifiedVolumeReplication>> {
        Ok(self.replications(namespace).get_opt(name).await?)
    }

    async fn list(&self, label_selector: Option<&str>) -> Result<Vec<UnifiedVolumeReplication>> {
        let api: Api<UnifiedVolumeReplication> = Api::all(self.client.clone());
        let mut params = ListParams::default();
        if let Some(selector) = label_selector {
            params = params.labels(selector);
        }
        Ok(api.list(&params).await?.items)
    }

    async fn update_status(
        &self,
        namespace: &str,
        name: &str,
        status: UnifiedVolumeReplicationStatus,
    ) -> Result<()> {
        let patch = serde_json::json!({ "status": status });
        self.replications(namespace)
            .patch_status(name, &PatchParams::apply(FIELD_MANAGER), &Patch::Merge(&patch))
            .await?;
        debug!(namespace, name, "Patched replication status");
        Ok(())
    }
}
