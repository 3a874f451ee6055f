//! Workload provider.
//!
//! Typed access to the Kubernetes objects a managed node is made of:
//! Deployments, StatefulSets, their Pods and the TLS Secret. The controller
//! only talks to Kubernetes workloads through `WorkloadApi`, so the restart
//! orchestrator can be driven against an in-memory cluster in tests.

use std::collections::BTreeMap;

use async_trait::async_trait;
use k8s_openapi::api::apps::v1::{Deployment, StatefulSet};
use k8s_openapi::api::core::v1::{Pod, Secret};
use kube::Client;
use kube::api::{Api, DeleteParams, ListParams, PostParams};
use thiserror::Error;
use tracing::debug;

/// Errors returned by the workload provider.
#[derive(Error, Debug)]
pub enum WorkloadError {
    #[error("Kubernetes API error: {0}")]
    Kube(#[from] kube::Error),

    #[error("Object has no name")]
    Unnamed,

    #[error("Workload request rejected: {0}")]
    Rejected(String),
}

/// Access to the workloads of one namespace.
#[async_trait]
pub trait WorkloadApi: Send + Sync {
    async fn get_deployment(&self, name: &str) -> Result<Option<Deployment>, WorkloadError>;
    async fn create_deployment(&self, deployment: &Deployment) -> Result<Deployment, WorkloadError>;
    async fn replace_deployment(&self, deployment: &Deployment)
    -> Result<Deployment, WorkloadError>;
    async fn delete_deployment(&self, name: &str) -> Result<(), WorkloadError>;

    async fn get_statefulset(&self, name: &str) -> Result<Option<StatefulSet>, WorkloadError>;
    async fn create_statefulset(&self, sts: &StatefulSet) -> Result<StatefulSet, WorkloadError>;
    async fn replace_statefulset(&self, sts: &StatefulSet) -> Result<StatefulSet, WorkloadError>;
    async fn delete_statefulset(&self, name: &str) -> Result<(), WorkloadError>;

    /// Pods whose labels include every entry of `selector`.
    async fn list_pods(&self, selector: &BTreeMap<String, String>)
    -> Result<Vec<Pod>, WorkloadError>;

    async fn get_secret(&self, name: &str) -> Result<Option<Secret>, WorkloadError>;
}

/// `WorkloadApi` backed by the Kubernetes API server.
#[derive(Clone)]
pub struct KubeWorkloadApi {
    deployments: Api<Deployment>,
    statefulsets: Api<StatefulSet>,
    pods: Api<Pod>,
    secrets: Api<Secret>,
}

impl KubeWorkloadApi {
    pub fn new(client: Client, namespace: &str) -> Self {
        Self {
            deployments: Api::namespaced(client.clone(), namespace),
            statefulsets: Api::namespaced(client.clone(), namespace),
            pods: Api::namespaced(client.clone(), namespace),
            secrets: Api::namespaced(client, namespace),
        }
    }
}

/// Render a label map as a Kubernetes label selector string.
pub fn selector_string(selector: &BTreeMap<String, String>) -> String {
    selector
        .iter()
        .map(|(k, v)| format!("{}={}", k, v))
        .collect::<Vec<_>>()
        .join(",")
}

fn object_name(name: &Option<String>) -> Result<&str, WorkloadError> {
    name.as_deref().ok_or(WorkloadError::Unnamed)
}

// Deleting an object that is already gone is not an error
fn ignore_not_found<T>(result: Result<T, kube::Error>) -> Result<(), WorkloadError> {
    match result {
        Ok(_) => Ok(()),
        Err(kube::Error::Api(e)) if e.code == 404 => Ok(()),
        Err(e) => Err(e.into()),
    }
}

#[async_trait]
impl WorkloadApi for KubeWorkloadApi {
    async fn get_deployment(&self, name: &str) -> Result<Option<Deployment>, WorkloadError> {
        Ok(self.deployments.get_opt(name).await?)
    }

    async fn create_deployment(&self, deployment: &Deployment) -> Result<Deployment, WorkloadError> {
        debug!(name = ?deployment.metadata.name, "Creating deployment");
        Ok(self
            .deployments
            .create(&PostParams::default(), deployment)
            .await?)
    }

    async fn replace_deployment(
        &self,
        deployment: &Deployment,
    ) -> Result<Deployment, WorkloadError> {
        let name = object_name(&deployment.metadata.name)?;
        Ok(self
            .deployments
            .replace(name, &PostParams::default(), deployment)
            .await?)
    }

    async fn delete_deployment(&self, name: &str) -> Result<(), WorkloadError> {
        debug!(name = %name, "Deleting deployment");
        ignore_not_found(self.deployments.delete(name, &DeleteParams::default()).await)
    }

    async fn get_statefulset(&self, name: &str) -> Result<Option<StatefulSet>, WorkloadError> {
        Ok(self.statefulsets.get_opt(name).await?)
    }

    async fn create_statefulset(&self, sts: &StatefulSet) -> Result<StatefulSet, WorkloadError> {
        debug!(name = ?sts.metadata.name, "Creating statefulset");
        Ok(self.statefulsets.create(&PostParams::default(), sts).await?)
    }

    async fn replace_statefulset(&self, sts: &StatefulSet) -> Result<StatefulSet, WorkloadError> {
        let name = object_name(&sts.metadata.name)?;
        Ok(self
            .statefulsets
            .replace(name, &PostParams::default(), sts)
            .await?)
    }

    async fn delete_statefulset(&self, name: &str) -> Result<(), WorkloadError> {
        debug!(name = %name, "Deleting statefulset");
        ignore_not_found(self.statefulsets.delete(name, &DeleteParams::default()).await)
    }

    async fn list_pods(
        &self,
        selector: &BTreeMap<String, String>,
    ) -> Result<Vec<Pod>, WorkloadError> {
        let params = ListParams::default().labels(&selector_string(selector));
        Ok(self.pods.list(&params).await?.items)
    }

    async fn get_secret(&self, name: &str) -> Result<Option<Secret>, WorkloadError> {
        Ok(self.secrets.get_opt(name).await?)
    }
}
