//! Managed nodes.
//!
//! A managed node is one entry of a cluster's node registry: either a
//! single-replica Deployment (`ScalableNode`) or an ordered StatefulSet
//! (`ReplicatedNode`). Both shapes expose the same lifecycle through
//! `NodeOperations`, so topology reconciliation and restart campaigns never
//! look at the workload kind.

use std::collections::BTreeMap;

use async_trait::async_trait;
use k8s_openapi::api::core::v1::Pod;
use tracing::debug;

use crate::client::{ClusterHealthGateway, WorkloadApi};
use crate::controller::error::{Error, Result};
use crate::controller::polling::{PollSettings, poll_until};
use crate::controller::replicated_node::ReplicatedNode;
use crate::controller::scalable_node::ScalableNode;
use crate::crd::{ConditionStatus, NodeRole, NodeStatus, NodeUpgradeStatus};
use crate::resources::common::TEMPLATE_HASH_ANNOTATION;

/// Collaborators a node needs to act on the world.
#[derive(Clone, Copy)]
pub struct NodeEnv<'a> {
    pub workloads: &'a dyn WorkloadApi,
    pub gateway: &'a dyn ClusterHealthGateway,
    pub polling: PollSettings,
}

/// Change-detection hashes of a node.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct NodeHashes {
    /// Hash of the desired pod template.
    pub template_hash: String,
    /// Hash of the desired node configuration.
    pub config_hash: String,
    /// TLS secret hash the running pods started with. Remembered across reconciles.
    pub secret_hash: Option<String>,
    /// TLS secret hash as of this reconcile.
    pub current_secret_hash: Option<String>,
}

impl NodeHashes {
    /// Whether the TLS secret changed since the pods started.
    pub fn secret_changed(&self) -> bool {
        match (&self.secret_hash, &self.current_secret_hash) {
            (Some(running), Some(current)) => running != current,
            _ => false,
        }
    }

    /// Whether the live template or configuration differs from the desired one.
    pub fn template_changed(
        &self,
        live_template_hash: Option<&str>,
        live_config_hash: Option<&str>,
    ) -> bool {
        live_template_hash != Some(self.template_hash.as_str())
            || live_config_hash != Some(self.config_hash.as_str())
    }

    /// Scheduling flags for these hashes.
    pub fn scheduled_status(&self, template_changed: bool) -> NodeUpgradeStatus {
        NodeUpgradeStatus {
            scheduled_for_upgrade: ConditionStatus::from_bool(template_changed),
            scheduled_for_cert_redeploy: ConditionStatus::from_bool(self.secret_changed()),
            ..Default::default()
        }
    }
}

/// Lifecycle operations every managed node supports.
#[async_trait]
pub trait NodeOperations: Send + Sync {
    /// Workload name.
    fn name(&self) -> &str;

    /// Elasticsearch node names of this node's members.
    fn cluster_node_names(&self) -> Vec<String>;

    /// Ensure the workload exists. Idempotent; also loads the remembered
    /// secret hash from the live workload.
    async fn create(&mut self, env: &NodeEnv<'_>) -> Result<()>;

    /// Delete the workload.
    async fn delete(&self, env: &NodeEnv<'_>) -> Result<()>;

    /// Whether the workload is absent.
    async fn is_missing(&self, env: &NodeEnv<'_>) -> Result<bool>;

    /// Scale to the desired replica count.
    async fn scale_up(&self, env: &NodeEnv<'_>) -> Result<()>;

    /// Scale to zero replicas.
    async fn scale_down(&self, env: &NodeEnv<'_>) -> Result<()>;

    /// Scheduling flags derived from live workload and hashes.
    async fn state(&self, env: &NodeEnv<'_>) -> Result<NodeUpgradeStatus>;

    /// Roll out the desired template in place, one pod at a time.
    async fn progress_node_changes(&self, env: &NodeEnv<'_>) -> Result<()>;

    /// Wait until every member is in the cluster.
    async fn wait_for_node_rejoin_cluster(&self, env: &NodeEnv<'_>) -> Result<()> {
        let names = self.cluster_node_names();
        let gateway = env.gateway;
        let operation = format!("{} to rejoin the cluster", self.name());
        poll_until(env.polling, &operation, || {
            let names = names.clone();
            async move { all_in_cluster(gateway, &names).await }
        })
        .await
    }

    /// Wait until no member is in the cluster.
    async fn wait_for_node_leave_cluster(&self, env: &NodeEnv<'_>) -> Result<()> {
        let names = self.cluster_node_names();
        let gateway = env.gateway;
        let operation = format!("{} to leave the cluster", self.name());
        poll_until(env.polling, &operation, || {
            let names = names.clone();
            async move { none_in_cluster(gateway, &names).await }
        })
        .await
    }

    /// Record the current secret hash as the one the pods run with.
    async fn refresh_hashes(&mut self, env: &NodeEnv<'_>) -> Result<()>;
}

async fn all_in_cluster(gateway: &dyn ClusterHealthGateway, names: &[String]) -> Result<bool> {
    for name in names {
        if !gateway.is_node_in_cluster(name).await? {
            return Ok(false);
        }
    }
    Ok(true)
}

async fn none_in_cluster(gateway: &dyn ClusterHealthGateway, names: &[String]) -> Result<bool> {
    for name in names {
        if gateway.is_node_in_cluster(name).await? {
            return Ok(false);
        }
    }
    Ok(true)
}

/// A node of the registry.
#[derive(Clone, Debug)]
pub enum ManagedNode {
    Scalable(ScalableNode),
    Replicated(ReplicatedNode),
}

impl ManagedNode {
    fn ops(&self) -> &dyn NodeOperations {
        match self {
            ManagedNode::Scalable(node) => node as &dyn NodeOperations,
            ManagedNode::Replicated(node) => node as &dyn NodeOperations,
        }
    }

    fn ops_mut(&mut self) -> &mut dyn NodeOperations {
        match self {
            ManagedNode::Scalable(node) => node as &mut dyn NodeOperations,
            ManagedNode::Replicated(node) => node as &mut dyn NodeOperations,
        }
    }

    pub fn roles(&self) -> &[NodeRole] {
        match self {
            ManagedNode::Scalable(node) => &node.roles,
            ManagedNode::Replicated(node) => &node.roles,
        }
    }

    pub fn gen_uuid(&self) -> &str {
        match self {
            ManagedNode::Scalable(node) => &node.gen_uuid,
            ManagedNode::Replicated(node) => &node.gen_uuid,
        }
    }

    pub fn hashes(&self) -> &NodeHashes {
        match self {
            ManagedNode::Scalable(node) => &node.hashes,
            ManagedNode::Replicated(node) => &node.hashes,
        }
    }

    fn hashes_mut(&mut self) -> &mut NodeHashes {
        match self {
            ManagedNode::Scalable(node) => &mut node.hashes,
            ManagedNode::Replicated(node) => &mut node.hashes,
        }
    }

    /// Number of master-eligible Elasticsearch nodes this node contributes.
    pub fn master_count(&self) -> i32 {
        if self.roles().contains(&NodeRole::Master) {
            self.desired_replicas()
        } else {
            0
        }
    }

    /// Number of data Elasticsearch nodes this node contributes.
    pub fn data_count(&self) -> i32 {
        if self.roles().contains(&NodeRole::Data) {
            self.desired_replicas()
        } else {
            0
        }
    }

    pub fn desired_replicas(&self) -> i32 {
        match self {
            ManagedNode::Scalable(_) => 1,
            ManagedNode::Replicated(node) => node.node_count,
        }
    }

    /// Replace the desired workload with `desired`, keeping the remembered
    /// secret hash.
    pub fn update_desired(&mut self, desired: ManagedNode) {
        let remembered = self.hashes().secret_hash.clone();
        *self = desired;
        if remembered.is_some() {
            self.hashes_mut().secret_hash = remembered;
        }
    }

    /// Elasticsearch nodes that reaching the desired size would remove.
    pub async fn excess_members(&self, env: &NodeEnv<'_>) -> Result<Vec<String>> {
        match self {
            ManagedNode::Scalable(_) => Ok(Vec::new()),
            ManagedNode::Replicated(node) => node.excess_members(env).await,
        }
    }

    /// Drop members above the desired size.
    pub async fn shrink(&self, env: &NodeEnv<'_>) -> Result<()> {
        match self {
            ManagedNode::Scalable(_) => Ok(()),
            ManagedNode::Replicated(node) => node.shrink(env).await,
        }
    }

    /// Status entry describing this node.
    pub fn status_entry(&self) -> NodeStatus {
        let mut entry = NodeStatus {
            roles: self.roles().to_vec(),
            gen_uuid: Some(self.gen_uuid().to_string()),
            ..Default::default()
        };
        match self {
            ManagedNode::Scalable(node) => entry.deployment_name = Some(node.name.clone()),
            ManagedNode::Replicated(node) => entry.stateful_set_name = Some(node.name.clone()),
        }
        entry
    }
}

#[async_trait]
impl NodeOperations for ManagedNode {
    fn name(&self) -> &str {
        self.ops().name()
    }

    fn cluster_node_names(&self) -> Vec<String> {
        self.ops().cluster_node_names()
    }

    async fn create(&mut self, env: &NodeEnv<'_>) -> Result<()> {
        self.ops_mut().create(env).await
    }

    async fn delete(&self, env: &NodeEnv<'_>) -> Result<()> {
        self.ops().delete(env).await
    }

    async fn is_missing(&self, env: &NodeEnv<'_>) -> Result<bool> {
        self.ops().is_missing(env).await
    }

    async fn scale_up(&self, env: &NodeEnv<'_>) -> Result<()> {
        self.ops().scale_up(env).await
    }

    async fn scale_down(&self, env: &NodeEnv<'_>) -> Result<()> {
        self.ops().scale_down(env).await
    }

    async fn state(&self, env: &NodeEnv<'_>) -> Result<NodeUpgradeStatus> {
        self.ops().state(env).await
    }

    async fn progress_node_changes(&self, env: &NodeEnv<'_>) -> Result<()> {
        self.ops().progress_node_changes(env).await
    }

    async fn wait_for_node_rejoin_cluster(&self, env: &NodeEnv<'_>) -> Result<()> {
        self.ops().wait_for_node_rejoin_cluster(env).await
    }

    async fn wait_for_node_leave_cluster(&self, env: &NodeEnv<'_>) -> Result<()> {
        self.ops().wait_for_node_leave_cluster(env).await
    }

    async fn refresh_hashes(&mut self, env: &NodeEnv<'_>) -> Result<()> {
        self.ops_mut().refresh_hashes(env).await
    }
}

// ============================================================================
// Pod helpers shared by both node shapes
// ============================================================================

/// Whether a pod has the `Ready` condition.
pub fn is_pod_ready(pod: &Pod) -> bool {
    pod.status
        .as_ref()
        .and_then(|s| s.conditions.as_ref())
        .is_some_and(|conditions| {
            conditions
                .iter()
                .any(|c| c.type_ == "Ready" && c.status == "True")
        })
}

/// Template hash a pod was created from.
pub fn pod_template_hash(pod: &Pod) -> Option<&str> {
    pod.metadata
        .annotations
        .as_ref()
        .and_then(|a| a.get(TEMPLATE_HASH_ANNOTATION))
        .map(String::as_str)
}

/// Whether a pod runs the template with `hash` and is ready.
pub fn pod_is_current(pod: &Pod, hash: &str) -> bool {
    pod_template_hash(pod) == Some(hash) && is_pod_ready(pod)
}

/// List pods matching `selector` and report whether `expected` of them are
/// current with `hash`.
pub async fn pods_current(
    workloads: &dyn WorkloadApi,
    selector: &BTreeMap<String, String>,
    hash: &str,
    expected: usize,
) -> Result<bool> {
    let pods = workloads.list_pods(selector).await?;
    let current = pods.iter().filter(|p| pod_is_current(p, hash)).count();
    debug!(current = current, expected = expected, total = pods.len(), "Checked pod rollout");
    Ok(current >= expected && pods.len() == current)
}

/// Set a workload-level annotation in an optional map.
pub fn set_annotation(
    annotations: &mut Option<BTreeMap<String, String>>,
    key: &str,
    value: &str,
) {
    annotations
        .get_or_insert_with(BTreeMap::new)
        .insert(key.to_string(), value.to_string());
}

/// Error for a workload that should exist but does not.
pub fn missing_workload(kind: &str, name: &str) -> Error {
    Error::Transient(format!("{} {} does not exist", kind, name))
}
