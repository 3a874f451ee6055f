//! Multi-replica nodes backed by a StatefulSet.
//!
//! Rollouts use the `RollingUpdate` partition: the partition is first raised
//! to the replica count so applying the new template restarts nothing, then
//! lowered one ordinal at a time. Each replica must carry the new template
//! hash and be back in the cluster before the next one is released. A
//! rollout interrupted by a timeout picks up at the partition it left.

use std::collections::BTreeMap;

use async_trait::async_trait;
use k8s_openapi::api::apps::v1::StatefulSet;
use kube::ResourceExt;
use tracing::{debug, info};

use crate::controller::error::{Error, Result};
use crate::controller::managed_node::{
    NodeEnv, NodeHashes, NodeOperations, missing_workload, pod_is_current, set_annotation,
};
use crate::controller::polling::poll_until;
use crate::crd::{Elasticsearch, ElasticsearchNode, NodeRole, NodeUpgradeStatus};
use crate::resources::common::{
    CONFIG_HASH_ANNOTATION, SECRET_HASH_ANNOTATION, TEMPLATE_HASH_ANNOTATION,
    node_selector_labels,
};
use crate::resources::pod_template::template_annotation;
use crate::resources::statefulset::{
    generate_statefulset, partition, pod_names, replicas, set_partition,
};

/// A node group running as one StatefulSet.
#[derive(Clone, Debug)]
pub struct ReplicatedNode {
    pub name: String,
    pub roles: Vec<NodeRole>,
    pub gen_uuid: String,
    pub node_count: i32,
    pub hashes: NodeHashes,
    desired: StatefulSet,
    selector: BTreeMap<String, String>,
}

impl ReplicatedNode {
    /// Build the desired node from its spec.
    pub fn new(
        resource: &Elasticsearch,
        spec: &ElasticsearchNode,
        gen_uuid: &str,
        name: &str,
        current_secret_hash: Option<String>,
    ) -> Result<Self> {
        let (desired, rendered) = generate_statefulset(resource, spec, name)?;
        Ok(Self {
            name: name.to_string(),
            roles: spec.roles.clone(),
            gen_uuid: gen_uuid.to_string(),
            node_count: spec.node_count,
            hashes: NodeHashes {
                template_hash: rendered.template_hash,
                config_hash: rendered.config_hash,
                secret_hash: None,
                current_secret_hash,
            },
            desired,
            selector: node_selector_labels(resource, name),
        })
    }

    /// The desired StatefulSet.
    pub fn desired(&self) -> &StatefulSet {
        &self.desired
    }

    fn pod_name(&self, ordinal: i32) -> String {
        format!("{}-{}", self.name, ordinal)
    }

    async fn live(&self, env: &NodeEnv<'_>) -> Result<StatefulSet> {
        env.workloads
            .get_statefulset(&self.name)
            .await?
            .ok_or_else(|| missing_workload("StatefulSet", &self.name))
    }

    async fn set_replicas(&self, env: &NodeEnv<'_>, count: i32) -> Result<()> {
        let mut live = self.live(env).await?;
        if let Some(spec) = live.spec.as_mut() {
            spec.replicas = Some(count);
        }
        env.workloads.replace_statefulset(&live).await?;
        debug!(name = %self.name, replicas = count, "Scaled statefulset");
        Ok(())
    }

    /// Members running beyond the desired count.
    pub async fn excess_members(&self, env: &NodeEnv<'_>) -> Result<Vec<String>> {
        let Some(live) = env.workloads.get_statefulset(&self.name).await? else {
            return Ok(Vec::new());
        };
        let keep = usize::try_from(self.node_count).unwrap_or(0);
        Ok(pod_names(&live, replicas(&live)).into_iter().skip(keep).collect())
    }

    /// Remove the members above the desired count.
    pub async fn shrink(&self, env: &NodeEnv<'_>) -> Result<()> {
        self.set_replicas(env, self.node_count).await?;
        info!(name = %self.name, replicas = self.node_count, "Shrank node statefulset");
        Ok(())
    }

    async fn release_ordinal(&self, env: &NodeEnv<'_>, ordinal: i32) -> Result<()> {
        let mut live = self.live(env).await?;
        set_partition(&mut live, ordinal);
        env.workloads.replace_statefulset(&live).await?;

        let pod_name = self.pod_name(ordinal);
        let workloads = env.workloads;
        let selector = &self.selector;
        let hash = self.hashes.template_hash.as_str();
        let target = pod_name.as_str();
        let operation = format!("{} to run template {}", pod_name, hash);
        poll_until(env.polling, &operation, || async move {
            let pods = workloads.list_pods(selector).await?;
            Ok::<_, Error>(
                pods.iter()
                    .any(|p| p.name_any() == target && pod_is_current(p, hash)),
            )
        })
        .await?;

        let gateway = env.gateway;
        let operation = format!("{} to rejoin the cluster", pod_name);
        poll_until(env.polling, &operation, || async move {
            Ok::<_, Error>(gateway.is_node_in_cluster(target).await?)
        })
        .await?;

        info!(name = %self.name, pod = %pod_name, "Replica updated");
        Ok(())
    }
}

#[async_trait]
impl NodeOperations for ReplicatedNode {
    fn name(&self) -> &str {
        &self.name
    }

    fn cluster_node_names(&self) -> Vec<String> {
        (0..self.node_count.max(0))
            .map(|ordinal| self.pod_name(ordinal))
            .collect()
    }

    async fn create(&mut self, env: &NodeEnv<'_>) -> Result<()> {
        match env.workloads.get_statefulset(&self.name).await? {
            None => {
                let mut sts = self.desired.clone();
                if let Some(hash) = &self.hashes.current_secret_hash {
                    set_annotation(&mut sts.metadata.annotations, SECRET_HASH_ANNOTATION, hash);
                }
                env.workloads.create_statefulset(&sts).await?;
                self.hashes.secret_hash = self.hashes.current_secret_hash.clone();
                info!(name = %self.name, replicas = self.node_count, "Created node statefulset");
            }
            Some(live) => {
                if self.hashes.secret_hash.is_none() {
                    self.hashes.secret_hash = live
                        .annotations()
                        .get(SECRET_HASH_ANNOTATION)
                        .cloned()
                        .or_else(|| self.hashes.current_secret_hash.clone());
                }
                // Zero replicas means a restart campaign scaled it down.
                // Shrinking removes members and goes through `shrink`.
                let live_replicas = replicas(&live);
                if live_replicas != 0 && live_replicas < self.node_count {
                    self.set_replicas(env, self.node_count).await?;
                    info!(
                        name = %self.name,
                        from = live_replicas,
                        to = self.node_count,
                        "Grew node statefulset"
                    );
                }
            }
        }
        Ok(())
    }

    async fn delete(&self, env: &NodeEnv<'_>) -> Result<()> {
        env.workloads.delete_statefulset(&self.name).await?;
        info!(name = %self.name, "Deleted node statefulset");
        Ok(())
    }

    async fn is_missing(&self, env: &NodeEnv<'_>) -> Result<bool> {
        Ok(env.workloads.get_statefulset(&self.name).await?.is_none())
    }

    async fn scale_up(&self, env: &NodeEnv<'_>) -> Result<()> {
        self.set_replicas(env, self.node_count).await
    }

    async fn scale_down(&self, env: &NodeEnv<'_>) -> Result<()> {
        self.set_replicas(env, 0).await
    }

    async fn state(&self, env: &NodeEnv<'_>) -> Result<NodeUpgradeStatus> {
        let Some(live) = env.workloads.get_statefulset(&self.name).await? else {
            return Ok(NodeUpgradeStatus::default());
        };
        let changed = live.spec.as_ref().is_some_and(|spec| {
            self.hashes.template_changed(
                template_annotation(&spec.template, TEMPLATE_HASH_ANNOTATION),
                template_annotation(&spec.template, CONFIG_HASH_ANNOTATION),
            )
        });
        Ok(self.hashes.scheduled_status(changed))
    }

    async fn progress_node_changes(&self, env: &NodeEnv<'_>) -> Result<()> {
        let mut live = self.live(env).await?;
        let count = replicas(&live);
        let applied = live.spec.as_ref().is_some_and(|spec| {
            !self.hashes.template_changed(
                template_annotation(&spec.template, TEMPLATE_HASH_ANNOTATION),
                template_annotation(&spec.template, CONFIG_HASH_ANNOTATION),
            )
        });

        // A rollout cut short resumes at the ordinal it was waiting for
        let first = if applied {
            (partition(&live) + 1).min(count)
        } else {
            // Freeze every replica before the template changes
            set_partition(&mut live, count);
            if let (Some(spec), Some(desired)) = (live.spec.as_mut(), self.desired.spec.as_ref()) {
                spec.template = desired.template.clone();
            }
            env.workloads.replace_statefulset(&live).await?;
            count
        };
        info!(
            name = %self.name,
            replicas = count,
            from_ordinal = first - 1,
            hash = %self.hashes.template_hash,
            "Rolling out node replicas"
        );

        for ordinal in (0..first).rev() {
            self.release_ordinal(env, ordinal).await?;
        }

        info!(name = %self.name, "Node rollout complete");
        Ok(())
    }

    async fn refresh_hashes(&mut self, env: &NodeEnv<'_>) -> Result<()> {
        let Some(current) = self.hashes.current_secret_hash.clone() else {
            return Ok(());
        };
        let mut live = self.live(env).await?;
        set_annotation(&mut live.metadata.annotations, SECRET_HASH_ANNOTATION, &current);
        env.workloads.replace_statefulset(&live).await?;
        self.hashes.secret_hash = Some(current);
        Ok(())
    }
}
