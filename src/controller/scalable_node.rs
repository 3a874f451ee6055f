//! Single-replica nodes backed by a Deployment.
//!
//! The Deployment stays paused while idle so an edited template does not
//! roll out on its own. A rollout swaps the template, unpauses, waits for the
//! replacement pod to carry the new template hash and become ready, then
//! pauses again.

use std::collections::BTreeMap;

use async_trait::async_trait;
use k8s_openapi::api::apps::v1::Deployment;
use kube::ResourceExt;
use tracing::{debug, info};

use crate::controller::error::Result;
use crate::controller::managed_node::{
    NodeEnv, NodeHashes, NodeOperations, missing_workload, pods_current, set_annotation,
};
use crate::controller::polling::poll_until;
use crate::crd::{Elasticsearch, ElasticsearchNode, NodeRole, NodeUpgradeStatus};
use crate::resources::common::{
    CONFIG_HASH_ANNOTATION, SECRET_HASH_ANNOTATION, TEMPLATE_HASH_ANNOTATION,
    node_selector_labels,
};
use crate::resources::deployment::{generate_deployment, is_paused, is_rolled_out};
use crate::resources::pod_template::template_annotation;

/// A node running as a one-replica Deployment.
#[derive(Clone, Debug)]
pub struct ScalableNode {
    pub name: String,
    pub roles: Vec<NodeRole>,
    pub gen_uuid: String,
    pub hashes: NodeHashes,
    desired: Deployment,
    selector: BTreeMap<String, String>,
}

impl ScalableNode {
    /// Build the desired node from its spec.
    pub fn new(
        resource: &Elasticsearch,
        spec: &ElasticsearchNode,
        gen_uuid: &str,
        name: &str,
        current_secret_hash: Option<String>,
    ) -> Result<Self> {
        let (desired, rendered) = generate_deployment(resource, spec, name)?;
        Ok(Self {
            name: name.to_string(),
            roles: spec.roles.clone(),
            gen_uuid: gen_uuid.to_string(),
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

    /// The desired Deployment.
    pub fn desired(&self) -> &Deployment {
        &self.desired
    }

    async fn live(&self, env: &NodeEnv<'_>) -> Result<Deployment> {
        env.workloads
            .get_deployment(&self.name)
            .await?
            .ok_or_else(|| missing_workload("Deployment", &self.name))
    }

    async fn set_replicas(&self, env: &NodeEnv<'_>, replicas: i32) -> Result<()> {
        let mut live = self.live(env).await?;
        if let Some(spec) = live.spec.as_mut() {
            spec.replicas = Some(replicas);
        }
        env.workloads.replace_deployment(&live).await?;
        debug!(name = %self.name, replicas = replicas, "Scaled deployment");
        Ok(())
    }

    async fn set_paused(&self, env: &NodeEnv<'_>, paused: bool) -> Result<()> {
        let mut live = self.live(env).await?;
        if let Some(spec) = live.spec.as_mut() {
            spec.paused = Some(paused);
        }
        env.workloads.replace_deployment(&live).await?;
        Ok(())
    }
}

#[async_trait]
impl NodeOperations for ScalableNode {
    fn name(&self) -> &str {
        &self.name
    }

    fn cluster_node_names(&self) -> Vec<String> {
        vec![self.name.clone()]
    }

    async fn create(&mut self, env: &NodeEnv<'_>) -> Result<()> {
        match env.workloads.get_deployment(&self.name).await? {
            None => {
                let mut deployment = self.desired.clone();
                if let Some(hash) = &self.hashes.current_secret_hash {
                    set_annotation(&mut deployment.metadata.annotations, SECRET_HASH_ANNOTATION, hash);
                }
                env.workloads.create_deployment(&deployment).await?;
                self.hashes.secret_hash = self.hashes.current_secret_hash.clone();
                info!(name = %self.name, "Created node deployment");
            }
            Some(live) => {
                if self.hashes.secret_hash.is_none() {
                    self.hashes.secret_hash = live
                        .annotations()
                        .get(SECRET_HASH_ANNOTATION)
                        .cloned()
                        .or_else(|| self.hashes.current_secret_hash.clone());
                }
                // Pause once the first rollout has finished
                if !is_paused(&live) && is_rolled_out(&live) {
                    self.set_paused(env, true).await?;
                    debug!(name = %self.name, "Paused idle deployment");
                }
            }
        }
        Ok(())
    }

    async fn delete(&self, env: &NodeEnv<'_>) -> Result<()> {
        env.workloads.delete_deployment(&self.name).await?;
        info!(name = %self.name, "Deleted node deployment");
        Ok(())
    }

    async fn is_missing(&self, env: &NodeEnv<'_>) -> Result<bool> {
        Ok(env.workloads.get_deployment(&self.name).await?.is_none())
    }

    async fn scale_up(&self, env: &NodeEnv<'_>) -> Result<()> {
        self.set_replicas(env, 1).await
    }

    async fn scale_down(&self, env: &NodeEnv<'_>) -> Result<()> {
        self.set_replicas(env, 0).await
    }

    async fn state(&self, env: &NodeEnv<'_>) -> Result<NodeUpgradeStatus> {
        let Some(live) = env.workloads.get_deployment(&self.name).await? else {
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
        if let (Some(spec), Some(desired)) = (live.spec.as_mut(), self.desired.spec.as_ref()) {
            spec.template = desired.template.clone();
            spec.paused = Some(false);
        }
        env.workloads.replace_deployment(&live).await?;
        info!(name = %self.name, hash = %self.hashes.template_hash, "Rolling out node");

        let workloads = env.workloads;
        let selector = &self.selector;
        let hash = self.hashes.template_hash.as_str();
        let operation = format!("{} pods to run template {}", self.name, hash);
        poll_until(env.polling, &operation, || async move {
            pods_current(workloads, selector, hash, 1).await
        })
        .await?;

        self.set_paused(env, true).await?;
        info!(name = %self.name, "Node rollout complete");
        Ok(())
    }

    async fn refresh_hashes(&mut self, env: &NodeEnv<'_>) -> Result<()> {
        let Some(current) = self.hashes.current_secret_hash.clone() else {
            return Ok(());
        };
        let mut live = self.live(env).await?;
        set_annotation(&mut live.metadata.annotations, SECRET_HASH_ANNOTATION, &current);
        env.workloads.replace_deployment(&live).await?;
        self.hashes.secret_hash = Some(current);
        Ok(())
    }
}
