//! Deployment generation for single-replica Elasticsearch nodes.
//!
//! Each data node runs in its own Deployment with one replica. The
//! Deployment is kept `paused` while idle so template changes only roll out
//! when the restart orchestrator unpauses it.

use k8s_openapi::api::apps::v1::{Deployment, DeploymentSpec, DeploymentStrategy};
use k8s_openapi::apimachinery::pkg::apis::meta::v1::{LabelSelector, ObjectMeta};
use kube::ResourceExt;

use crate::crd::{Elasticsearch, ElasticsearchNode};
use crate::resources::common::{node_labels, node_selector_labels, owner_reference};
use crate::resources::pod_template::{
    DataVolume, NodeNaming, RenderedTemplate, build_pod_template,
};

/// Generate the Deployment of one scalable node.
///
/// Returns the Deployment together with the hashes of its pod template.
pub fn generate_deployment(
    resource: &Elasticsearch,
    node: &ElasticsearchNode,
    name: &str,
) -> Result<(Deployment, RenderedTemplate), serde_json::Error> {
    let data_volume = if node.storage.is_some() {
        DataVolume::Claim(name.to_string())
    } else {
        DataVolume::EmptyDir
    };
    let rendered = build_pod_template(resource, node, name, NodeNaming::Workload, &data_volume)?;

    let deployment = Deployment {
        metadata: ObjectMeta {
            name: Some(name.to_string()),
            namespace: resource.namespace(),
            labels: Some(node_labels(resource, name, &node.roles)),
            owner_references: Some(vec![owner_reference(resource)]),
            ..Default::default()
        },
        spec: Some(DeploymentSpec {
            replicas: Some(1),
            // Started unpaused so the first pod comes up
            paused: Some(false),
            selector: LabelSelector {
                match_labels: Some(node_selector_labels(resource, name)),
                ..Default::default()
            },
            // Never run two pods on the same data directory
            strategy: Some(DeploymentStrategy {
                type_: Some("Recreate".to_string()),
                ..Default::default()
            }),
            progress_deadline_seconds: Some(1800),
            template: rendered.template.clone(),
            ..Default::default()
        }),
        ..Default::default()
    };

    Ok((deployment, rendered))
}

/// Whether a Deployment is paused.
pub fn is_paused(deployment: &Deployment) -> bool {
    deployment
        .spec
        .as_ref()
        .and_then(|s| s.paused)
        .unwrap_or(false)
}

/// Desired replica count of a Deployment.
pub fn replicas(deployment: &Deployment) -> i32 {
    deployment
        .spec
        .as_ref()
        .and_then(|s| s.replicas)
        .unwrap_or(1)
}

/// Whether every desired replica is updated and ready.
pub fn is_rolled_out(deployment: &Deployment) -> bool {
    let desired = replicas(deployment);
    deployment.status.as_ref().is_some_and(|s| {
        s.updated_replicas.unwrap_or(0) >= desired && s.ready_replicas.unwrap_or(0) >= desired
    })
}
