//! Common resource generation utilities.
//!
//! Labels, owner references, node naming and content hashing shared by the
//! Deployment and StatefulSet builders.

use std::collections::BTreeMap;

use k8s_openapi::apimachinery::pkg::apis::meta::v1::OwnerReference;
use kube::ResourceExt;
use serde::Serialize;
use sha2::{Digest, Sha256};

use crate::crd::{Elasticsearch, ElasticsearchNode, NodeRole};

/// Label carrying the owning cluster's name.
pub const CLUSTER_LABEL: &str = "elasticsearchoperator.smoketurner.com/cluster";
/// Label carrying the managed node's workload name.
pub const NODE_LABEL: &str = "elasticsearchoperator.smoketurner.com/node";

/// Pod template annotation holding the hash of the template itself.
pub const TEMPLATE_HASH_ANNOTATION: &str = "elasticsearchoperator.smoketurner.com/template-hash";
/// Pod template annotation holding the hash of the rendered node configuration.
pub const CONFIG_HASH_ANNOTATION: &str = "elasticsearchoperator.smoketurner.com/config-hash";
/// Workload annotation holding the TLS secret hash the running pods started with.
pub const SECRET_HASH_ANNOTATION: &str = "elasticsearchoperator.smoketurner.com/secret-hash";

const HASH_LENGTH: usize = 16;

/// Standard labels applied to all resources of a cluster.
pub fn standard_labels(resource: &Elasticsearch) -> BTreeMap<String, String> {
    let mut labels = BTreeMap::new();
    labels.insert(
        "app.kubernetes.io/name".to_string(),
        "elasticsearch".to_string(),
    );
    labels.insert("app.kubernetes.io/instance".to_string(), resource.name_any());
    labels.insert(
        "app.kubernetes.io/managed-by".to_string(),
        "elasticsearch-operator".to_string(),
    );
    labels.insert(CLUSTER_LABEL.to_string(), resource.name_any());

    // Merge user-defined labels
    for (key, value) in &resource.spec.labels {
        labels.insert(key.clone(), value.clone());
    }

    labels
}

/// Labels selecting the pods of one managed node.
pub fn node_selector_labels(resource: &Elasticsearch, node_name: &str) -> BTreeMap<String, String> {
    let mut labels = BTreeMap::new();
    labels.insert(CLUSTER_LABEL.to_string(), resource.name_any());
    labels.insert(NODE_LABEL.to_string(), node_name.to_string());
    labels
}

/// Standard labels plus the node label and one `es-node-<role>` label per role.
pub fn node_labels(
    resource: &Elasticsearch,
    node_name: &str,
    roles: &[NodeRole],
) -> BTreeMap<String, String> {
    let mut labels = standard_labels(resource);
    labels.insert(NODE_LABEL.to_string(), node_name.to_string());
    for role in [NodeRole::Client, NodeRole::Data, NodeRole::Master] {
        let key = match role {
            NodeRole::Client => "es-node-client",
            NodeRole::Data => "es-node-data",
            NodeRole::Master => "es-node-master",
        };
        labels.insert(key.to_string(), roles.contains(&role).to_string());
    }
    labels
}

/// Create owner reference for an Elasticsearch cluster.
pub fn owner_reference(resource: &Elasticsearch) -> OwnerReference {
    OwnerReference {
        api_version: "elasticsearchoperator.smoketurner.com/v1alpha1".to_string(),
        kind: "Elasticsearch".to_string(),
        name: resource.name_any(),
        uid: resource.uid().unwrap_or_default(),
        controller: Some(true),
        block_owner_deletion: Some(true),
    }
}

/// Role suffix of a node group, e.g. `cm` for a client+master group.
pub fn role_suffix(roles: &[NodeRole]) -> String {
    let mut sorted = roles.to_vec();
    sorted.sort();
    sorted.dedup();
    sorted.iter().map(NodeRole::suffix).collect()
}

/// Base workload name of a node group: `{cluster}-{suffix}-{uuid}`.
pub fn node_group_name(cluster: &str, node: &ElasticsearchNode, uuid: &str) -> String {
    format!("{}-{}-{}", cluster, role_suffix(&node.roles), uuid)
}

/// Name of the `ordinal`-th (1-based) scalable node of a group.
pub fn scalable_node_name(group_name: &str, ordinal: i32) -> String {
    format!("{}-{}", group_name, ordinal)
}

/// Name of the headless service used for node discovery.
pub fn discovery_service_name(resource: &Elasticsearch) -> String {
    format!("{}-cluster", resource.name_any())
}

/// Name of the TLS secret of a cluster.
pub fn tls_secret_name(resource: &Elasticsearch) -> String {
    resource
        .spec
        .tls
        .secret_name
        .clone()
        .unwrap_or_else(|| format!("{}-certs", resource.name_any()))
}

/// Base URL of the cluster's REST API.
pub fn cluster_url(resource: &Elasticsearch) -> String {
    format!(
        "{}://{}.{}.svc:{}",
        resource.spec.tls.scheme,
        resource.name_any(),
        resource.namespace().unwrap_or_else(|| "default".to_string()),
        crate::crd::HTTP_PORT
    )
}

/// Stable content hash of any serializable value.
pub fn content_hash<T: Serialize>(value: &T) -> Result<String, serde_json::Error> {
    let bytes = serde_json::to_vec(value)?;
    Ok(hash_bytes(&bytes))
}

/// Truncated hex-encoded SHA-256 of raw bytes.
pub fn hash_bytes(bytes: &[u8]) -> String {
    let digest = Sha256::digest(bytes);
    let mut encoded = hex::encode(digest);
    encoded.truncate(HASH_LENGTH);
    encoded
}
