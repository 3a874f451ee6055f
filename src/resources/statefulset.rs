//! StatefulSet generation for multi-replica Elasticsearch nodes.
//!
//! Non-data node groups (masters, clients) run as one StatefulSet with a
//! `RollingUpdate` strategy. The partition starts at 0 so a new set comes up
//! whole; during a rollout the restart orchestrator raises it to the replica
//! count and lowers it one ordinal at a time.

use std::collections::BTreeMap;

use k8s_openapi::api::apps::v1::{
    RollingUpdateStatefulSetStrategy, StatefulSet, StatefulSetSpec, StatefulSetUpdateStrategy,
};
use k8s_openapi::api::core::v1::{
    PersistentVolumeClaim, PersistentVolumeClaimSpec, VolumeResourceRequirements,
};
use k8s_openapi::apimachinery::pkg::api::resource::Quantity;
use k8s_openapi::apimachinery::pkg::apis::meta::v1::{LabelSelector, ObjectMeta};
use kube::ResourceExt;

use crate::crd::{Elasticsearch, ElasticsearchNode, StorageSpec};
use crate::resources::common::{
    discovery_service_name, node_labels, node_selector_labels, owner_reference,
};
use crate::resources::pod_template::{
    DATA_VOLUME, DataVolume, NodeNaming, RenderedTemplate, build_pod_template,
};

/// Generate the StatefulSet of one replicated node.
///
/// Returns the StatefulSet together with the hashes of its pod template.
pub fn generate_statefulset(
    resource: &Elasticsearch,
    node: &ElasticsearchNode,
    name: &str,
) -> Result<(StatefulSet, RenderedTemplate), serde_json::Error> {
    let data_volume = if node.storage.is_some() {
        DataVolume::ClaimTemplate
    } else {
        DataVolume::EmptyDir
    };
    let rendered = build_pod_template(resource, node, name, NodeNaming::Pod, &data_volume)?;

    let sts = StatefulSet {
        metadata: ObjectMeta {
            name: Some(name.to_string()),
            namespace: resource.namespace(),
            labels: Some(node_labels(resource, name, &node.roles)),
            owner_references: Some(vec![owner_reference(resource)]),
            ..Default::default()
        },
        spec: Some(StatefulSetSpec {
            replicas: Some(node.node_count),
            service_name: Some(discovery_service_name(resource)),
            selector: LabelSelector {
                match_labels: Some(node_selector_labels(resource, name)),
                ..Default::default()
            },
            // Masters must discover each other before any is ready
            pod_management_policy: Some("Parallel".to_string()),
            update_strategy: Some(StatefulSetUpdateStrategy {
                type_: Some("RollingUpdate".to_string()),
                rolling_update: Some(RollingUpdateStatefulSetStrategy {
                    partition: Some(0),
                    ..Default::default()
                }),
            }),
            template: rendered.template.clone(),
            volume_claim_templates: node
                .storage
                .as_ref()
                .map(|storage| vec![generate_pvc_template(storage)]),
            ..Default::default()
        }),
        ..Default::default()
    };

    Ok((sts, rendered))
}

/// Generate the PVC template for the data directory.
fn generate_pvc_template(storage: &StorageSpec) -> PersistentVolumeClaim {
    let mut requests = BTreeMap::new();
    requests.insert("storage".to_string(), Quantity(storage.size.clone()));

    PersistentVolumeClaim {
        metadata: ObjectMeta {
            name: Some(DATA_VOLUME.to_string()),
            ..Default::default()
        },
        spec: Some(PersistentVolumeClaimSpec {
            access_modes: Some(vec!["ReadWriteOnce".to_string()]),
            storage_class_name: storage.storage_class_name.clone(),
            resources: Some(VolumeResourceRequirements {
                requests: Some(requests),
                ..Default::default()
            }),
            ..Default::default()
        }),
        ..Default::default()
    }
}

/// Desired replica count of a StatefulSet.
pub fn replicas(sts: &StatefulSet) -> i32 {
    sts.spec.as_ref().and_then(|s| s.replicas).unwrap_or(0)
}

/// Current rolling-update partition of a StatefulSet.
pub fn partition(sts: &StatefulSet) -> i32 {
    sts.spec
        .as_ref()
        .and_then(|s| s.update_strategy.as_ref())
        .and_then(|u| u.rolling_update.as_ref())
        .and_then(|r| r.partition)
        .unwrap_or(0)
}

/// Set the rolling-update partition of a StatefulSet.
pub fn set_partition(sts: &mut StatefulSet, value: i32) {
    if let Some(spec) = sts.spec.as_mut() {
        let strategy = spec
            .update_strategy
            .get_or_insert_with(StatefulSetUpdateStrategy::default);
        strategy.type_ = Some("RollingUpdate".to_string());
        strategy
            .rolling_update
            .get_or_insert_with(RollingUpdateStatefulSetStrategy::default)
            .partition = Some(value);
    }
}

/// Pod names of a StatefulSet, in ordinal order.
pub fn pod_names(sts: &StatefulSet, count: i32) -> Vec<String> {
    let name = sts.name_any();
    (0..count.max(0)).map(|i| format!("{}-{}", name, i)).collect()
}
