//! Node topology reconciliation.
//!
//! Turns the declared node groups into managed nodes, converges the cluster's
//! registry entry against them, creates what is missing and removes what is
//! no longer declared. Removal is destructive, so it only happens while the
//! cluster reports green or yellow health, and after the master quorum
//! setting has been lowered for the smaller master set.

use std::collections::{BTreeMap, BTreeSet};

use k8s_openapi::api::core::v1::Secret;
use kube::ResourceExt;
use tracing::{debug, info, warn};

use crate::client::{ClusterHealth, master_quorum};
use crate::controller::error::{Error, Result};
use crate::controller::managed_node::{ManagedNode, NodeEnv, NodeOperations};
use crate::controller::node_registry::ClusterNodes;
use crate::controller::replicated_node::ReplicatedNode;
use crate::controller::scalable_node::ScalableNode;
use crate::controller::status::{StatusRecorder, remove_condition, set_condition};
use crate::controller::validation::{Violation, validate_scale_down};
use crate::crd::{ConditionType, Elasticsearch, ElasticsearchSpec, ElasticsearchStatus};
use crate::resources::common::{hash_bytes, node_group_name, scalable_node_name};

/// Length of generated node group identifiers.
pub const UUID_LENGTH: usize = 8;

/// What one topology pass did.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct TopologyOutcome {
    /// Nodes whose workloads were created.
    pub created: Vec<String>,
    /// Nodes whose workloads were deleted.
    pub deleted: Vec<String>,
    /// Undeclared nodes kept because deletion is not safe yet.
    pub pending_deletion: Vec<String>,
}

impl TopologyOutcome {
    pub fn is_converged(&self) -> bool {
        self.created.is_empty() && self.pending_deletion.is_empty()
    }
}

/// Generate a node group identifier: 8 lowercase alphanumerics.
pub fn generate_uuid() -> String {
    let mut id = uuid::Uuid::new_v4().simple().to_string();
    id.truncate(UUID_LENGTH);
    id
}

/// Assign an identifier to every node group that lacks one.
///
/// Returns whether the spec changed and must be persisted.
pub fn assign_uuids(spec: &mut ElasticsearchSpec) -> bool {
    let mut changed = false;
    for node in spec.nodes.iter_mut().filter(|n| n.gen_uuid.is_none()) {
        node.gen_uuid = Some(generate_uuid());
        changed = true;
    }
    changed
}

/// Detect an edited or dropped node group identifier.
///
/// Identifiers are immutable once assigned. Every identifier known from
/// status must still be declared; a group is retired by scaling it to zero
/// first, after which its nodes drop out of status.
pub fn validate_uuids(spec: &ElasticsearchSpec, status: &ElasticsearchStatus) -> Option<Violation> {
    let declared: BTreeSet<&str> = spec
        .nodes
        .iter()
        .filter_map(|n| n.gen_uuid.as_deref())
        .collect();
    let vanished: BTreeSet<&str> = status
        .nodes
        .iter()
        .filter_map(|n| n.gen_uuid.as_deref())
        .filter(|uuid| !declared.contains(uuid))
        .collect();
    if vanished.is_empty() {
        return None;
    }

    Some(Violation {
        condition: ConditionType::InvalidUUID,
        reason: "UUIDChanged",
        message: format!(
            "node group identifiers are immutable: {} no longer declared",
            vanished.into_iter().collect::<Vec<_>>().join(", ")
        ),
    })
}

/// Content hash of a TLS secret's data.
pub fn secret_hash(secret: &Secret) -> String {
    let mut bytes = Vec::new();
    for (key, value) in secret.data.iter().flatten() {
        bytes.extend_from_slice(key.as_bytes());
        bytes.push(0);
        bytes.extend_from_slice(&value.0);
        bytes.push(0);
    }
    hash_bytes(&bytes)
}

/// Build the desired managed nodes of a cluster, in declaration order.
///
/// Data groups expand into one scalable node per replica; every other group
/// becomes a single replicated node.
pub fn desired_nodes(
    resource: &Elasticsearch,
    current_secret_hash: Option<String>,
) -> Result<Vec<ManagedNode>> {
    let cluster = resource.name_any();
    let mut nodes = Vec::new();

    for spec in &resource.spec.nodes {
        let uuid = spec
            .gen_uuid
            .as_deref()
            .ok_or_else(|| Error::MissingField("nodes[].genUUID".to_string()))?;
        let group = node_group_name(&cluster, spec, uuid);

        if spec.is_data() {
            for ordinal in 1..=spec.node_count {
                let name = scalable_node_name(&group, ordinal);
                nodes.push(ManagedNode::Scalable(ScalableNode::new(
                    resource,
                    spec,
                    uuid,
                    &name,
                    current_secret_hash.clone(),
                )?));
            }
        } else if spec.node_count > 0 {
            nodes.push(ManagedNode::Replicated(ReplicatedNode::new(
                resource,
                spec,
                uuid,
                &group,
                current_secret_hash.clone(),
            )?));
        }
    }

    Ok(nodes)
}

/// Converge the registry entry and the live workloads with the declared nodes.
pub async fn reconcile_topology(
    resource: &Elasticsearch,
    nodes: &mut ClusterNodes,
    env: &NodeEnv<'_>,
    recorder: &StatusRecorder<'_>,
    current_secret_hash: Option<String>,
) -> Result<TopologyOutcome> {
    let name = resource.name_any();
    let desired = desired_nodes(resource, current_secret_hash)?;
    let desired_names: Vec<String> = desired.iter().map(|n| n.name().to_string()).collect();
    let desired_masters: i32 = desired.iter().map(ManagedNode::master_count).sum();
    let desired_data: i32 = desired.iter().map(ManagedNode::data_count).sum();

    let mut outcome = TopologyOutcome::default();

    // Update known nodes in place, register new ones
    for node in desired {
        nodes.upsert(node);
    }

    for node_name in &desired_names {
        if let Some(node) = nodes.get_mut(node_name) {
            if node.is_missing(env).await? {
                outcome.created.push(node_name.clone());
            }
            node.create(env).await?;
        }
    }

    let stale: Vec<String> = nodes
        .names()
        .into_iter()
        .filter(|n| !desired_names.contains(n))
        .collect();

    // Shrinking a group removes members just like deleting a node
    let mut shrinking: Vec<(String, Vec<String>)> = Vec::new();
    for node_name in &desired_names {
        if let Some(node) = nodes.get(node_name) {
            let excess = node.excess_members(env).await?;
            if !excess.is_empty() {
                shrinking.push((node_name.clone(), excess));
            }
        }
    }

    if !stale.is_empty() || !shrinking.is_empty() {
        outcome.pending_deletion = shrinking
            .iter()
            .flat_map(|(_, members)| members.iter().cloned())
            .chain(stale.iter().cloned())
            .collect();
        if deletion_allowed(&name, nodes, env, desired_data).await? {
            lower_master_quorum(&name, env, desired_masters).await;
            for (node_name, members) in &shrinking {
                if let Some(node) = nodes.get(node_name) {
                    node.shrink(env).await?;
                    outcome.deleted.extend(members.iter().cloned());
                }
            }
            for node_name in &stale {
                if let Some(node) = nodes.remove(node_name) {
                    node.delete(env).await?;
                    outcome.deleted.push(node_name.clone());
                }
            }
            outcome.pending_deletion.clear();
        }
    }

    // New masters count as soon as they have joined
    if outcome.pending_deletion.is_empty() {
        raise_master_quorum(&name, nodes, env, desired_masters).await;
    }

    record_scaling_conditions(recorder, &outcome).await?;

    if !outcome.created.is_empty() || !outcome.deleted.is_empty() {
        info!(
            name = %name,
            created = ?outcome.created,
            deleted = ?outcome.deleted,
            "Node topology changed"
        );
    }
    Ok(outcome)
}

/// Deletion requires green or yellow health, and a data scale-down must
/// leave room for every index's replicas.
async fn deletion_allowed(
    name: &str,
    nodes: &ClusterNodes,
    env: &NodeEnv<'_>,
    desired_data: i32,
) -> Result<bool> {
    let health = env
        .gateway
        .get_cluster_health()
        .await
        .unwrap_or(ClusterHealth::Unknown);
    if !health.is_operational() {
        info!(name = %name, health = %health, "Deferring node deletion until cluster is healthy");
        return Ok(false);
    }

    if desired_data < nodes.data_count() {
        let replica_counts: BTreeMap<String, i32> = match env.gateway.get_index_replica_counts().await
        {
            Ok(counts) => counts,
            Err(e) => {
                warn!(name = %name, error = %e, "Cannot read index replicas, deferring scale-down");
                return Ok(false);
            }
        };
        if let Some(violation) = validate_scale_down(desired_data, &replica_counts) {
            return Err(Error::Validation(violation.to_string()));
        }
    }

    Ok(true)
}

/// Lower `minimum_master_nodes` before masters go away, if anyone is listening.
async fn lower_master_quorum(name: &str, env: &NodeEnv<'_>, desired_masters: i32) {
    let reachable = env
        .gateway
        .get_cluster_node_count()
        .await
        .is_ok_and(|count| count > 0);
    if !reachable {
        return;
    }
    let quorum = master_quorum(desired_masters);
    match env.gateway.get_min_master_nodes().await {
        Ok(current) if current <= quorum => {}
        _ => match env.gateway.set_min_master_nodes(quorum).await {
            Ok(_) => info!(name = %name, quorum = quorum, "Lowered minimum master nodes"),
            Err(e) => warn!(name = %name, error = %e, "Failed to lower minimum master nodes"),
        },
    }
}

/// Raise `minimum_master_nodes` once every desired master has joined.
async fn raise_master_quorum(
    name: &str,
    nodes: &ClusterNodes,
    env: &NodeEnv<'_>,
    desired_masters: i32,
) {
    let quorum = master_quorum(desired_masters);
    let current = match env.gateway.get_min_master_nodes().await {
        Ok(current) => current,
        Err(e) => {
            debug!(name = %name, error = %e, "Cannot read minimum master nodes");
            return;
        }
    };
    if current >= quorum {
        return;
    }

    for node in nodes.iter().filter(|n| n.master_count() > 0) {
        for member in node.cluster_node_names() {
            if !env.gateway.is_node_in_cluster(&member).await.unwrap_or(false) {
                debug!(name = %name, node = %member, "Master not yet joined");
                return;
            }
        }
    }

    match env.gateway.set_min_master_nodes(quorum).await {
        Ok(_) => info!(name = %name, quorum = quorum, "Raised minimum master nodes"),
        Err(e) => warn!(name = %name, error = %e, "Failed to raise minimum master nodes"),
    }
}

async fn record_scaling_conditions(
    recorder: &StatusRecorder<'_>,
    outcome: &TopologyOutcome,
) -> Result<()> {
    let created = outcome.created.join(", ");
    let pending = outcome.pending_deletion.join(", ");
    recorder
        .update(|status| {
            if created.is_empty() {
                remove_condition(status, ConditionType::ScalingUp);
            } else {
                set_condition(
                    status,
                    ConditionType::ScalingUp,
                    true,
                    "NodesCreated",
                    &format!("created {}", created),
                );
            }
            if pending.is_empty() {
                remove_condition(status, ConditionType::ScalingDown);
            } else {
                set_condition(
                    status,
                    ConditionType::ScalingDown,
                    true,
                    "DeletionDeferred",
                    &format!("waiting for a healthy cluster to remove {}", pending),
                );
            }
        })
        .await?;
    Ok(())
}
