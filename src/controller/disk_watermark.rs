//! Read-only index block recovery.
//!
//! Elasticsearch marks every index `read_only_allow_delete` when a node
//! crosses the flood-stage disk watermark, and older versions never lift the
//! block on their own. Once every node is back under the flood watermark the
//! operator clears it. Raising the block is left to Elasticsearch.

use tracing::{debug, info};

use crate::client::{ClusterHealth, ClusterHealthGateway, SECURITY_INDEX};
use crate::controller::error::Result;
use crate::controller::managed_node::NodeOperations;
use crate::controller::node_registry::ClusterNodes;

/// Index setting set by the flood-stage watermark.
pub const READ_ONLY_ALLOW_DELETE: &str = "index.blocks.read_only_allow_delete";

/// Whether every node's disk usage is below the flood watermark.
///
/// A node whose usage cannot be read counts as above it.
pub async fn below_flood_watermark(
    nodes: &ClusterNodes,
    gateway: &dyn ClusterHealthGateway,
) -> Result<bool> {
    let flood = gateway.get_disk_watermarks().await?.flood;
    for node in nodes.iter() {
        for member in node.cluster_node_names() {
            match gateway.get_node_disk_usage(&member).await {
                Ok((usage, total)) if flood.is_below(&usage, total) => {}
                Ok((usage, _)) => {
                    debug!(node = %member, used_percent = usage.used_percent, "Node above flood watermark");
                    return Ok(false);
                }
                Err(e) => {
                    debug!(node = %member, error = %e, "Disk usage unavailable");
                    return Ok(false);
                }
            }
        }
    }
    Ok(true)
}

/// Clear the read-only block from every blocked index once disk pressure is
/// gone. Returns the indices that were unblocked.
pub async fn clear_read_only_blocks(
    nodes: &ClusterNodes,
    gateway: &dyn ClusterHealthGateway,
) -> Result<Vec<String>> {
    let health = gateway
        .get_cluster_health()
        .await
        .unwrap_or(ClusterHealth::Unknown);
    if !health.is_operational() || nodes.is_empty() {
        return Ok(Vec::new());
    }
    if !below_flood_watermark(nodes, gateway).await? {
        return Ok(Vec::new());
    }

    let mut cleared = Vec::new();
    for index in gateway.list_indices("*").await? {
        if index == SECURITY_INDEX {
            continue;
        }
        if !gateway.get_index_settings(&index).await?.read_only_allow_delete {
            continue;
        }
        gateway
            .update_index_settings(
                &index,
                serde_json::json!({ READ_ONLY_ALLOW_DELETE: serde_json::Value::Null }),
            )
            .await?;
        cleared.push(index);
    }

    if !cleared.is_empty() {
        info!(indices = ?cleared, "Cleared read-only index blocks");
    }
    Ok(cleared)
}
