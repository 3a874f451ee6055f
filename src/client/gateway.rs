//! Cluster Health Gateway.
//!
//! The semantic boundary between the operator and the live database's
//! administrative API. Everything the restart orchestrator knows about the
//! running cluster comes through this trait, which lets the orchestration
//! logic run against an in-memory cluster in tests.

use std::collections::BTreeMap;

use async_trait::async_trait;
use thiserror::Error;

use super::types::{
    ClusterHealth, DiskUsage, DiskWatermarks, IndexSettings, ParseError, ShardAllocationMode,
};

/// Errors returned by the gateway.
#[derive(Error, Debug)]
pub enum GatewayError {
    #[error("HTTP error: {0}")]
    Http(#[from] reqwest::Error),

    #[error("Unexpected response status {code}: {body}")]
    Status { code: u16, body: String },

    #[error("Parse error: {0}")]
    Parse(#[from] ParseError),

    #[error("Cluster unavailable: {0}")]
    Unavailable(String),

    #[error("Invalid configuration: {0}")]
    InvalidConfig(String),
}

/// Administrative operations against a running Elasticsearch cluster.
///
/// All calls are synchronous from the caller's point of view; transport and
/// non-2xx failures surface as `GatewayError`.
#[async_trait]
pub trait ClusterHealthGateway: Send + Sync {
    /// Overall cluster health.
    async fn get_cluster_health(&self) -> Result<ClusterHealth, GatewayError>;

    /// Current `cluster.routing.allocation.enable` value.
    async fn get_shard_allocation(&self) -> Result<ShardAllocationMode, GatewayError>;

    /// Set `cluster.routing.allocation.enable`. Returns whether the cluster acknowledged.
    async fn set_shard_allocation(&self, mode: ShardAllocationMode) -> Result<bool, GatewayError>;

    /// Perform a synchronized flush. Returns whether every shard was flushed.
    async fn do_synchronized_flush(&self) -> Result<bool, GatewayError>;

    /// Number of nodes currently in the cluster.
    async fn get_cluster_node_count(&self) -> Result<i32, GatewayError>;

    /// Whether a node with this name is currently a cluster member.
    async fn is_node_in_cluster(&self, node_name: &str) -> Result<bool, GatewayError>;

    /// Current `discovery.zen.minimum_master_nodes`.
    async fn get_min_master_nodes(&self) -> Result<i32, GatewayError>;

    /// Set `discovery.zen.minimum_master_nodes`. Returns whether the cluster acknowledged.
    async fn set_min_master_nodes(&self, count: i32) -> Result<bool, GatewayError>;

    /// Disk usage and total capacity of a node.
    async fn get_node_disk_usage(&self, node_name: &str) -> Result<(DiskUsage, u64), GatewayError>;

    /// Configured disk watermarks.
    async fn get_disk_watermarks(&self) -> Result<DiskWatermarks, GatewayError>;

    /// Names of all indices matching `pattern`.
    async fn list_indices(&self, pattern: &str) -> Result<Vec<String>, GatewayError>;

    /// Settings of one index.
    async fn get_index_settings(&self, index: &str) -> Result<IndexSettings, GatewayError>;

    /// Apply index settings given as a flat JSON object.
    async fn update_index_settings(
        &self,
        index: &str,
        settings: serde_json::Value,
    ) -> Result<(), GatewayError>;

    /// Lowest Elasticsearch version among cluster members.
    async fn get_lowest_node_version(&self) -> Result<semver::Version, GatewayError>;

    /// Configured replica count of every index.
    async fn get_index_replica_counts(&self) -> Result<BTreeMap<String, i32>, GatewayError> {
        let mut counts = BTreeMap::new();
        for index in self.list_indices("*").await? {
            let settings = self.get_index_settings(&index).await?;
            counts.insert(index, settings.number_of_replicas);
        }
        Ok(counts)
    }
}

/// Minimum quorum of master-eligible nodes for `masters` masters.
pub fn master_quorum(masters: i32) -> i32 {
    if masters <= 0 { 0 } else { masters / 2 + 1 }
}
