//! Clients for the systems the operator drives.
//!
//! ## Architecture
//!
//! - `gateway`: the `ClusterHealthGateway` trait, the semantic boundary to the
//!   Elasticsearch administrative API
//! - `es_client`: `reqwest` implementation of the gateway with mTLS
//! - `types` / `parsing`: parsed health, allocation, watermark and index data
//! - `workload`: the `WorkloadApi` trait over Deployments, StatefulSets, Pods
//!   and Secrets, with its `kube` implementation
//!
//! ## Example
//!
//! ```rust,ignore
//! use elasticsearch_operator::client::{ClusterHealthGateway, ElasticsearchClient};
//!
//! let client = ElasticsearchClient::new(config)?;
//! if client.get_cluster_health().await?.is_operational() {
//!     println!("Cluster is healthy");
//! }
//! ```

pub mod es_client;
pub mod gateway;
pub mod parsing;
pub mod types;
pub mod workload;

pub use es_client::{ElasticsearchClient, ElasticsearchClientConfig};
pub use gateway::{ClusterHealthGateway, GatewayError, master_quorum};
pub use types::{
    ClusterHealth, DiskUsage, DiskWatermarks, IndexSettings, ParseError,
    SECURITY_INDEX, ShardAllocationMode, Watermark,
};
pub use workload::{KubeWorkloadApi, WorkloadApi, WorkloadError, selector_string};
