//! Elasticsearch Custom Resource Definition.
//!
//! Defines the Elasticsearch CRD describing a multi-role cluster, plus the
//! persisted status the restart orchestrator uses as its durable memory.

use std::collections::BTreeMap;

use kube::CustomResource;
use schemars::JsonSchema;
use serde::{Deserialize, Serialize};

/// Elasticsearch is a custom resource for deploying multi-role Elasticsearch clusters.
///
/// Example:
/// ```yaml
/// apiVersion: elasticsearchoperator.smoketurner.com/v1alpha1
/// kind: Elasticsearch
/// metadata:
///   name: logs
/// spec:
///   redundancyPolicy: SingleRedundancy
///   nodeSpec:
///     image: docker.elastic.co/elasticsearch/elasticsearch:6.8.23
///   tls:
///     secretName: logs-certs
///   nodes:
///     - roles: [client, master]
///       nodeCount: 3
///     - roles: [data]
///       nodeCount: 3
/// ```
#[derive(CustomResource, Clone, Debug, Deserialize, Serialize, JsonSchema)]
#[kube(
    group = "elasticsearchoperator.smoketurner.com",
    version = "v1alpha1",
    kind = "Elasticsearch",
    plural = "elasticsearches",
    shortname = "es",
    status = "ElasticsearchStatus",
    namespaced,
    printcolumn = r#"{"name":"Health", "type":"string", "jsonPath":".status.clusterHealth"}"#,
    printcolumn = r#"{"name":"Nodes", "type":"integer", "jsonPath":".status.nodeCount"}"#,
    printcolumn = r#"{"name":"Redundancy", "type":"string", "jsonPath":".spec.redundancyPolicy"}"#,
    printcolumn = r#"{"name":"Age", "type":"date", "jsonPath":".metadata.creationTimestamp"}"#
)]
#[serde(rename_all = "camelCase")]
pub struct ElasticsearchSpec {
    /// Data redundancy policy used to derive index replica counts.
    #[serde(default)]
    pub redundancy_policy: RedundancyPolicy,

    /// Defaults applied to every node group.
    #[serde(default)]
    pub node_spec: NodeSpecDefaults,

    /// Ordered node groups.
    #[serde(default)]
    pub nodes: Vec<ElasticsearchNode>,

    /// TLS material for node-to-node and client traffic.
    #[serde(default)]
    pub tls: TlsSpec,

    /// Index management settings.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub index_management: Option<IndexManagementSpec>,

    /// Additional labels to apply to all managed resources.
    #[serde(default)]
    pub labels: BTreeMap<String, String>,
}

impl Default for ElasticsearchSpec {
    fn default() -> Self {
        Self {
            redundancy_policy: RedundancyPolicy::default(),
            node_spec: NodeSpecDefaults::default(),
            nodes: Vec::new(),
            tls: TlsSpec::default(),
            index_management: None,
            labels: BTreeMap::new(),
        }
    }
}

/// Redundancy policy for index replicas.
#[derive(Clone, Copy, Debug, Default, Eq, PartialEq, Hash, Deserialize, Serialize, JsonSchema)]
pub enum RedundancyPolicy {
    /// No replicas.
    ZeroRedundancy,
    /// One replica per primary.
    #[default]
    SingleRedundancy,
    /// Replicas on half of the remaining data nodes.
    MultipleRedundancy,
    /// Replicas on every other data node.
    FullRedundancy,
}

impl RedundancyPolicy {
    /// Number of replica shards new indices get for `data_nodes` data nodes.
    pub fn replica_count(&self, data_nodes: i32) -> i32 {
        match self {
            RedundancyPolicy::ZeroRedundancy => 0,
            RedundancyPolicy::SingleRedundancy => 1,
            RedundancyPolicy::MultipleRedundancy => ((data_nodes - 1) / 2).max(0),
            RedundancyPolicy::FullRedundancy => (data_nodes - 1).max(0),
        }
    }
}

impl std::fmt::Display for RedundancyPolicy {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            RedundancyPolicy::ZeroRedundancy => write!(f, "ZeroRedundancy"),
            RedundancyPolicy::SingleRedundancy => write!(f, "SingleRedundancy"),
            RedundancyPolicy::MultipleRedundancy => write!(f, "MultipleRedundancy"),
            RedundancyPolicy::FullRedundancy => write!(f, "FullRedundancy"),
        }
    }
}

/// Role an Elasticsearch node plays.
#[derive(
    Clone, Copy, Debug, Eq, PartialEq, Ord, PartialOrd, Hash, Deserialize, Serialize, JsonSchema,
)]
#[serde(rename_all = "lowercase")]
pub enum NodeRole {
    Client,
    Data,
    Master,
}

impl NodeRole {
    /// Single-letter suffix used in workload names.
    pub fn suffix(&self) -> char {
        match self {
            NodeRole::Client => 'c',
            NodeRole::Data => 'd',
            NodeRole::Master => 'm',
        }
    }
}

/// A node group declaration.
#[derive(Clone, Debug, Default, Deserialize, Serialize, JsonSchema)]
#[serde(rename_all = "camelCase")]
pub struct ElasticsearchNode {
    /// Roles of every node in this group.
    pub roles: Vec<NodeRole>,

    /// Number of nodes in this group.
    pub node_count: i32,

    /// Stable identifier, assigned by the operator and immutable afterwards.
    #[serde(default, rename = "genUUID", skip_serializing_if = "Option::is_none")]
    pub gen_uuid: Option<String>,

    /// Resource overrides for this group.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub resources: Option<ResourceRequirementsSpec>,

    /// Persistent storage for this group. Empty-dir storage when unset.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub storage: Option<StorageSpec>,
}

impl ElasticsearchNode {
    pub fn has_role(&self, role: NodeRole) -> bool {
        self.roles.contains(&role)
    }

    pub fn is_data(&self) -> bool {
        self.has_role(NodeRole::Data)
    }

    pub fn is_master(&self) -> bool {
        self.has_role(NodeRole::Master)
    }
}

/// Defaults shared by all node groups.
#[derive(Clone, Debug, Deserialize, Serialize, JsonSchema)]
#[serde(rename_all = "camelCase")]
pub struct NodeSpecDefaults {
    /// Elasticsearch container image.
    #[serde(default = "default_image")]
    pub image: String,

    /// Default resources.
    #[serde(default)]
    pub resources: ResourceRequirementsSpec,

    /// Node selector for pod placement.
    #[serde(default)]
    pub node_selector: BTreeMap<String, String>,
}

impl Default for NodeSpecDefaults {
    fn default() -> Self {
        Self {
            image: default_image(),
            resources: ResourceRequirementsSpec::default(),
            node_selector: BTreeMap::new(),
        }
    }
}

fn default_image() -> String {
    "docker.elastic.co/elasticsearch/elasticsearch:6.8.23".to_string()
}

/// Resource requests and limits.
#[derive(Clone, Debug, Deserialize, Serialize, JsonSchema, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct ResourceRequirementsSpec {
    /// Memory request and limit (default: 2Gi).
    #[serde(default = "default_memory")]
    pub memory: String,

    /// CPU request (default: 500m).
    #[serde(default = "default_cpu")]
    pub cpu: String,
}

impl Default for ResourceRequirementsSpec {
    fn default() -> Self {
        Self {
            memory: default_memory(),
            cpu: default_cpu(),
        }
    }
}

fn default_memory() -> String {
    "2Gi".to_string()
}

fn default_cpu() -> String {
    "500m".to_string()
}

/// Persistent storage for a node group.
#[derive(Clone, Debug, Default, Deserialize, Serialize, JsonSchema)]
#[serde(rename_all = "camelCase")]
pub struct StorageSpec {
    /// Storage class name; cluster default when unset.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub storage_class_name: Option<String>,

    /// Volume size, e.g. "20Gi".
    pub size: String,
}

/// TLS configuration.
#[derive(Clone, Debug, Deserialize, Serialize, JsonSchema)]
#[serde(rename_all = "camelCase")]
pub struct TlsSpec {
    /// Secret holding `ca.crt`, `tls.crt` and `tls.key`. Defaults to `<cluster>-certs`.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub secret_name: Option<String>,

    /// Scheme used to reach the REST API (default: https).
    #[serde(default = "default_scheme")]
    pub scheme: String,
}

impl Default for TlsSpec {
    fn default() -> Self {
        Self {
            secret_name: None,
            scheme: default_scheme(),
        }
    }
}

fn default_scheme() -> String {
    "https".to_string()
}

/// Index management settings.
#[derive(Clone, Debug, Default, Deserialize, Serialize, JsonSchema)]
#[serde(rename_all = "camelCase")]
pub struct IndexManagementSpec {
    /// How often rollover and retention run, e.g. "15m".
    pub poll_interval: String,
}

// ============================================================================
// Status
// ============================================================================

/// Status of an Elasticsearch cluster.
#[derive(Clone, Debug, Default, Deserialize, Serialize, JsonSchema, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct ElasticsearchStatus {
    /// Live cluster health (green, yellow, red, unknown).
    #[serde(default)]
    pub cluster_health: String,

    /// Number of nodes currently in the cluster.
    #[serde(default)]
    pub node_count: i32,

    /// Shard allocation mode last observed.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub shard_allocation_enabled: Option<String>,

    /// Per-node status, including the durable half of the restart state machine.
    #[serde(default)]
    pub nodes: Vec<NodeStatus>,

    /// Cluster conditions.
    #[serde(default)]
    pub conditions: Vec<Condition>,

    /// Last processed value of the restart annotation.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub last_restart_request: Option<String>,

    /// The generation most recently observed by the controller.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub observed_generation: Option<i64>,
}

impl ElasticsearchStatus {
    /// Find a node's status by workload name.
    pub fn node(&self, name: &str) -> Option<&NodeStatus> {
        self.nodes.iter().find(|n| n.name() == name)
    }

    /// Find or insert a node's status by workload name.
    pub fn node_mut(&mut self, name: &str) -> &mut NodeStatus {
        let pos = match self.nodes.iter().position(|n| n.name() == name) {
            Some(pos) => pos,
            None => {
                self.nodes.push(NodeStatus::named(name));
                self.nodes.len() - 1
            }
        };
        // pos is in range: either found or just pushed
        #[allow(clippy::indexing_slicing)]
        &mut self.nodes[pos]
    }

    /// Upgrade status of a node, defaulting to idle for unknown nodes.
    pub fn upgrade_status(&self, name: &str) -> NodeUpgradeStatus {
        self.node(name)
            .map(|n| n.upgrade_status.clone())
            .unwrap_or_default()
    }

    /// Whether a condition type is currently true.
    pub fn is_condition_true(&self, condition_type: ConditionType) -> bool {
        let type_name = condition_type.to_string();
        self.conditions
            .iter()
            .any(|c| c.r#type == type_name && c.status == "True")
    }
}

/// Status of a single managed node.
#[derive(Clone, Debug, Default, Deserialize, Serialize, JsonSchema, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct NodeStatus {
    /// Deployment name for scalable nodes.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub deployment_name: Option<String>,

    /// StatefulSet name for replicated nodes.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub stateful_set_name: Option<String>,

    /// Roles of this node.
    #[serde(default)]
    pub roles: Vec<NodeRole>,

    /// UUID of the node group this node belongs to.
    #[serde(default, rename = "genUUID", skip_serializing_if = "Option::is_none")]
    pub gen_uuid: Option<String>,

    /// Upgrade status.
    #[serde(default)]
    pub upgrade_status: NodeUpgradeStatus,
}

impl NodeStatus {
    fn named(name: &str) -> Self {
        Self {
            deployment_name: Some(name.to_string()),
            ..Default::default()
        }
    }

    /// Workload name of this node.
    pub fn name(&self) -> &str {
        self.deployment_name
            .as_deref()
            .or(self.stateful_set_name.as_deref())
            .unwrap_or_default()
    }
}

/// Tri-state flag persisted as "True" / "False" or absent.
#[derive(Clone, Copy, Debug, Default, Eq, PartialEq, Deserialize, Serialize, JsonSchema)]
pub enum ConditionStatus {
    True,
    False,
    #[default]
    #[serde(rename = "")]
    Unknown,
}

impl ConditionStatus {
    pub fn is_true(&self) -> bool {
        matches!(self, ConditionStatus::True)
    }

    pub fn from_bool(value: bool) -> Self {
        if value {
            ConditionStatus::True
        } else {
            ConditionStatus::False
        }
    }
}

impl std::fmt::Display for ConditionStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ConditionStatus::True => write!(f, "True"),
            ConditionStatus::False => write!(f, "False"),
            ConditionStatus::Unknown => write!(f, ""),
        }
    }
}

/// Durable upgrade state of a node.
#[derive(Clone, Debug, Default, Deserialize, Serialize, JsonSchema, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct NodeUpgradeStatus {
    #[serde(default, skip_serializing_if = "is_unknown")]
    pub under_upgrade: ConditionStatus,

    #[serde(default, skip_serializing_if = "is_unknown")]
    pub scheduled_for_upgrade: ConditionStatus,

    #[serde(default, skip_serializing_if = "is_unknown")]
    pub scheduled_for_cert_redeploy: ConditionStatus,

    #[serde(default)]
    pub upgrade_phase: UpgradePhase,

    /// Kind of the campaign this node is under, recorded when it starts.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub campaign: Option<String>,
}

fn is_unknown(status: &ConditionStatus) -> bool {
    matches!(status, ConditionStatus::Unknown)
}

impl NodeUpgradeStatus {
    /// Whether a node campaign is in flight for this node.
    pub fn is_under_upgrade(&self) -> bool {
        self.under_upgrade.is_true()
    }
}

/// Phase of a node's upgrade. Advances strictly forward.
#[derive(Clone, Copy, Debug, Default, Deserialize, Serialize, JsonSchema, PartialEq, Eq)]
pub enum UpgradePhase {
    #[default]
    #[serde(rename = "")]
    None,
    ControllerUpdated,
    PreparationComplete,
    NodeRestarting,
    RecoveringData,
}

impl UpgradePhase {
    /// Both the empty phase and `ControllerUpdated` mean no campaign step is pending.
    pub fn is_idle(&self) -> bool {
        matches!(self, UpgradePhase::None | UpgradePhase::ControllerUpdated)
    }
}

impl std::fmt::Display for UpgradePhase {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            UpgradePhase::None => write!(f, ""),
            UpgradePhase::ControllerUpdated => write!(f, "ControllerUpdated"),
            UpgradePhase::PreparationComplete => write!(f, "PreparationComplete"),
            UpgradePhase::NodeRestarting => write!(f, "NodeRestarting"),
            UpgradePhase::RecoveringData => write!(f, "RecoveringData"),
        }
    }
}

/// Condition describes the state of a cluster at a certain point.
#[derive(Clone, Debug, Deserialize, Serialize, JsonSchema, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct Condition {
    /// Type of condition.
    pub r#type: String,
    /// Status of the condition ("True", "False", "Unknown").
    pub status: String,
    /// Machine-readable reason for the condition's last transition.
    pub reason: String,
    /// Human-readable message indicating details about last transition.
    pub message: String,
    /// Last time the condition transitioned from one status to another.
    pub last_transition_time: String,
}

impl Condition {
    /// Create a new condition.
    pub fn new(condition_type: ConditionType, status: bool, reason: &str, message: &str) -> Self {
        Self {
            r#type: condition_type.to_string(),
            status: ConditionStatus::from_bool(status).to_string(),
            reason: reason.to_string(),
            message: message.to_string(),
            last_transition_time: jiff::Timestamp::now().to_string(),
        }
    }
}

/// Types of conditions for Elasticsearch clusters.
#[derive(Clone, Copy, Debug, Eq, PartialEq, Hash, Deserialize, Serialize, JsonSchema)]
pub enum ConditionType {
    /// A whole-cluster restart is in its disruptive stage.
    Restarting,
    /// Cluster settings were changed in preparation for a restart.
    UpdatingESSettings,
    /// Restarted nodes are recovering shards.
    Recovering,
    /// New nodes are being created.
    ScalingUp,
    /// Stale nodes are being removed.
    ScalingDown,
    /// A node group changed its UUID.
    InvalidUUID,
    /// Redundancy policy cannot be satisfied.
    InvalidRedundancy,
    /// No data nodes, or an unsafe data node scale-down.
    InvalidData,
    /// Master node count is out of range.
    InvalidMasters,
    /// Index management settings cannot be applied.
    InvalidIndexManagement,
}

impl std::fmt::Display for ConditionType {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ConditionType::Restarting => write!(f, "Restarting"),
            ConditionType::UpdatingESSettings => write!(f, "UpdatingESSettings"),
            ConditionType::Recovering => write!(f, "Recovering"),
            ConditionType::ScalingUp => write!(f, "ScalingUp"),
            ConditionType::ScalingDown => write!(f, "ScalingDown"),
            ConditionType::InvalidUUID => write!(f, "InvalidUUID"),
            ConditionType::InvalidRedundancy => write!(f, "InvalidRedundancy"),
            ConditionType::InvalidData => write!(f, "InvalidData"),
            ConditionType::InvalidMasters => write!(f, "InvalidMasters"),
            ConditionType::InvalidIndexManagement => write!(f, "InvalidIndexManagement"),
        }
    }
}

/// Annotation requesting a full-cluster restart; any new value triggers one.
pub const RESTART_ANNOTATION: &str = "elasticsearchoperator.smoketurner.com/restart";

/// Default HTTP port of the Elasticsearch REST API.
pub const HTTP_PORT: i32 = 9200;

/// Transport port used for node-to-node traffic.
pub const TRANSPORT_PORT: i32 = 9300;
