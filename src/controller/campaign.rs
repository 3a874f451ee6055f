//! Restart campaigns.
//!
//! A campaign walks five stages: Precheck, Prep, Main, Post and Recovery.
//! Which stage is next is never held in memory. It is derived each time from
//! the persisted flags, node upgrade status for node-scoped campaigns and
//! cluster conditions for cluster-scoped ones. For any persisted state exactly
//! one stage guard holds, so an interrupted campaign resumes where it stopped.
//!
//! The campaign kinds differ only in the actions they plug into the stages.

use async_trait::async_trait;
use tracing::{debug, info, warn};

use crate::client::{ClusterHealth, ShardAllocationMode};
use crate::controller::error::{Error, Result};
use crate::controller::managed_node::{ManagedNode, NodeEnv, NodeOperations};
use crate::controller::polling::poll_until;
use crate::crd::{ConditionType, ElasticsearchStatus, NodeUpgradeStatus, UpgradePhase};

/// What a campaign does to the scheduled nodes.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum CampaignKind {
    /// Push a new template to one node at a time.
    RollingUpdate,
    /// Push a new template to every scheduled node; versions before 5.6
    /// cannot mix in one cluster.
    FullClusterUpdate,
    /// Stop every node and start it again with new certificates.
    FullClusterCertRestart,
    /// Stop every node and start it again on request.
    FullClusterRestart,
    /// Stop one node and start it again with new certificates.
    SingleNodeRestart,
}

impl CampaignKind {
    pub const ALL: [CampaignKind; 5] = [
        CampaignKind::RollingUpdate,
        CampaignKind::FullClusterUpdate,
        CampaignKind::FullClusterCertRestart,
        CampaignKind::FullClusterRestart,
        CampaignKind::SingleNodeRestart,
    ];

    /// Condition reason identifying this kind.
    pub fn reason(&self) -> &'static str {
        match self {
            CampaignKind::RollingUpdate => "RollingUpdate",
            CampaignKind::FullClusterUpdate => "FullClusterUpdate",
            CampaignKind::FullClusterCertRestart => "FullClusterCertRestart",
            CampaignKind::FullClusterRestart => "FullClusterRestart",
            CampaignKind::SingleNodeRestart => "SingleNodeRestart",
        }
    }

    pub fn from_reason(reason: &str) -> Option<Self> {
        Self::ALL.into_iter().find(|k| k.reason() == reason)
    }

    /// Cluster campaigns track progress in conditions, node campaigns in
    /// the node's upgrade status.
    pub fn is_cluster_scope(&self) -> bool {
        matches!(
            self,
            CampaignKind::FullClusterUpdate
                | CampaignKind::FullClusterCertRestart
                | CampaignKind::FullClusterRestart
        )
    }

    /// Whether Main replaces the pod template.
    pub fn applies_template(&self) -> bool {
        matches!(
            self,
            CampaignKind::RollingUpdate | CampaignKind::FullClusterUpdate
        )
    }

    /// Rolling kinds keep the cluster serving, so they only start while it is
    /// green or yellow.
    pub fn requires_healthy_cluster(&self) -> bool {
        matches!(
            self,
            CampaignKind::RollingUpdate | CampaignKind::SingleNodeRestart
        )
    }

    /// Whether Prep runs even when the cluster cannot be reached.
    pub fn prep_mandatory(&self) -> bool {
        self.applies_template()
    }
}

impl std::fmt::Display for CampaignKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.reason())
    }
}

/// Stage of a campaign.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Stage {
    Precheck,
    Prep,
    Main,
    Post,
    Recovery,
}

impl Stage {
    pub const ALL: [Stage; 5] = [
        Stage::Precheck,
        Stage::Prep,
        Stage::Main,
        Stage::Post,
        Stage::Recovery,
    ];

    /// Guard of this stage for a node-scoped campaign.
    pub fn node_guard(&self, status: &NodeUpgradeStatus) -> bool {
        let under = status.is_under_upgrade();
        match self {
            Stage::Precheck => !under,
            Stage::Prep => under && status.upgrade_phase.is_idle(),
            Stage::Main => under && status.upgrade_phase == UpgradePhase::PreparationComplete,
            Stage::Post => under && status.upgrade_phase == UpgradePhase::NodeRestarting,
            Stage::Recovery => under && status.upgrade_phase == UpgradePhase::RecoveringData,
        }
    }

    /// Guard of this stage for a cluster-scoped campaign over `nodes`.
    pub fn cluster_guard(&self, status: &ElasticsearchStatus, nodes: &[String]) -> bool {
        let updating = status.is_condition_true(ConditionType::UpdatingESSettings);
        let restarting = status.is_condition_true(ConditionType::Restarting);
        let recovering = status.is_condition_true(ConditionType::Recovering);
        let all_restarted = nodes.iter().all(|n| {
            status.upgrade_status(n).upgrade_phase == UpgradePhase::NodeRestarting
        });
        match self {
            Stage::Precheck => !updating && !restarting && !recovering,
            Stage::Prep => updating && !restarting && !recovering,
            Stage::Main => restarting && !recovering && !all_restarted,
            Stage::Post => restarting && !recovering && all_restarted,
            Stage::Recovery => recovering,
        }
    }
}

impl std::fmt::Display for Stage {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Stage::Precheck => write!(f, "Precheck"),
            Stage::Prep => write!(f, "Prep"),
            Stage::Main => write!(f, "Main"),
            Stage::Post => write!(f, "Post"),
            Stage::Recovery => write!(f, "Recovery"),
        }
    }
}

/// The stage a node-scoped campaign is in.
pub fn node_stage(status: &NodeUpgradeStatus) -> Option<Stage> {
    Stage::ALL.into_iter().find(|s| s.node_guard(status))
}

/// The stage a cluster-scoped campaign over `nodes` is in.
pub fn cluster_stage(status: &ElasticsearchStatus, nodes: &[String]) -> Option<Stage> {
    Stage::ALL.into_iter().find(|s| s.cluster_guard(status, nodes))
}

/// Actions of the five stages.
#[async_trait]
pub trait CampaignPhases: Send + Sync {
    /// Returns `false` when the campaign must wait for a later reconcile.
    async fn precheck(&mut self, env: &NodeEnv<'_>) -> Result<bool>;
    async fn prep(&mut self, env: &NodeEnv<'_>) -> Result<()>;
    async fn main(&mut self, env: &NodeEnv<'_>) -> Result<()>;
    async fn post(&mut self, env: &NodeEnv<'_>) -> Result<()>;
    async fn recovery(&mut self, env: &NodeEnv<'_>) -> Result<()>;
}

// ============================================================================
// Campaign variants
// ============================================================================

/// In-place template rollout of one node.
#[derive(Clone, Debug)]
pub struct RollingUpdate {
    pub node: ManagedNode,
}

/// Template rollout of every scheduled node, one after the other.
#[derive(Clone, Debug)]
pub struct FullClusterUpdate {
    pub nodes: Vec<ManagedNode>,
}

/// Stop every scheduled node, wait for the cluster to go away, start them
/// again. No node rejoins before all have left, so old and new identities
/// never meet.
#[derive(Clone, Debug)]
pub struct FullClusterRestart {
    pub kind: CampaignKind,
    pub nodes: Vec<ManagedNode>,
}

/// Stop one node, wait for it to leave, start it, wait for it to rejoin.
#[derive(Clone, Debug)]
pub struct SingleNodeRestart {
    pub node: ManagedNode,
}

/// A campaign, built fresh on every reconcile.
#[derive(Clone, Debug)]
pub enum Campaign {
    RollingUpdate(RollingUpdate),
    FullClusterUpdate(FullClusterUpdate),
    FullClusterCertRestart(FullClusterRestart),
    FullClusterRestart(FullClusterRestart),
    SingleNodeRestart(SingleNodeRestart),
}

impl Campaign {
    /// Build a campaign of `kind` over `nodes`.
    ///
    /// Node-scoped kinds use the first node only.
    pub fn new(kind: CampaignKind, mut nodes: Vec<ManagedNode>) -> Result<Self> {
        if nodes.is_empty() {
            return Err(Error::Permanent(format!("{} campaign without nodes", kind)));
        }
        Ok(match kind {
            CampaignKind::RollingUpdate => Campaign::RollingUpdate(RollingUpdate {
                node: nodes.swap_remove(0),
            }),
            CampaignKind::SingleNodeRestart => Campaign::SingleNodeRestart(SingleNodeRestart {
                node: nodes.swap_remove(0),
            }),
            CampaignKind::FullClusterUpdate => {
                Campaign::FullClusterUpdate(FullClusterUpdate { nodes })
            }
            CampaignKind::FullClusterCertRestart => {
                Campaign::FullClusterCertRestart(FullClusterRestart { kind, nodes })
            }
            CampaignKind::FullClusterRestart => {
                Campaign::FullClusterRestart(FullClusterRestart { kind, nodes })
            }
        })
    }

    pub fn kind(&self) -> CampaignKind {
        match self {
            Campaign::RollingUpdate(_) => CampaignKind::RollingUpdate,
            Campaign::FullClusterUpdate(_) => CampaignKind::FullClusterUpdate,
            Campaign::FullClusterCertRestart(_) => CampaignKind::FullClusterCertRestart,
            Campaign::FullClusterRestart(_) => CampaignKind::FullClusterRestart,
            Campaign::SingleNodeRestart(_) => CampaignKind::SingleNodeRestart,
        }
    }

    pub fn nodes(&self) -> &[ManagedNode] {
        match self {
            Campaign::RollingUpdate(c) => std::slice::from_ref(&c.node),
            Campaign::SingleNodeRestart(c) => std::slice::from_ref(&c.node),
            Campaign::FullClusterUpdate(c) => &c.nodes,
            Campaign::FullClusterCertRestart(c) | Campaign::FullClusterRestart(c) => &c.nodes,
        }
    }

    /// Workload names of the campaign's nodes.
    pub fn node_names(&self) -> Vec<String> {
        self.nodes().iter().map(|n| n.name().to_string()).collect()
    }

    /// Give the nodes back, e.g. to the registry.
    pub fn into_nodes(self) -> Vec<ManagedNode> {
        match self {
            Campaign::RollingUpdate(c) => vec![c.node],
            Campaign::SingleNodeRestart(c) => vec![c.node],
            Campaign::FullClusterUpdate(c) => c.nodes,
            Campaign::FullClusterCertRestart(c) | Campaign::FullClusterRestart(c) => c.nodes,
        }
    }

    fn phases(&mut self) -> &mut dyn CampaignPhases {
        match self {
            Campaign::RollingUpdate(c) => c as &mut dyn CampaignPhases,
            Campaign::FullClusterUpdate(c) => c as &mut dyn CampaignPhases,
            Campaign::FullClusterCertRestart(c) => c as &mut dyn CampaignPhases,
            Campaign::FullClusterRestart(c) => c as &mut dyn CampaignPhases,
            Campaign::SingleNodeRestart(c) => c as &mut dyn CampaignPhases,
        }
    }

    /// Run the action of `stage`.
    pub async fn run_stage(&mut self, stage: Stage, env: &NodeEnv<'_>) -> Result<bool> {
        let phases = self.phases();
        match stage {
            Stage::Precheck => phases.precheck(env).await,
            Stage::Prep => phases.prep(env).await.map(|_| true),
            Stage::Main => phases.main(env).await.map(|_| true),
            Stage::Post => phases.post(env).await.map(|_| true),
            Stage::Recovery => phases.recovery(env).await.map(|_| true),
        }
    }
}

#[async_trait]
impl CampaignPhases for RollingUpdate {
    async fn precheck(&mut self, env: &NodeEnv<'_>) -> Result<bool> {
        health_gate(env, CampaignKind::RollingUpdate, std::slice::from_ref(&self.node)).await
    }

    async fn prep(&mut self, env: &NodeEnv<'_>) -> Result<()> {
        prepare_cluster(env, CampaignKind::RollingUpdate).await
    }

    async fn main(&mut self, env: &NodeEnv<'_>) -> Result<()> {
        self.node.progress_node_changes(env).await
    }

    async fn post(&mut self, env: &NodeEnv<'_>) -> Result<()> {
        rejoin_and_allocate(env, std::slice::from_ref(&self.node)).await
    }

    async fn recovery(&mut self, env: &NodeEnv<'_>) -> Result<()> {
        recover(env, std::slice::from_mut(&mut self.node)).await
    }
}

#[async_trait]
impl CampaignPhases for FullClusterUpdate {
    async fn precheck(&mut self, env: &NodeEnv<'_>) -> Result<bool> {
        health_gate(env, CampaignKind::FullClusterUpdate, &self.nodes).await
    }

    async fn prep(&mut self, env: &NodeEnv<'_>) -> Result<()> {
        prepare_cluster(env, CampaignKind::FullClusterUpdate).await
    }

    async fn main(&mut self, env: &NodeEnv<'_>) -> Result<()> {
        for node in &self.nodes {
            node.progress_node_changes(env).await?;
        }
        Ok(())
    }

    async fn post(&mut self, env: &NodeEnv<'_>) -> Result<()> {
        rejoin_and_allocate(env, &self.nodes).await
    }

    async fn recovery(&mut self, env: &NodeEnv<'_>) -> Result<()> {
        recover(env, &mut self.nodes).await
    }
}

#[async_trait]
impl CampaignPhases for FullClusterRestart {
    async fn precheck(&mut self, env: &NodeEnv<'_>) -> Result<bool> {
        health_gate(env, self.kind, &self.nodes).await
    }

    async fn prep(&mut self, env: &NodeEnv<'_>) -> Result<()> {
        prepare_cluster(env, self.kind).await
    }

    async fn main(&mut self, env: &NodeEnv<'_>) -> Result<()> {
        for node in &self.nodes {
            node.scale_down(env).await?;
        }

        let gateway = env.gateway;
        poll_until(env.polling, "cluster to become unreachable", || async move {
            Ok(gateway
                .get_cluster_node_count()
                .await
                .map_or(true, |count| count == 0))
        })
        .await?;

        for node in &self.nodes {
            node.scale_up(env).await?;
        }
        Ok(())
    }

    async fn post(&mut self, env: &NodeEnv<'_>) -> Result<()> {
        rejoin_and_allocate(env, &self.nodes).await
    }

    async fn recovery(&mut self, env: &NodeEnv<'_>) -> Result<()> {
        recover(env, &mut self.nodes).await
    }
}

#[async_trait]
impl CampaignPhases for SingleNodeRestart {
    async fn precheck(&mut self, env: &NodeEnv<'_>) -> Result<bool> {
        health_gate(
            env,
            CampaignKind::SingleNodeRestart,
            std::slice::from_ref(&self.node),
        )
        .await
    }

    async fn prep(&mut self, env: &NodeEnv<'_>) -> Result<()> {
        prepare_cluster(env, CampaignKind::SingleNodeRestart).await
    }

    async fn main(&mut self, env: &NodeEnv<'_>) -> Result<()> {
        self.node.scale_down(env).await?;
        self.node.wait_for_node_leave_cluster(env).await?;
        self.node.scale_up(env).await?;
        self.node.wait_for_node_rejoin_cluster(env).await
    }

    async fn post(&mut self, env: &NodeEnv<'_>) -> Result<()> {
        rejoin_and_allocate(env, std::slice::from_ref(&self.node)).await
    }

    async fn recovery(&mut self, env: &NodeEnv<'_>) -> Result<()> {
        recover(env, std::slice::from_mut(&mut self.node)).await
    }
}

// ============================================================================
// Shared stage actions
// ============================================================================

async fn current_health(env: &NodeEnv<'_>) -> ClusterHealth {
    env.gateway
        .get_cluster_health()
        .await
        .unwrap_or(ClusterHealth::Unknown)
}

async fn health_gate(env: &NodeEnv<'_>, kind: CampaignKind, nodes: &[ManagedNode]) -> Result<bool> {
    let names: Vec<&str> = nodes.iter().map(|n| n.name()).collect();
    if kind.requires_healthy_cluster() {
        let health = current_health(env).await;
        if !health.is_operational() {
            info!(campaign = %kind, nodes = ?names, health = %health, "Deferring restart until cluster is healthy");
            return Ok(false);
        }
    }
    info!(campaign = %kind, nodes = ?names, "Starting restart campaign");
    Ok(true)
}

/// Restrict allocation to primaries and flush, so restarted nodes recover
/// from local copies.
///
/// Allocation is only changed while the cluster is green or yellow.
async fn prepare_cluster(env: &NodeEnv<'_>, kind: CampaignKind) -> Result<()> {
    let health = current_health(env).await;
    if !kind.prep_mandatory() && health == ClusterHealth::Unknown {
        debug!(campaign = %kind, "Cluster unreachable, skipping preparation");
        return Ok(());
    }

    if health.is_operational() {
        if !env
            .gateway
            .set_shard_allocation(ShardAllocationMode::Primaries)
            .await?
        {
            return Err(Error::Transient(
                "shard allocation change to primaries was not acknowledged".to_string(),
            ));
        }
    } else {
        warn!(campaign = %kind, health = %health, "Leaving shard allocation unchanged");
    }

    if !env.gateway.do_synchronized_flush().await? {
        return Err(Error::Transient(
            "synchronized flush did not complete on every shard".to_string(),
        ));
    }
    Ok(())
}

/// Wait for every node to rejoin, then let replicas allocate again.
async fn rejoin_and_allocate(env: &NodeEnv<'_>, nodes: &[ManagedNode]) -> Result<()> {
    for node in nodes {
        node.wait_for_node_rejoin_cluster(env).await?;
    }
    if !env
        .gateway
        .set_shard_allocation(ShardAllocationMode::All)
        .await?
    {
        return Err(Error::Transient(
            "shard allocation change to all was not acknowledged".to_string(),
        ));
    }
    Ok(())
}

/// The campaign is over once the cluster is green or yellow again. The
/// restarted pods run with the current secret.
async fn recover(env: &NodeEnv<'_>, nodes: &mut [ManagedNode]) -> Result<()> {
    let health = current_health(env).await;
    if !health.is_operational() {
        return Err(Error::Transient(format!(
            "cluster health is {} after restart",
            health
        )));
    }
    for node in nodes.iter_mut() {
        if let Err(e) = node.refresh_hashes(env).await {
            warn!(node = %node.name(), error = %e, "Failed to record secret hash");
            return Err(e);
        }
    }
    Ok(())
}
