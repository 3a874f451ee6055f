//! Restart orchestration.
//!
//! Each reconcile records what every node needs (new template, new
//! certificates), picks at most one campaign and drives it through every
//! stage whose guard holds. Each completed stage is persisted before the next
//! one starts, so the persisted flags always describe exactly the stages that
//! finished.

use semver::Version;
use tracing::{debug, info, warn};

use crate::client::ClusterHealthGateway;
use crate::controller::campaign::{Campaign, CampaignKind, Stage};
use crate::controller::error::Result;
use crate::controller::managed_node::{NodeEnv, NodeOperations};
use crate::controller::node_registry::ClusterNodes;
use crate::controller::status::{
    StatusRecorder, get_condition_reason, is_condition_true, set_condition,
};
use crate::crd::{
    ConditionStatus, ConditionType, ElasticsearchStatus, NodeStatus, NodeUpgradeStatus,
    UpgradePhase,
};

/// Oldest Elasticsearch version that can mix versions during a rolling update.
pub const MIN_ROLLING_VERSION: Version = Version::new(5, 6, 0);

/// Conditions that mark an in-flight cluster campaign.
const CLUSTER_CAMPAIGN_CONDITIONS: [ConditionType; 3] = [
    ConditionType::UpdatingESSettings,
    ConditionType::Restarting,
    ConditionType::Recovering,
];

/// A campaign picked for this reconcile.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct CampaignSelection {
    pub kind: CampaignKind,
    pub nodes: Vec<String>,
}

/// Result of one orchestration pass.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum RestartOutcome {
    /// Nothing to do.
    Idle,
    /// A campaign is waiting for a healthy cluster.
    Deferred(CampaignKind),
    /// A campaign ran to the end.
    Completed(CampaignKind),
}

/// Merge observed node state into the status.
///
/// The node list is rebuilt in registry order. Scheduling flags are only
/// ever raised here; Recovery is what lowers them.
pub fn merge_node_states(status: &mut ElasticsearchStatus, observed: &[(NodeStatus, NodeUpgradeStatus)]) {
    let mut merged = Vec::with_capacity(observed.len());
    for (entry, state) in observed {
        let mut node = status
            .node(entry.name())
            .map(|existing| NodeStatus {
                upgrade_status: existing.upgrade_status.clone(),
                ..entry.clone()
            })
            .unwrap_or_else(|| entry.clone());

        if state.scheduled_for_upgrade.is_true() {
            node.upgrade_status.scheduled_for_upgrade = ConditionStatus::True;
        }
        if state.scheduled_for_cert_redeploy.is_true() {
            node.upgrade_status.scheduled_for_cert_redeploy = ConditionStatus::True;
        }
        merged.push(node);
    }
    status.nodes = merged;
}

/// Record each node's scheduling state in the status.
pub async fn record_node_states(
    nodes: &ClusterNodes,
    env: &NodeEnv<'_>,
    recorder: &StatusRecorder<'_>,
) -> Result<ElasticsearchStatus> {
    let mut observed = Vec::with_capacity(nodes.len());
    for node in nodes.iter() {
        observed.push((node.status_entry(), node.state(env).await?));
    }
    recorder
        .update(|status| merge_node_states(status, &observed))
        .await
}

/// Pick the campaign to run, if any.
///
/// In order: an in-flight cluster campaign, the first node under upgrade,
/// a full certificate restart when every node needs one, a requested full
/// restart, a single-node certificate restart, then template updates.
pub fn select_campaign(
    status: &ElasticsearchStatus,
    nodes: &[String],
    restart_request: Option<&str>,
    rolling_supported: bool,
) -> Option<CampaignSelection> {
    if nodes.is_empty() {
        return None;
    }

    if let Some(condition_type) = CLUSTER_CAMPAIGN_CONDITIONS
        .into_iter()
        .find(|t| is_condition_true(&status.conditions, *t))
    {
        let kind = get_condition_reason(&status.conditions, condition_type)
            .and_then(CampaignKind::from_reason)
            .filter(CampaignKind::is_cluster_scope)
            .unwrap_or(CampaignKind::FullClusterRestart);
        let mut members: Vec<String> = nodes
            .iter()
            .filter(|n| status.upgrade_status(n).is_under_upgrade())
            .cloned()
            .collect();
        if members.is_empty() {
            members = nodes.to_vec();
        }
        return Some(CampaignSelection {
            kind,
            nodes: members,
        });
    }

    if let Some(name) = nodes
        .iter()
        .find(|n| status.upgrade_status(n).is_under_upgrade())
    {
        let upgrade = status.upgrade_status(name);
        // Resume the kind that started; a restart must not turn into a rollout
        let kind = upgrade
            .campaign
            .as_deref()
            .and_then(CampaignKind::from_reason)
            .filter(|k| !k.is_cluster_scope())
            .unwrap_or(if upgrade.scheduled_for_cert_redeploy.is_true() {
                CampaignKind::SingleNodeRestart
            } else {
                CampaignKind::RollingUpdate
            });
        return Some(CampaignSelection {
            kind,
            nodes: vec![name.clone()],
        });
    }

    let cert_scheduled: Vec<&String> = nodes
        .iter()
        .filter(|n| {
            status
                .upgrade_status(n)
                .scheduled_for_cert_redeploy
                .is_true()
        })
        .collect();
    if cert_scheduled.len() == nodes.len() {
        return Some(CampaignSelection {
            kind: CampaignKind::FullClusterCertRestart,
            nodes: nodes.to_vec(),
        });
    }

    if let Some(request) = restart_request
        && status.last_restart_request.as_deref() != Some(request)
    {
        return Some(CampaignSelection {
            kind: CampaignKind::FullClusterRestart,
            nodes: nodes.to_vec(),
        });
    }

    if let Some(name) = cert_scheduled.first() {
        return Some(CampaignSelection {
            kind: CampaignKind::SingleNodeRestart,
            nodes: vec![(*name).clone()],
        });
    }

    let upgrade_scheduled: Vec<String> = nodes
        .iter()
        .filter(|n| status.upgrade_status(n).scheduled_for_upgrade.is_true())
        .cloned()
        .collect();
    if upgrade_scheduled.is_empty() {
        return None;
    }
    if rolling_supported {
        Some(CampaignSelection {
            kind: CampaignKind::RollingUpdate,
            nodes: upgrade_scheduled.into_iter().take(1).collect(),
        })
    } else {
        Some(CampaignSelection {
            kind: CampaignKind::FullClusterUpdate,
            nodes: upgrade_scheduled,
        })
    }
}

/// Whether every node runs a version that supports rolling updates.
///
/// An unreachable cluster counts as capable; rolling campaigns wait for a
/// healthy cluster before touching anything.
pub async fn supports_rolling_update(gateway: &dyn ClusterHealthGateway) -> bool {
    match gateway.get_lowest_node_version().await {
        Ok(version) => version >= MIN_ROLLING_VERSION,
        Err(e) => {
            debug!(error = %e, "Cannot read node versions, assuming rolling updates work");
            true
        }
    }
}

fn finish_node(upgrade: &mut NodeUpgradeStatus, kind: CampaignKind) {
    upgrade.under_upgrade = ConditionStatus::Unknown;
    upgrade.upgrade_phase = UpgradePhase::ControllerUpdated;
    upgrade.campaign = None;
    upgrade.scheduled_for_cert_redeploy = ConditionStatus::False;
    if kind.applies_template() {
        upgrade.scheduled_for_upgrade = ConditionStatus::False;
    }
}

/// Persisted transition after `stage` of a `kind` campaign over `nodes`.
pub fn apply_signal(
    status: &mut ElasticsearchStatus,
    stage: Stage,
    kind: CampaignKind,
    nodes: &[String],
    restart_request: Option<&str>,
) {
    let reason = kind.reason();

    if kind.is_cluster_scope() {
        let message = format!("{} of {} nodes", kind, nodes.len());
        match stage {
            Stage::Precheck => {
                set_condition(status, ConditionType::UpdatingESSettings, true, reason, &message);
                if kind == CampaignKind::FullClusterRestart {
                    status.last_restart_request = restart_request.map(str::to_string);
                }
            }
            Stage::Prep => {
                set_condition(status, ConditionType::UpdatingESSettings, false, reason, &message);
                set_condition(status, ConditionType::Restarting, true, reason, &message);
            }
            Stage::Main => {}
            Stage::Post => {
                set_condition(status, ConditionType::Restarting, false, reason, &message);
                set_condition(status, ConditionType::Recovering, true, reason, &message);
            }
            Stage::Recovery => {
                set_condition(status, ConditionType::Recovering, false, reason, &message);
            }
        }
    }

    for name in nodes {
        let upgrade = &mut status.node_mut(name).upgrade_status;
        match stage {
            Stage::Precheck => {
                upgrade.under_upgrade = ConditionStatus::True;
                upgrade.campaign = Some(reason.to_string());
            }
            Stage::Prep => upgrade.upgrade_phase = UpgradePhase::PreparationComplete,
            Stage::Main => upgrade.upgrade_phase = UpgradePhase::NodeRestarting,
            Stage::Post => upgrade.upgrade_phase = UpgradePhase::RecoveringData,
            Stage::Recovery => finish_node(upgrade, kind),
        }
    }
}

fn stage_holds(status: &ElasticsearchStatus, stage: Stage, kind: CampaignKind, nodes: &[String]) -> bool {
    if kind.is_cluster_scope() {
        stage.cluster_guard(status, nodes)
    } else {
        nodes
            .first()
            .is_some_and(|n| stage.node_guard(&status.upgrade_status(n)))
    }
}

/// Drive `campaign` through every stage whose guard holds.
///
/// Stops at the first failing stage, except Prep whose failure is only
/// logged. A stage's transition is persisted as soon as its action succeeds.
pub async fn run_campaign(
    campaign: &mut Campaign,
    env: &NodeEnv<'_>,
    recorder: &StatusRecorder<'_>,
    restart_request: Option<&str>,
) -> Result<RestartOutcome> {
    let kind = campaign.kind();
    let names = campaign.node_names();
    let mut status = recorder.current().await?;

    for stage in Stage::ALL {
        if !stage_holds(&status, stage, kind, &names) {
            continue;
        }
        debug!(campaign = %kind, stage = %stage, nodes = ?names, "Running campaign stage");

        match campaign.run_stage(stage, env).await {
            Ok(true) => {}
            Ok(false) => return Ok(RestartOutcome::Deferred(kind)),
            Err(e) if stage == Stage::Prep => {
                warn!(campaign = %kind, error = %e, "Preparation failed, continuing restart");
            }
            Err(e) => {
                warn!(campaign = %kind, stage = %stage, error = %e, "Campaign stage failed");
                return Err(e);
            }
        }

        status = recorder
            .update(|s| apply_signal(s, stage, kind, &names, restart_request))
            .await?;
    }

    info!(campaign = %kind, nodes = ?names, "Restart campaign completed");
    Ok(RestartOutcome::Completed(kind))
}

/// Record node state, then select and run at most one campaign.
///
/// Nodes are lent to the campaign and always returned to the registry, so
/// hashes refreshed before a failure are not lost.
pub async fn reconcile_restarts(
    nodes: &mut ClusterNodes,
    env: &NodeEnv<'_>,
    recorder: &StatusRecorder<'_>,
    restart_request: Option<&str>,
) -> Result<RestartOutcome> {
    let status = record_node_states(nodes, env, recorder).await?;
    let names = nodes.names();

    let upgrades_pending = names
        .iter()
        .any(|n| status.upgrade_status(n).scheduled_for_upgrade.is_true());
    let rolling_supported = !upgrades_pending || supports_rolling_update(env.gateway).await;

    let Some(selection) = select_campaign(&status, &names, restart_request, rolling_supported)
    else {
        return Ok(RestartOutcome::Idle);
    };

    let mut campaign = Campaign::new(selection.kind, nodes.select(&selection.nodes))?;
    let result = run_campaign(&mut campaign, env, recorder, restart_request).await;
    for node in campaign.into_nodes() {
        nodes.replace(node);
    }
    result
}
