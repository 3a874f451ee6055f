//! Campaign tests: stage persistence, resumption and deferral.
//!
//! A campaign's progress lives only in the stored status. These tests
//! interrupt campaigns at different stages and check that the next
//! reconcile picks up exactly where the last one stopped.

use kube::ResourceExt;

use elasticsearch_operator::client::ClusterHealth;
use elasticsearch_operator::controller::campaign::{Campaign, CampaignKind};
use elasticsearch_operator::controller::error::Error;
use elasticsearch_operator::controller::node_registry::ClusterNodes;
use elasticsearch_operator::controller::restart::{
    RestartOutcome, reconcile_restarts, run_campaign,
};
use elasticsearch_operator::controller::status::set_condition;
use elasticsearch_operator::crd::{
    ConditionStatus, ConditionType, Elasticsearch, NodeRole, RESTART_ANNOTATION, UpgradePhase,
};
use elasticsearch_operator::resources::statefulset::partition;

use crate::mock_state::*;

/// Bootstrap a three-node cluster and make node 2 need new certificates.
async fn cluster_with_stale_node(mock: &MockCluster) -> (ClusterNodes, String) {
    let resource = data_cluster(3);
    bootstrap(mock, &resource).await;
    let stale = data_node(2);
    mock.mark_stale_secret(&stale);
    mock.clear_gateway_log();
    (ClusterNodes::default(), stale)
}

// ============================================================================
// Stage Persistence Tests
// ============================================================================

/// A failing restart leaves exactly the stages before it persisted, and
/// the next pass resumes at the failed stage without repeating Prep.
#[tokio::test]
async fn test_main_failure_persists_prior_stages() {
    let mock = MockCluster::new();
    let resource = data_cluster(3);
    let (mut nodes, stale) = cluster_with_stale_node(&mock).await;

    // The restarted pod never rejoins, so Main times out
    mock.never_join(&stale);
    let err = reconcile_once(&mock, &resource, &mut nodes)
        .await
        .unwrap_err();
    assert!(matches!(err, Error::Timeout { .. }));

    let upgrade = mock.status().upgrade_status(&stale);
    assert_eq!(upgrade.under_upgrade, ConditionStatus::True);
    assert_eq!(upgrade.upgrade_phase, UpgradePhase::PreparationComplete);
    assert_eq!(upgrade.scheduled_for_cert_redeploy, ConditionStatus::True);
    assert_eq!(mock.restart_log(), vec!["allocation:primaries", "flush"]);

    mock.allow_join(&stale);
    mock.clear_gateway_log();
    let report = reconcile_once(&mock, &resource, &mut nodes).await.unwrap();
    assert_eq!(
        report.restart,
        RestartOutcome::Completed(CampaignKind::SingleNodeRestart)
    );
    assert_eq!(mock.restart_log(), vec!["allocation:all"]);

    let upgrade = mock.status().upgrade_status(&stale);
    assert_eq!(upgrade.under_upgrade, ConditionStatus::Unknown);
    assert_eq!(upgrade.upgrade_phase, UpgradePhase::ControllerUpdated);
    assert_eq!(upgrade.scheduled_for_cert_redeploy, ConditionStatus::False);
}

/// Every stage writes its own transition.
#[tokio::test]
async fn test_each_stage_is_persisted() {
    let mock = MockCluster::new();
    let resource = data_cluster(3);
    let mut nodes = bootstrap(&mock, &resource).await;

    let target = data_node(1);
    let mut campaign =
        Campaign::new(CampaignKind::SingleNodeRestart, nodes.select(&[target.clone()])).unwrap();
    let writes_before = mock.state().status_writes;

    let outcome = run_campaign(&mut campaign, &mock.env(), &mock.recorder(), None)
        .await
        .unwrap();
    assert_eq!(
        outcome,
        RestartOutcome::Completed(CampaignKind::SingleNodeRestart)
    );
    assert_eq!(mock.state().status_writes - writes_before, 5);

    for node in campaign.into_nodes() {
        nodes.replace(node);
    }
    assert!(nodes.contains(&target));
}

/// A failed flush is only a warning; the restart goes ahead.
#[tokio::test]
async fn test_prep_failure_does_not_abort() {
    let mock = MockCluster::new();
    let resource = data_cluster(3);
    let (mut nodes, stale) = cluster_with_stale_node(&mock).await;
    mock.state().flush_succeeds = false;

    let report = reconcile_once(&mock, &resource, &mut nodes).await.unwrap();
    assert_eq!(
        report.restart,
        RestartOutcome::Completed(CampaignKind::SingleNodeRestart)
    );
    assert_eq!(
        mock.restart_log(),
        vec!["allocation:primaries", "flush", "allocation:all"]
    );
    assert_eq!(
        mock.status().upgrade_status(&stale).upgrade_phase,
        UpgradePhase::ControllerUpdated
    );
}

// ============================================================================
// Health Gate Tests
// ============================================================================

#[tokio::test]
async fn test_single_node_restart_deferred_while_red() {
    let mock = MockCluster::new();
    let resource = data_cluster(3);
    let (mut nodes, stale) = cluster_with_stale_node(&mock).await;

    mock.set_health(ClusterHealth::Red);
    let report = reconcile_once(&mock, &resource, &mut nodes).await.unwrap();
    assert_eq!(
        report.restart,
        RestartOutcome::Deferred(CampaignKind::SingleNodeRestart)
    );
    let upgrade = mock.status().upgrade_status(&stale);
    assert_eq!(upgrade.under_upgrade, ConditionStatus::Unknown);
    assert_eq!(upgrade.upgrade_phase, UpgradePhase::None);
    assert!(mock.restart_log().is_empty());
    assert!(mock.is_member(&stale));

    mock.set_health(ClusterHealth::Yellow);
    let report = reconcile_once(&mock, &resource, &mut nodes).await.unwrap();
    assert_eq!(
        report.restart,
        RestartOutcome::Completed(CampaignKind::SingleNodeRestart)
    );
}

/// Full restarts do not wait for health, but they only finish once the
/// cluster recovers.
#[tokio::test]
async fn test_full_restart_waits_in_recovery_until_healthy() {
    let mock = MockCluster::new();
    let mut resource = data_cluster(3);
    let mut nodes = bootstrap(&mock, &resource).await;

    resource
        .annotations_mut()
        .insert(RESTART_ANNOTATION.to_string(), "1".to_string());
    mock.set_health(ClusterHealth::Red);

    let err = reconcile_once(&mock, &resource, &mut nodes)
        .await
        .unwrap_err();
    assert!(matches!(err, Error::Transient(_)));
    // Allocation is left alone on a red cluster; only the flush is tried
    assert_eq!(mock.restart_log(), vec!["flush", "allocation:all"]);
    let status = mock.status();
    assert!(status.is_condition_true(ConditionType::Recovering));
    assert!(!status.is_condition_true(ConditionType::Restarting));
    for ordinal in 1..=3 {
        assert_eq!(
            status.upgrade_status(&data_node(ordinal)).upgrade_phase,
            UpgradePhase::RecoveringData
        );
    }

    mock.set_health(ClusterHealth::Green);
    mock.clear_gateway_log();
    let report = reconcile_once(&mock, &resource, &mut nodes).await.unwrap();
    assert_eq!(
        report.restart,
        RestartOutcome::Completed(CampaignKind::FullClusterRestart)
    );
    assert!(mock.restart_log().is_empty());
    assert!(!mock.status().is_condition_true(ConditionType::Recovering));
}

// ============================================================================
// Resumption Tests
// ============================================================================

/// A cluster campaign interrupted by an operator restart resumes from its
/// conditions with a fresh registry.
#[tokio::test]
async fn test_cluster_campaign_resumes_from_conditions() {
    let mock = MockCluster::new();
    let resource = data_cluster(3);
    bootstrap(&mock, &resource).await;

    {
        let mut state = mock.state();
        let status = &mut state.status;
        set_condition(
            status,
            ConditionType::Restarting,
            true,
            "FullClusterCertRestart",
            "restarting 3 nodes",
        );
        for ordinal in 1..=3 {
            let upgrade = &mut status.node_mut(&data_node(ordinal)).upgrade_status;
            upgrade.under_upgrade = ConditionStatus::True;
            upgrade.upgrade_phase = UpgradePhase::PreparationComplete;
        }
    }

    let mut nodes = ClusterNodes::default();
    let report = reconcile_once(&mock, &resource, &mut nodes).await.unwrap();
    assert_eq!(
        report.restart,
        RestartOutcome::Completed(CampaignKind::FullClusterCertRestart)
    );
    // Prep already ran before the interruption
    assert_eq!(mock.restart_log(), vec!["allocation:all"]);

    let status = mock.status();
    assert!(!status.is_condition_true(ConditionType::Restarting));
    assert!(!status.is_condition_true(ConditionType::Recovering));
    for ordinal in 1..=3 {
        let upgrade = status.upgrade_status(&data_node(ordinal));
        assert_eq!(upgrade.under_upgrade, ConditionStatus::Unknown);
        assert_eq!(upgrade.upgrade_phase, UpgradePhase::ControllerUpdated);
    }
}

/// The restart entry point returns lent nodes to the registry even when
/// the campaign fails.
#[tokio::test]
async fn test_nodes_returned_after_failed_campaign() {
    let mock = MockCluster::new();
    let resource = data_cluster(3);
    let mut nodes = bootstrap(&mock, &resource).await;

    mock.never_join(&data_node(1));
    let result = reconcile_restarts(&mut nodes, &mock.env(), &mock.recorder(), Some("1")).await;
    assert!(result.is_err());
    assert_eq!(nodes.names(), (1..=3).map(data_node).collect::<Vec<_>>());
}

/// A certificate restart cut short after its scale-down resumes as the same
/// restart, even though the node also has a template change pending.
#[tokio::test]
async fn test_interrupted_single_node_restart_keeps_its_kind() {
    let mock = MockCluster::new();
    let resource = data_cluster(3);
    let mut nodes = bootstrap(&mock, &resource).await;
    let target = data_node(2);

    {
        let mut state = mock.state();
        let upgrade = &mut state.status.node_mut(&target).upgrade_status;
        upgrade.under_upgrade = ConditionStatus::True;
        upgrade.scheduled_for_upgrade = ConditionStatus::True;
        upgrade.scheduled_for_cert_redeploy = ConditionStatus::True;
        upgrade.upgrade_phase = UpgradePhase::PreparationComplete;
        upgrade.campaign = Some(CampaignKind::SingleNodeRestart.to_string());

        // The operator stopped right after scaling the node to zero
        let deployment = state.deployments.get_mut(&target).unwrap();
        deployment.spec.as_mut().unwrap().replicas = Some(0);
    }
    assert!(!mock.is_member(&target));

    let report = reconcile_once(&mock, &resource, &mut nodes).await.unwrap();
    assert_eq!(
        report.restart,
        RestartOutcome::Completed(CampaignKind::SingleNodeRestart)
    );
    assert!(mock.is_member(&target));
    let deployment = mock.deployment(&target).unwrap();
    assert_eq!(deployment.spec.unwrap().replicas, Some(1));

    let upgrade = mock.status().upgrade_status(&target);
    assert_eq!(upgrade.upgrade_phase, UpgradePhase::ControllerUpdated);
    assert_eq!(upgrade.scheduled_for_cert_redeploy, ConditionStatus::False);
    assert!(upgrade.campaign.is_none());
}

// ============================================================================
// Replicated Rollout Tests
// ============================================================================

const MASTER_SET: &str = "logs-m-m0000001";

fn master_and_data_cluster() -> Elasticsearch {
    cluster_with(vec![
        node_group(&[NodeRole::Master], 3, "m0000001"),
        node_group(&[NodeRole::Data], 2, "d0000001"),
    ])
}

/// A template change freezes the StatefulSet at its replica count, then
/// releases one ordinal at a time from the highest down.
#[tokio::test]
async fn test_statefulset_rolls_out_by_partition() {
    let mock = MockCluster::new();
    let mut resource = master_and_data_cluster();
    let mut nodes = bootstrap(&mock, &resource).await;

    resource.spec.node_spec.image = "docker.elastic.co/elasticsearch/elasticsearch:6.8.24".to_string();
    let report = reconcile_once(&mock, &resource, &mut nodes).await.unwrap();
    assert_eq!(
        report.restart,
        RestartOutcome::Completed(CampaignKind::RollingUpdate)
    );

    assert_eq!(mock.partition_log(MASTER_SET), vec![3, 2, 1, 0]);
    assert_eq!(partition(&mock.statefulset(MASTER_SET).unwrap()), 0);
    for ordinal in 0..3 {
        assert!(mock.is_member(&format!("{}-{}", MASTER_SET, ordinal)));
    }

    let status = mock.status();
    let upgrade = status.upgrade_status(MASTER_SET);
    assert_eq!(upgrade.upgrade_phase, UpgradePhase::ControllerUpdated);
    assert_eq!(upgrade.scheduled_for_upgrade, ConditionStatus::False);
    // The data nodes wait for their own passes
    assert_eq!(
        status.upgrade_status("logs-d-d0000001-1").scheduled_for_upgrade,
        ConditionStatus::True
    );
}

/// A replica that does not rejoin stops the rollout at its ordinal; the
/// next pass continues from there instead of starting over.
#[tokio::test]
async fn test_statefulset_rollout_resumes_at_partition() {
    let mock = MockCluster::new();
    let mut resource = master_and_data_cluster();
    let mut nodes = bootstrap(&mock, &resource).await;

    let stuck = format!("{}-1", MASTER_SET);
    resource.spec.node_spec.image = "docker.elastic.co/elasticsearch/elasticsearch:6.8.24".to_string();
    mock.never_join(&stuck);
    let err = reconcile_once(&mock, &resource, &mut nodes)
        .await
        .unwrap_err();
    assert!(matches!(err, Error::Timeout { .. }));
    assert_eq!(mock.partition_log(MASTER_SET), vec![3, 2, 1]);
    assert_eq!(
        mock.status().upgrade_status(MASTER_SET).upgrade_phase,
        UpgradePhase::PreparationComplete
    );

    mock.allow_join(&stuck);
    let report = reconcile_once(&mock, &resource, &mut nodes).await.unwrap();
    assert_eq!(
        report.restart,
        RestartOutcome::Completed(CampaignKind::RollingUpdate)
    );
    assert_eq!(mock.partition_log(MASTER_SET), vec![3, 2, 1, 0]);
    assert_eq!(
        mock.status().upgrade_status(MASTER_SET).upgrade_phase,
        UpgradePhase::ControllerUpdated
    );
}
