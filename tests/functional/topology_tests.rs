//! Topology tests: node creation, guarded deletion and master quorum.

use elasticsearch_operator::client::ClusterHealth;
use elasticsearch_operator::controller::error::Error;
use elasticsearch_operator::controller::node_registry::ClusterNodes;
use elasticsearch_operator::crd::{ConditionType, ElasticsearchStatus, NodeRole, RedundancyPolicy};
use elasticsearch_operator::resources::statefulset::replicas;

use crate::mock_state::*;

fn condition_reason(status: &ElasticsearchStatus, condition_type: ConditionType) -> Option<String> {
    let wanted = condition_type.to_string();
    status
        .conditions
        .iter()
        .find(|c| c.r#type == wanted && c.status == "True")
        .map(|c| c.reason.clone())
}

// ============================================================================
// Creation Tests
// ============================================================================

#[tokio::test]
async fn test_data_group_gets_one_deployment_per_node() {
    let mock = MockCluster::new();
    let resource = data_cluster(3);
    let mut nodes = ClusterNodes::default();

    let report = reconcile_once(&mock, &resource, &mut nodes).await.unwrap();
    let expected: Vec<String> = (1..=3).map(data_node).collect();
    assert_eq!(report.topology.created, expected);
    assert_eq!(mock.deployment_names(), expected);
    assert_eq!(
        condition_reason(&mock.status(), ConditionType::ScalingUp).as_deref(),
        Some("NodesCreated")
    );

    // Nothing new on the next pass
    let report = reconcile_once(&mock, &resource, &mut nodes).await.unwrap();
    assert!(report.topology.created.is_empty());
    assert!(condition_reason(&mock.status(), ConditionType::ScalingUp).is_none());
}

#[tokio::test]
async fn test_master_group_uses_statefulset() {
    let mock = MockCluster::new();
    let resource = cluster_with(vec![
        node_group(&[NodeRole::Master], 3, "m0000001"),
        node_group(&[NodeRole::Data], 2, "d0000001"),
    ]);
    let mut nodes = ClusterNodes::default();
    reconcile_once(&mock, &resource, &mut nodes).await.unwrap();

    let sts = mock.statefulset("logs-m-m0000001").unwrap();
    assert_eq!(replicas(&sts), 3);
    assert_eq!(
        mock.deployment_names(),
        vec!["logs-d-d0000001-1".to_string(), "logs-d-d0000001-2".to_string()]
    );
    for ordinal in 0..3 {
        assert!(mock.is_member(&format!("logs-m-m0000001-{}", ordinal)));
    }
    assert_eq!(nodes.names().len(), 3);

    // Three masters joined, so the quorum is raised to two
    assert_eq!(mock.state().min_master_nodes, 2);
}

#[tokio::test]
async fn test_master_statefulset_resized_in_place() {
    let mock = MockCluster::new();
    let mut resource = cluster_with(vec![
        node_group(&[NodeRole::Master], 3, "m0000001"),
        node_group(&[NodeRole::Data], 2, "d0000001"),
    ]);
    let mut nodes = ClusterNodes::default();
    reconcile_once(&mock, &resource, &mut nodes).await.unwrap();

    resource.spec.nodes[0].node_count = 1;
    let report = reconcile_once(&mock, &resource, &mut nodes).await.unwrap();
    assert_eq!(
        report.topology.deleted,
        vec!["logs-m-m0000001-1".to_string(), "logs-m-m0000001-2".to_string()]
    );
    assert_eq!(replicas(&mock.statefulset("logs-m-m0000001").unwrap()), 1);
    assert!(mock.is_member("logs-m-m0000001-0"));
    assert!(!mock.is_member("logs-m-m0000001-2"));
    assert_eq!(mock.state().min_master_nodes, 1);

    // Growing back is not a removal and needs no gate
    resource.spec.nodes[0].node_count = 2;
    let report = reconcile_once(&mock, &resource, &mut nodes).await.unwrap();
    assert!(report.topology.deleted.is_empty());
    assert_eq!(replicas(&mock.statefulset("logs-m-m0000001").unwrap()), 2);
}

#[tokio::test]
async fn test_master_statefulset_shrink_deferred_while_red() {
    let mock = MockCluster::new();
    let mut resource = cluster_with(vec![
        node_group(&[NodeRole::Master], 3, "m0000001"),
        node_group(&[NodeRole::Data], 2, "d0000001"),
    ]);
    let mut nodes = ClusterNodes::default();
    reconcile_once(&mock, &resource, &mut nodes).await.unwrap();
    assert_eq!(mock.state().min_master_nodes, 2);

    mock.set_health(ClusterHealth::Red);
    resource.spec.nodes[0].node_count = 1;
    let report = reconcile_once(&mock, &resource, &mut nodes).await.unwrap();
    assert_eq!(
        report.topology.pending_deletion,
        vec!["logs-m-m0000001-1".to_string(), "logs-m-m0000001-2".to_string()]
    );
    assert!(report.topology.deleted.is_empty());
    assert_eq!(replicas(&mock.statefulset("logs-m-m0000001").unwrap()), 3);
    assert_eq!(mock.state().min_master_nodes, 2);
    assert_eq!(
        condition_reason(&mock.status(), ConditionType::ScalingDown).as_deref(),
        Some("DeletionDeferred")
    );

    mock.set_health(ClusterHealth::Green);
    mock.clear_gateway_log();
    let report = reconcile_once(&mock, &resource, &mut nodes).await.unwrap();
    assert_eq!(report.topology.deleted.len(), 2);
    assert_eq!(replicas(&mock.statefulset("logs-m-m0000001").unwrap()), 1);
    assert_eq!(mock.state().min_master_nodes, 1);
    assert_eq!(mock.gateway_log().first().map(String::as_str), Some("min_master_nodes:1"));
    assert!(condition_reason(&mock.status(), ConditionType::ScalingDown).is_none());
}

#[tokio::test]
async fn test_quorum_not_raised_until_masters_join() {
    let mock = MockCluster::new();
    mock.never_join(&data_node(3));
    let resource = data_cluster(3);
    let mut nodes = ClusterNodes::default();

    reconcile_once(&mock, &resource, &mut nodes).await.unwrap();
    assert_eq!(mock.state().min_master_nodes, 1);

    mock.allow_join(&data_node(3));
    reconcile_once(&mock, &resource, &mut nodes).await.unwrap();
    assert_eq!(mock.state().min_master_nodes, 2);
}

// ============================================================================
// Deletion Tests
// ============================================================================

#[tokio::test]
async fn test_deletion_deferred_while_red() {
    let mock = MockCluster::new();
    let mut resource = data_cluster(3);
    let mut nodes = bootstrap(&mock, &resource).await;

    mock.set_health(ClusterHealth::Red);
    resource.spec.nodes[0].node_count = 2;
    let report = reconcile_once(&mock, &resource, &mut nodes).await.unwrap();
    assert_eq!(report.topology.pending_deletion, vec![data_node(3)]);
    assert!(report.topology.deleted.is_empty());
    assert!(mock.deployment(&data_node(3)).is_some());
    assert_eq!(
        condition_reason(&mock.status(), ConditionType::ScalingDown).as_deref(),
        Some("DeletionDeferred")
    );

    mock.set_health(ClusterHealth::Green);
    let report = reconcile_once(&mock, &resource, &mut nodes).await.unwrap();
    assert_eq!(report.topology.deleted, vec![data_node(3)]);
    assert!(mock.deployment(&data_node(3)).is_none());
    assert!(!nodes.contains(&data_node(3)));
    assert!(condition_reason(&mock.status(), ConditionType::ScalingDown).is_none());
    assert_eq!(mock.status().nodes.len(), 2);
}

#[tokio::test]
async fn test_deletion_deferred_while_unreachable() {
    let mock = MockCluster::new();
    let mut resource = data_cluster(3);
    let mut nodes = bootstrap(&mock, &resource).await;

    mock.state().unreachable = true;
    resource.spec.nodes[0].node_count = 2;
    let report = reconcile_once(&mock, &resource, &mut nodes).await.unwrap();
    assert_eq!(report.topology.pending_deletion, vec![data_node(3)]);
    assert!(mock.deployment(&data_node(3)).is_some());
}

#[tokio::test]
async fn test_scale_down_keeping_room_for_replicas() {
    let mock = MockCluster::new();
    let mut resource = data_cluster(3);
    resource.spec.redundancy_policy = RedundancyPolicy::ZeroRedundancy;
    let mut nodes = bootstrap(&mock, &resource).await;
    mock.add_index("logs", 1, false);

    resource.spec.nodes[0].node_count = 2;
    let report = reconcile_once(&mock, &resource, &mut nodes).await.unwrap();
    assert_eq!(report.topology.deleted, vec![data_node(3)]);
}

#[tokio::test]
async fn test_scale_down_below_replica_count_rejected() {
    let mock = MockCluster::new();
    let mut resource = data_cluster(3);
    resource.spec.redundancy_policy = RedundancyPolicy::ZeroRedundancy;
    let mut nodes = bootstrap(&mock, &resource).await;
    mock.add_index("logs", 1, false);

    resource.spec.nodes[0].node_count = 1;
    let err = reconcile_once(&mock, &resource, &mut nodes)
        .await
        .unwrap_err();
    assert!(matches!(err, Error::Validation(ref message) if message.contains("logs")));
    assert_eq!(mock.deployment_names().len(), 3);
}

#[tokio::test]
async fn test_master_quorum_lowered_before_deletion() {
    let mock = MockCluster::new();
    let mut resource = data_cluster(3);
    resource.spec.redundancy_policy = RedundancyPolicy::ZeroRedundancy;
    let mut nodes = bootstrap(&mock, &resource).await;
    assert_eq!(mock.state().min_master_nodes, 2);
    mock.clear_gateway_log();

    resource.spec.nodes[0].node_count = 1;
    let report = reconcile_once(&mock, &resource, &mut nodes).await.unwrap();
    assert_eq!(report.topology.deleted, vec![data_node(2), data_node(3)]);
    assert_eq!(mock.state().min_master_nodes, 1);
    assert!(mock.gateway_log().contains(&"min_master_nodes:1".to_string()));
}
