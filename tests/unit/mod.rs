//! Unit tests for elasticsearch-operator.
//!
//! These tests run without a Kubernetes cluster and test individual
//! components in isolation.

mod crd_tests {
    use elasticsearch_operator::crd::{
        Condition, ConditionStatus, ConditionType, ElasticsearchStatus, NodeUpgradeStatus,
        RedundancyPolicy, UpgradePhase,
    };

    #[test]
    fn test_upgrade_phase_display() {
        assert_eq!(UpgradePhase::None.to_string(), "");
        assert_eq!(UpgradePhase::ControllerUpdated.to_string(), "ControllerUpdated");
        assert_eq!(UpgradePhase::PreparationComplete.to_string(), "PreparationComplete");
        assert_eq!(UpgradePhase::NodeRestarting.to_string(), "NodeRestarting");
        assert_eq!(UpgradePhase::RecoveringData.to_string(), "RecoveringData");
    }

    #[test]
    fn test_both_idle_phases() {
        assert!(UpgradePhase::None.is_idle());
        assert!(UpgradePhase::ControllerUpdated.is_idle());
        assert!(!UpgradePhase::NodeRestarting.is_idle());
    }

    #[test]
    fn test_condition_new() {
        let condition = Condition::new(
            ConditionType::Restarting,
            true,
            "FullClusterRestart",
            "restarting 3 nodes",
        );
        assert_eq!(condition.r#type, "Restarting");
        assert_eq!(condition.status, "True");
        assert_eq!(condition.reason, "FullClusterRestart");
        assert!(!condition.last_transition_time.is_empty());
    }

    #[test]
    fn test_condition_status_serialization() {
        let status = NodeUpgradeStatus {
            under_upgrade: ConditionStatus::True,
            scheduled_for_upgrade: ConditionStatus::False,
            ..Default::default()
        };
        let json = serde_json::to_value(&status).unwrap();
        assert_eq!(json["underUpgrade"], "True");
        assert_eq!(json["scheduledForUpgrade"], "False");
        assert!(json.get("scheduledForCertRedeploy").is_none());
        assert_eq!(json["upgradePhase"], "");
    }

    #[test]
    fn test_status_node_lookup_creates_entry() {
        let mut status = ElasticsearchStatus::default();
        status.node_mut("logs-dm-abcd1234-1").upgrade_status.under_upgrade =
            ConditionStatus::True;
        assert_eq!(status.nodes.len(), 1);
        assert!(status.upgrade_status("logs-dm-abcd1234-1").is_under_upgrade());
        assert_eq!(status.upgrade_status("missing"), NodeUpgradeStatus::default());
    }

    #[test]
    fn test_redundancy_replicas() {
        assert_eq!(RedundancyPolicy::ZeroRedundancy.replica_count(5), 0);
        assert_eq!(RedundancyPolicy::SingleRedundancy.replica_count(5), 1);
        assert_eq!(RedundancyPolicy::MultipleRedundancy.replica_count(5), 2);
        assert_eq!(RedundancyPolicy::FullRedundancy.replica_count(5), 4);
        assert_eq!(RedundancyPolicy::default(), RedundancyPolicy::SingleRedundancy);
    }
}

mod naming_tests {
    use elasticsearch_operator::crd::{ElasticsearchNode, NodeRole};
    use elasticsearch_operator::resources::common::{
        hash_bytes, node_group_name, role_suffix, scalable_node_name,
    };

    #[test]
    fn test_role_suffix_is_sorted() {
        assert_eq!(role_suffix(&[NodeRole::Master, NodeRole::Client]), "cm");
        assert_eq!(
            role_suffix(&[NodeRole::Master, NodeRole::Data, NodeRole::Client]),
            "cdm"
        );
        assert_eq!(role_suffix(&[NodeRole::Data, NodeRole::Data]), "d");
    }

    #[test]
    fn test_workload_names() {
        let node = ElasticsearchNode {
            roles: vec![NodeRole::Data, NodeRole::Master],
            node_count: 3,
            ..Default::default()
        };
        let group = node_group_name("logs", &node, "abcd1234");
        assert_eq!(group, "logs-dm-abcd1234");
        assert_eq!(scalable_node_name(&group, 2), "logs-dm-abcd1234-2");
    }

    #[test]
    fn test_hash_is_stable_and_short() {
        let first = hash_bytes(b"tls.crt");
        assert_eq!(first, hash_bytes(b"tls.crt"));
        assert_ne!(first, hash_bytes(b"tls.key"));
        assert_eq!(first.len(), 16);
    }
}

mod validation_tests {
    use std::collections::BTreeMap;

    use elasticsearch_operator::controller::error::Error;
    use elasticsearch_operator::controller::validation::{
        crontab_from_interval, validate_masters, validate_scale_down, validate_spec,
    };
    use elasticsearch_operator::crd::{
        ConditionType, ElasticsearchNode, ElasticsearchSpec, NodeRole, RedundancyPolicy,
    };

    fn spec(groups: &[(&[NodeRole], i32)]) -> ElasticsearchSpec {
        ElasticsearchSpec {
            nodes: groups
                .iter()
                .map(|(roles, count)| ElasticsearchNode {
                    roles: roles.to_vec(),
                    node_count: *count,
                    ..Default::default()
                })
                .collect(),
            ..Default::default()
        }
    }

    #[test]
    fn test_valid_spec() {
        let spec = spec(&[(&[NodeRole::Master, NodeRole::Data], 3)]);
        assert!(validate_spec(&spec).is_empty());
    }

    #[test]
    fn test_every_rule_reported() {
        let mut spec = spec(&[(&[NodeRole::Client], 2)]);
        spec.redundancy_policy = RedundancyPolicy::FullRedundancy;
        let conditions: Vec<ConditionType> =
            validate_spec(&spec).iter().map(|v| v.condition).collect();
        assert_eq!(
            conditions,
            vec![
                ConditionType::InvalidRedundancy,
                ConditionType::InvalidMasters,
                ConditionType::InvalidData,
            ]
        );
    }

    #[test]
    fn test_master_bounds() {
        assert!(validate_masters(0).is_some());
        assert!(validate_masters(1).is_none());
        assert!(validate_masters(3).is_none());
        assert_eq!(validate_masters(4).unwrap().reason, "TooManyMasterNodes");
    }

    #[test]
    fn test_scale_down_leaves_room_for_replicas() {
        let mut replicas = BTreeMap::new();
        replicas.insert("logs".to_string(), 1);
        assert!(validate_scale_down(2, &replicas).is_none());
        let violation = validate_scale_down(1, &replicas).unwrap();
        assert_eq!(violation.reason, "UnsafeScaleDown");
        assert!(violation.message.contains("logs"));
    }

    #[test]
    fn test_crontab_from_interval() {
        assert_eq!(crontab_from_interval("8m").unwrap(), "*/8 * * * *");
        assert_eq!(crontab_from_interval("2h").unwrap(), "0 */2 * * *");
        assert!(matches!(
            crontab_from_interval("15wk"),
            Err(Error::Validation(_))
        ));
        assert!(crontab_from_interval("m").is_err());
        assert!(crontab_from_interval("0m").is_err());
    }
}

mod uuid_tests {
    use elasticsearch_operator::controller::topology::{
        UUID_LENGTH, assign_uuids, generate_uuid, validate_uuids,
    };
    use elasticsearch_operator::crd::{
        ConditionType, ElasticsearchNode, ElasticsearchSpec, ElasticsearchStatus, NodeRole,
    };

    fn group(uuid: Option<&str>) -> ElasticsearchNode {
        ElasticsearchNode {
            roles: vec![NodeRole::Master, NodeRole::Data],
            node_count: 1,
            gen_uuid: uuid.map(str::to_string),
            ..Default::default()
        }
    }

    fn status_with(uuids: &[&str]) -> ElasticsearchStatus {
        let mut status = ElasticsearchStatus::default();
        for (i, uuid) in uuids.iter().enumerate() {
            status.node_mut(&format!("node-{}", i)).gen_uuid = Some(uuid.to_string());
        }
        status
    }

    #[test]
    fn test_generated_uuid_shape() {
        let uuid = generate_uuid();
        assert_eq!(uuid.len(), UUID_LENGTH);
        assert!(uuid.chars().all(|c| c.is_ascii_hexdigit()));
    }

    #[test]
    fn test_assign_only_missing() {
        let mut spec = ElasticsearchSpec {
            nodes: vec![group(Some("abcd1234")), group(None)],
            ..Default::default()
        };
        assert!(assign_uuids(&mut spec));
        assert_eq!(spec.nodes[0].gen_uuid.as_deref(), Some("abcd1234"));
        assert!(spec.nodes[1].gen_uuid.is_some());
        assert!(!assign_uuids(&mut spec));
    }

    #[test]
    fn test_replaced_uuid_is_flagged() {
        let spec = ElasticsearchSpec {
            nodes: vec![group(Some("ffff0000"))],
            ..Default::default()
        };
        let violation = validate_uuids(&spec, &status_with(&["abcd1234"])).unwrap();
        assert_eq!(violation.condition, ConditionType::InvalidUUID);
    }

    #[test]
    fn test_added_group_is_allowed() {
        let added = ElasticsearchSpec {
            nodes: vec![group(Some("abcd1234")), group(Some("ffff0000"))],
            ..Default::default()
        };
        assert!(validate_uuids(&added, &status_with(&["abcd1234"])).is_none());
    }

    #[test]
    fn test_dropped_group_is_flagged() {
        let removed = ElasticsearchSpec {
            nodes: vec![group(Some("abcd1234"))],
            ..Default::default()
        };
        let violation = validate_uuids(&removed, &status_with(&["abcd1234", "ffff0000"])).unwrap();
        assert_eq!(violation.condition, ConditionType::InvalidUUID);
        assert!(violation.message.contains("ffff0000"));
    }

    #[test]
    fn test_group_scaled_to_zero_keeps_its_uuid_declared() {
        let mut retired = group(Some("ffff0000"));
        retired.node_count = 0;
        let spec = ElasticsearchSpec {
            nodes: vec![group(Some("abcd1234")), retired],
            ..Default::default()
        };
        assert!(validate_uuids(&spec, &status_with(&["abcd1234", "ffff0000"])).is_none());
    }
}

mod parsing_tests {
    use elasticsearch_operator::client::parsing::{
        lookup_setting, parse_byte_size, parse_watermark, setting_as_i32,
    };
    use elasticsearch_operator::client::{ClusterHealth, ShardAllocationMode, Watermark};

    #[test]
    fn test_byte_sizes() {
        assert_eq!(parse_byte_size("1024").unwrap(), 1024);
        assert_eq!(parse_byte_size("512mb").unwrap(), 512 * 1024 * 1024);
        assert_eq!(parse_byte_size("1.5GB").unwrap(), 3 * 512 * 1024 * 1024);
        assert!(parse_byte_size("lots").is_err());
    }

    #[test]
    fn test_watermark_forms() {
        assert_eq!(parse_watermark("85%").unwrap(), Watermark::Percent(85.0));
        assert_eq!(parse_watermark("0.95").unwrap(), Watermark::Percent(95.0));
        assert_eq!(
            parse_watermark("500mb").unwrap(),
            Watermark::Bytes(500 * 1024 * 1024)
        );
    }

    #[test]
    fn test_setting_precedence() {
        let settings = serde_json::json!({
            "persistent": { "discovery.zen.minimum_master_nodes": "2" },
            "transient": { "discovery": { "zen": { "minimum_master_nodes": 3 } } }
        });
        let value = lookup_setting(&settings, "discovery.zen.minimum_master_nodes").unwrap();
        assert_eq!(setting_as_i32(value), Some(3));
    }

    #[test]
    fn test_health_and_allocation_parse() {
        assert_eq!("yellow".parse::<ClusterHealth>().unwrap(), ClusterHealth::Yellow);
        assert!(!ClusterHealth::Red.is_operational());
        assert!(ClusterHealth::Yellow.is_operational());
        assert_eq!(
            "primaries".parse::<ShardAllocationMode>().unwrap(),
            ShardAllocationMode::Primaries
        );
    }
}

mod campaign_tests {
    use elasticsearch_operator::controller::campaign::{CampaignKind, Stage, node_stage};
    use elasticsearch_operator::crd::{ConditionStatus, NodeUpgradeStatus, UpgradePhase};

    #[test]
    fn test_kind_scope() {
        let cluster: Vec<CampaignKind> = CampaignKind::ALL
            .into_iter()
            .filter(CampaignKind::is_cluster_scope)
            .collect();
        assert_eq!(
            cluster,
            vec![
                CampaignKind::FullClusterUpdate,
                CampaignKind::FullClusterCertRestart,
                CampaignKind::FullClusterRestart,
            ]
        );
    }

    #[test]
    fn test_node_stage_walk() {
        let mut status = NodeUpgradeStatus::default();
        assert_eq!(node_stage(&status), Some(Stage::Precheck));

        status.under_upgrade = ConditionStatus::True;
        let expected = [
            (UpgradePhase::ControllerUpdated, Stage::Prep),
            (UpgradePhase::PreparationComplete, Stage::Main),
            (UpgradePhase::NodeRestarting, Stage::Post),
            (UpgradePhase::RecoveringData, Stage::Recovery),
        ];
        for (phase, stage) in expected {
            status.upgrade_phase = phase;
            assert_eq!(node_stage(&status), Some(stage));
        }
    }
}

mod error_tests {
    use std::time::Duration;

    use elasticsearch_operator::controller::error::Error;

    #[test]
    fn test_backoff_doubles_and_caps() {
        let error = Error::Transient("cluster restarting".to_string());
        assert_eq!(error.requeue_after_with_retry_count(0), Duration::from_secs(5));
        assert_eq!(error.requeue_after_with_retry_count(2), Duration::from_secs(20));
        assert_eq!(error.requeue_after_with_retry_count(10), Duration::from_secs(300));
    }

    #[test]
    fn test_validation_not_retried() {
        let error = Error::Validation("no master nodes".to_string());
        assert!(!error.is_retryable());
        assert_eq!(error.requeue_after(), Duration::from_secs(300));
    }
}
