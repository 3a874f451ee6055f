// Test code is allowed to panic on failure
#![allow(
    clippy::unwrap_used,
    clippy::expect_used,
    clippy::indexing_slicing,
    clippy::panic,
    clippy::string_slice
)]

//! Property-based tests for elasticsearch-operator.
//!
//! Uses proptest to generate random inputs and verify invariants.

use std::collections::BTreeMap;

use proptest::prelude::*;

use elasticsearch_operator::client::master_quorum;
use elasticsearch_operator::controller::campaign::{CampaignKind, Stage, cluster_stage};
use elasticsearch_operator::controller::restart::{apply_signal, merge_node_states};
use elasticsearch_operator::controller::status::set_condition;
use elasticsearch_operator::controller::validation::{crontab_from_interval, validate_scale_down};
use elasticsearch_operator::crd::{
    ConditionStatus, ConditionType, ElasticsearchStatus, NodeStatus, NodeUpgradeStatus,
    UpgradePhase,
};

/// Strategy for generating tri-state flags.
fn any_flag() -> impl Strategy<Value = ConditionStatus> {
    prop_oneof![
        Just(ConditionStatus::True),
        Just(ConditionStatus::False),
        Just(ConditionStatus::Unknown),
    ]
}

/// Strategy for generating upgrade phases.
fn any_phase() -> impl Strategy<Value = UpgradePhase> {
    prop_oneof![
        Just(UpgradePhase::None),
        Just(UpgradePhase::ControllerUpdated),
        Just(UpgradePhase::PreparationComplete),
        Just(UpgradePhase::NodeRestarting),
        Just(UpgradePhase::RecoveringData),
    ]
}

fn any_upgrade_status() -> impl Strategy<Value = NodeUpgradeStatus> {
    (any_flag(), any_flag(), any_flag(), any_phase()).prop_map(
        |(under_upgrade, scheduled_for_upgrade, scheduled_for_cert_redeploy, upgrade_phase)| {
            NodeUpgradeStatus {
                under_upgrade,
                scheduled_for_upgrade,
                scheduled_for_cert_redeploy,
                upgrade_phase,
                campaign: None,
            }
        },
    )
}

fn cluster_kind() -> impl Strategy<Value = CampaignKind> {
    prop_oneof![
        Just(CampaignKind::FullClusterUpdate),
        Just(CampaignKind::FullClusterCertRestart),
        Just(CampaignKind::FullClusterRestart),
    ]
}

fn node_names(count: usize) -> Vec<String> {
    (1..=count).map(|i| format!("logs-dm-abcd1234-{}", i)).collect()
}

/// Walk a cluster campaign through its stages from a clean status.
fn walk_cluster_campaign(kind: CampaignKind, nodes: &[String], stages: usize) -> ElasticsearchStatus {
    let mut status = ElasticsearchStatus::default();
    for stage in Stage::ALL.into_iter().take(stages) {
        apply_signal(&mut status, stage, kind, nodes, None);
    }
    status
}

proptest! {
    /// For any persisted node state, at most one node stage guard holds.
    #[test]
    fn node_stage_guards_are_exclusive(status in any_upgrade_status()) {
        let holding = Stage::ALL.iter().filter(|s| s.node_guard(&status)).count();
        prop_assert!(holding <= 1);
    }

    /// A node that is not under upgrade is always at Precheck.
    #[test]
    fn idle_node_starts_at_precheck(mut status in any_upgrade_status()) {
        status.under_upgrade = ConditionStatus::False;
        prop_assert!(Stage::Precheck.node_guard(&status));
    }

    /// Each completed stage of a cluster campaign selects the next one, and
    /// a finished campaign is back at Precheck.
    #[test]
    fn cluster_stages_advance_in_order(kind in cluster_kind(), count in 1usize..6, done in 0usize..=5) {
        let nodes = node_names(count);
        let status = walk_cluster_campaign(kind, &nodes, done);
        let expected = Stage::ALL.get(done).copied().unwrap_or(Stage::Precheck);
        prop_assert_eq!(cluster_stage(&status, &nodes), Some(expected));
    }

    /// Arbitrary condition combinations never enable two cluster stages.
    #[test]
    fn cluster_stage_guards_are_exclusive(
        updating in any::<bool>(),
        restarting in any::<bool>(),
        recovering in any::<bool>(),
        phases in prop::collection::vec(any_phase(), 1..5),
    ) {
        let mut status = ElasticsearchStatus::default();
        set_condition(&mut status, ConditionType::UpdatingESSettings, updating, "FullClusterRestart", "");
        set_condition(&mut status, ConditionType::Restarting, restarting, "FullClusterRestart", "");
        set_condition(&mut status, ConditionType::Recovering, recovering, "FullClusterRestart", "");
        let nodes = node_names(phases.len());
        for (name, phase) in nodes.iter().zip(&phases) {
            status.node_mut(name).upgrade_status.upgrade_phase = *phase;
        }

        let holding = Stage::ALL.iter().filter(|s| s.cluster_guard(&status, &nodes)).count();
        prop_assert!(holding <= 1);
    }

    /// Merging observed state never lowers a scheduling flag.
    #[test]
    fn merge_only_raises_flags(
        persisted in any_upgrade_status(),
        observed_upgrade in any::<bool>(),
        observed_cert in any::<bool>(),
    ) {
        let name = "logs-dm-abcd1234-1";
        let mut status = ElasticsearchStatus::default();
        status.node_mut(name).upgrade_status = persisted.clone();

        let entry = NodeStatus {
            deployment_name: Some(name.to_string()),
            ..Default::default()
        };
        let observed = NodeUpgradeStatus {
            scheduled_for_upgrade: ConditionStatus::from_bool(observed_upgrade),
            scheduled_for_cert_redeploy: ConditionStatus::from_bool(observed_cert),
            ..Default::default()
        };
        merge_node_states(&mut status, &[(entry, observed)]);

        let merged = status.upgrade_status(name);
        prop_assert_eq!(
            merged.scheduled_for_upgrade.is_true(),
            persisted.scheduled_for_upgrade.is_true() || observed_upgrade
        );
        prop_assert_eq!(
            merged.scheduled_for_cert_redeploy.is_true(),
            persisted.scheduled_for_cert_redeploy.is_true() || observed_cert
        );
        prop_assert_eq!(merged.upgrade_phase, persisted.upgrade_phase);
        prop_assert_eq!(merged.under_upgrade, persisted.under_upgrade);
    }

    /// Minute and hour intervals always convert to a five-field schedule.
    #[test]
    fn crontab_has_five_fields(value in 1u32..1000, hours in any::<bool>()) {
        let unit = if hours { "h" } else { "m" };
        let schedule = crontab_from_interval(&format!("{}{}", value, unit)).unwrap();
        prop_assert_eq!(schedule.split_whitespace().count(), 5);
        let expected = format!("*/{}", value);
        prop_assert!(schedule.contains(&expected));
    }

    /// If a scale-down is safe, scaling down less is safe too.
    #[test]
    fn scale_down_safety_is_monotonic(
        replicas in prop::collection::vec(0i32..5, 0..6),
        target in 1i32..8,
    ) {
        let counts: BTreeMap<String, i32> = replicas
            .iter()
            .enumerate()
            .map(|(i, r)| (format!("index-{}", i), *r))
            .collect();
        if validate_scale_down(target, &counts).is_none() {
            prop_assert!(validate_scale_down(target + 1, &counts).is_none());
        }
    }

    /// A quorum is a strict majority of the masters.
    #[test]
    fn master_quorum_is_majority(masters in 1i32..50) {
        let quorum = master_quorum(masters);
        prop_assert!(quorum * 2 > masters);
        prop_assert!((quorum - 1) * 2 <= masters);
    }
}
