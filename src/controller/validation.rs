//! Validation logic for Elasticsearch specs.
//!
//! This module provides validation for:
//! - Redundancy policy against the number of data nodes
//! - Master and data node counts
//! - Data node scale-down against index replica counts
//! - Index management poll intervals (converted to crontab schedules)
//!
//! Violations are reported as values so the reconciler can persist one
//! condition per violation before failing the reconcile.

use std::collections::BTreeMap;

use regex::Regex;

use crate::controller::error::{Error, Result};
use crate::crd::{ConditionType, ElasticsearchSpec, RedundancyPolicy};

/// Minimum number of master-eligible nodes
pub const MIN_MASTERS: i32 = 1;

/// Maximum number of master-eligible nodes
pub const MAX_MASTERS: i32 = 3;

/// Condition types owned by spec validation.
pub const VALIDATION_CONDITIONS: [ConditionType; 4] = [
    ConditionType::InvalidRedundancy,
    ConditionType::InvalidMasters,
    ConditionType::InvalidData,
    ConditionType::InvalidIndexManagement,
];

/// A failed validation rule.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Violation {
    pub condition: ConditionType,
    pub reason: &'static str,
    pub message: String,
}

impl std::fmt::Display for Violation {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}: {}", self.condition, self.message)
    }
}

/// Total master-eligible nodes declared by a spec.
pub fn count_masters(spec: &ElasticsearchSpec) -> i32 {
    spec.nodes
        .iter()
        .filter(|n| n.is_master())
        .map(|n| n.node_count)
        .sum()
}

/// Total data nodes declared by a spec.
pub fn count_data(spec: &ElasticsearchSpec) -> i32 {
    spec.nodes
        .iter()
        .filter(|n| n.is_data())
        .map(|n| n.node_count)
        .sum()
}

/// Validate the resource spec
pub fn validate_spec(spec: &ElasticsearchSpec) -> Vec<Violation> {
    let masters = count_masters(spec);
    let data = count_data(spec);

    [
        validate_redundancy(spec.redundancy_policy, data),
        validate_masters(masters),
        validate_data(data),
        validate_index_management(spec),
    ]
    .into_iter()
    .flatten()
    .collect()
}

/// Every policy but `ZeroRedundancy` needs somewhere to put a replica.
pub fn validate_redundancy(policy: RedundancyPolicy, data_nodes: i32) -> Option<Violation> {
    if policy != RedundancyPolicy::ZeroRedundancy && data_nodes < 2 {
        return Some(Violation {
            condition: ConditionType::InvalidRedundancy,
            reason: "NotEnoughDataNodes",
            message: format!(
                "redundancy policy {} requires at least 2 data nodes, found {}",
                policy, data_nodes
            ),
        });
    }
    None
}

/// Validate master-eligible node count
pub fn validate_masters(masters: i32) -> Option<Violation> {
    if masters < MIN_MASTERS {
        return Some(Violation {
            condition: ConditionType::InvalidMasters,
            reason: "NoMasterNodes",
            message: format!("at least {} master node is required", MIN_MASTERS),
        });
    }
    if masters > MAX_MASTERS {
        return Some(Violation {
            condition: ConditionType::InvalidMasters,
            reason: "TooManyMasterNodes",
            message: format!(
                "master node count {} exceeds maximum {}",
                masters, MAX_MASTERS
            ),
        });
    }
    None
}

/// Validate data node count
pub fn validate_data(data_nodes: i32) -> Option<Violation> {
    if data_nodes < 1 {
        return Some(Violation {
            condition: ConditionType::InvalidData,
            reason: "NoDataNodes",
            message: "at least 1 data node is required".to_string(),
        });
    }
    None
}

/// The index management poll interval must convert to a crontab schedule.
pub fn validate_index_management(spec: &ElasticsearchSpec) -> Option<Violation> {
    let interval = &spec.index_management.as_ref()?.poll_interval;
    let message = match crontab_from_interval(interval) {
        Ok(_) => return None,
        Err(Error::Validation(message)) => message,
        Err(e) => e.to_string(),
    };
    Some(Violation {
        condition: ConditionType::InvalidIndexManagement,
        reason: "InvalidPollInterval",
        message,
    })
}

/// A data node scale-down is unsafe when some index wants as many replicas
/// as there would be data nodes left.
pub fn validate_scale_down(
    new_data_nodes: i32,
    replica_counts: &BTreeMap<String, i32>,
) -> Option<Violation> {
    let offending: Vec<&str> = replica_counts
        .iter()
        .filter(|(_, replicas)| **replicas >= new_data_nodes)
        .map(|(index, _)| index.as_str())
        .collect();

    if offending.is_empty() {
        return None;
    }

    Some(Violation {
        condition: ConditionType::InvalidData,
        reason: "UnsafeScaleDown",
        message: format!(
            "cannot scale down to {} data nodes; indices need more: {}",
            new_data_nodes,
            offending.join(", ")
        ),
    })
}

/// Convert a poll interval such as `"15m"` or `"2h"` to a crontab schedule.
///
/// # Example
/// ```
/// use elasticsearch_operator::controller::validation::crontab_from_interval;
///
/// assert_eq!(crontab_from_interval("8m").unwrap(), "*/8 * * * *");
/// ```
pub fn crontab_from_interval(interval: &str) -> Result<String> {
    let pattern = Regex::new(r"^(\d+)([a-zA-Z]+)$")
        .map_err(|e| Error::Permanent(format!("invalid interval pattern: {}", e)))?;

    let trimmed = interval.trim();
    let caps = pattern
        .captures(trimmed)
        .ok_or_else(|| Error::Validation(format!("invalid poll interval '{}'", interval)))?;

    let value: u32 = caps
        .get(1)
        .map(|m| m.as_str())
        .unwrap_or_default()
        .parse()
        .map_err(|_| Error::Validation(format!("invalid poll interval '{}'", interval)))?;
    if value == 0 {
        return Err(Error::Validation(format!(
            "poll interval '{}' must be positive",
            interval
        )));
    }

    match caps.get(2).map(|m| m.as_str()) {
        Some("m") => Ok(format!("*/{} * * * *", value)),
        Some("h") => Ok(format!("0 */{} * * *", value)),
        Some(unit) => Err(Error::Validation(format!(
            "unsupported time unit '{}' in poll interval '{}'",
            unit, interval
        ))),
        None => Err(Error::Validation(format!(
            "missing time unit in poll interval '{}'",
            interval
        ))),
    }
}
