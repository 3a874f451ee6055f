//! Types for parsed Elasticsearch cluster information.
//!
//! These types represent the semantic results of the administrative REST
//! endpoints (`_cluster/health`, `_cluster/settings`, `_nodes/stats/fs`, ...).

use std::str::FromStr;

use thiserror::Error;

/// Errors that can occur when parsing cluster data.
#[derive(Error, Debug)]
pub enum ParseError {
    #[error("Invalid health status: {0}")]
    InvalidHealth(String),
    #[error("Invalid shard allocation mode: {0}")]
    InvalidAllocation(String),
    #[error("Invalid watermark: {0}")]
    InvalidWatermark(String),
    #[error("Invalid byte size: {0}")]
    InvalidByteSize(String),
    #[error("Missing required field: {0}")]
    MissingField(String),
}

/// Health of the Elasticsearch cluster.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub enum ClusterHealth {
    Green,
    Yellow,
    Red,
    /// The cluster could not be reached or reported something unexpected.
    #[default]
    Unknown,
}

impl ClusterHealth {
    /// Health states in which destructive operations are allowed.
    pub fn is_operational(&self) -> bool {
        matches!(self, ClusterHealth::Green | ClusterHealth::Yellow)
    }
}

impl FromStr for ClusterHealth {
    type Err = ParseError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_lowercase().as_str() {
            "green" => Ok(ClusterHealth::Green),
            "yellow" => Ok(ClusterHealth::Yellow),
            "red" => Ok(ClusterHealth::Red),
            _ => Err(ParseError::InvalidHealth(s.to_string())),
        }
    }
}

impl std::fmt::Display for ClusterHealth {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ClusterHealth::Green => write!(f, "green"),
            ClusterHealth::Yellow => write!(f, "yellow"),
            ClusterHealth::Red => write!(f, "red"),
            ClusterHealth::Unknown => write!(f, "unknown"),
        }
    }
}

/// Value of `cluster.routing.allocation.enable`.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub enum ShardAllocationMode {
    None,
    Primaries,
    All,
    #[default]
    Unknown,
}

impl FromStr for ShardAllocationMode {
    type Err = ParseError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_lowercase().as_str() {
            "none" => Ok(ShardAllocationMode::None),
            "primaries" => Ok(ShardAllocationMode::Primaries),
            "all" => Ok(ShardAllocationMode::All),
            _ => Err(ParseError::InvalidAllocation(s.to_string())),
        }
    }
}

impl std::fmt::Display for ShardAllocationMode {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ShardAllocationMode::None => write!(f, "none"),
            ShardAllocationMode::Primaries => write!(f, "primaries"),
            ShardAllocationMode::All => write!(f, "all"),
            ShardAllocationMode::Unknown => write!(f, "unknown"),
        }
    }
}

/// Disk usage of one node.
#[derive(Debug, Clone, Copy, Default, PartialEq)]
pub struct DiskUsage {
    /// Used bytes.
    pub used_bytes: u64,
    /// Used percentage of total capacity.
    pub used_percent: f64,
}

/// A disk watermark threshold as Elasticsearch reports it.
///
/// A percentage is a ceiling on used space; an absolute value is a floor on
/// free space, so it is compared against the remaining bytes.
#[derive(Debug, Clone, Copy, PartialEq)]
pub enum Watermark {
    Percent(f64),
    Bytes(u64),
}

impl Watermark {
    /// Whether `usage` on a disk of `total_bytes` is below this threshold.
    pub fn is_below(&self, usage: &DiskUsage, total_bytes: u64) -> bool {
        match self {
            Watermark::Percent(limit) => usage.used_percent < *limit,
            Watermark::Bytes(min_free) => {
                total_bytes.saturating_sub(usage.used_bytes) > *min_free
            }
        }
    }
}

/// Low, high and flood-stage watermarks.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct DiskWatermarks {
    pub low: Watermark,
    pub high: Watermark,
    pub flood: Watermark,
}

impl Default for DiskWatermarks {
    fn default() -> Self {
        // Elasticsearch defaults
        Self {
            low: Watermark::Percent(85.0),
            high: Watermark::Percent(90.0),
            flood: Watermark::Percent(95.0),
        }
    }
}

/// Settings of an index relevant to the operator.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct IndexSettings {
    /// Configured replica count.
    pub number_of_replicas: i32,
    /// Whether `index.blocks.read_only_allow_delete` is set.
    pub read_only_allow_delete: bool,
}

/// Name of the security plugin's system index, never touched by the operator.
pub const SECURITY_INDEX: &str = ".security";
