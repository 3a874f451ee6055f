//! Custom Resource Definitions (CRDs) for elasticsearch-operator.
//!
//! - `Elasticsearch`: Deploy and manage a multi-role Elasticsearch cluster

mod elasticsearch;

pub use elasticsearch::*;
