//! Resource generation module.
//!
//! Contains utilities for generating the Kubernetes workloads owned by an
//! Elasticsearch cluster.
//!
//! ## Resources Generated
//!
//! | Resource | Purpose |
//! |----------|---------|
//! | Deployment | One single-replica data node, paused while idle |
//! | StatefulSet | A group of master/client nodes, rolled out by partition |

pub mod common;
pub mod deployment;
pub mod pod_template;
pub mod statefulset;

// Re-export commonly used items from common
pub use common::{owner_reference, standard_labels};
