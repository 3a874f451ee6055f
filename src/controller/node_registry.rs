//! Per-cluster node registry.
//!
//! The registry remembers the managed nodes of every cluster between
//! reconciles, chiefly the TLS secret hash each node's pods started with.
//! Each cluster's entry sits behind its own async lock, held for the whole
//! reconcile of that cluster; clusters never contend with each other.

use std::collections::HashMap;
use std::sync::{Arc, Mutex};

use tokio::sync::Mutex as AsyncMutex;

use crate::controller::managed_node::{ManagedNode, NodeOperations};

/// Identity of a cluster: namespace and name.
#[derive(Clone, Debug, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct ClusterKey {
    pub namespace: String,
    pub name: String,
}

impl ClusterKey {
    pub fn new(namespace: &str, name: &str) -> Self {
        Self {
            namespace: namespace.to_string(),
            name: name.to_string(),
        }
    }
}

impl std::fmt::Display for ClusterKey {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}/{}", self.namespace, self.name)
    }
}

/// The managed nodes of one cluster, in declaration order.
#[derive(Clone, Debug, Default)]
pub struct ClusterNodes {
    nodes: Vec<ManagedNode>,
}

impl ClusterNodes {
    pub fn get(&self, name: &str) -> Option<&ManagedNode> {
        self.nodes.iter().find(|n| n.name() == name)
    }

    pub fn get_mut(&mut self, name: &str) -> Option<&mut ManagedNode> {
        self.nodes.iter_mut().find(|n| n.name() == name)
    }

    pub fn contains(&self, name: &str) -> bool {
        self.get(name).is_some()
    }

    pub fn iter(&self) -> impl Iterator<Item = &ManagedNode> {
        self.nodes.iter()
    }

    pub fn iter_mut(&mut self) -> impl Iterator<Item = &mut ManagedNode> {
        self.nodes.iter_mut()
    }

    pub fn names(&self) -> Vec<String> {
        self.nodes.iter().map(|n| n.name().to_string()).collect()
    }

    pub fn len(&self) -> usize {
        self.nodes.len()
    }

    pub fn is_empty(&self) -> bool {
        self.nodes.is_empty()
    }

    /// Insert a node, or update a known one in place keeping its hash memory.
    pub fn upsert(&mut self, node: ManagedNode) {
        match self.get_mut(node.name()) {
            Some(existing) => existing.update_desired(node),
            None => self.nodes.push(node),
        }
    }

    /// Put back a node that was handed out, e.g. to a restart campaign.
    pub fn replace(&mut self, node: ManagedNode) {
        match self.get_mut(node.name()) {
            Some(existing) => *existing = node,
            None => self.nodes.push(node),
        }
    }

    pub fn remove(&mut self, name: &str) -> Option<ManagedNode> {
        let pos = self.nodes.iter().position(|n| n.name() == name)?;
        Some(self.nodes.remove(pos))
    }

    /// Copies of the named nodes, in registry order.
    pub fn select(&self, names: &[String]) -> Vec<ManagedNode> {
        self.nodes
            .iter()
            .filter(|n| names.iter().any(|name| name == n.name()))
            .cloned()
            .collect()
    }

    /// Sum of data Elasticsearch nodes.
    pub fn data_count(&self) -> i32 {
        self.nodes.iter().map(ManagedNode::data_count).sum()
    }
}

/// Registry of all clusters' nodes, owned by the controller context.
#[derive(Clone, Default)]
pub struct NodeRegistry {
    clusters: Arc<Mutex<HashMap<ClusterKey, Arc<AsyncMutex<ClusterNodes>>>>>,
    failures: Arc<Mutex<HashMap<ClusterKey, u32>>>,
}

impl NodeRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// The entry of a cluster, created empty on first use.
    pub fn cluster(&self, key: &ClusterKey) -> Arc<AsyncMutex<ClusterNodes>> {
        let mut clusters = self.clusters.lock().unwrap_or_else(|e| e.into_inner());
        clusters
            .entry(key.clone())
            .or_insert_with(|| Arc::new(AsyncMutex::new(ClusterNodes::default())))
            .clone()
    }

    pub fn contains(&self, key: &ClusterKey) -> bool {
        let clusters = self.clusters.lock().unwrap_or_else(|e| e.into_inner());
        clusters.contains_key(key)
    }

    /// Forget a deleted cluster.
    pub fn remove(&self, key: &ClusterKey) {
        let mut clusters = self.clusters.lock().unwrap_or_else(|e| e.into_inner());
        clusters.remove(key);
        let mut failures = self.failures.lock().unwrap_or_else(|e| e.into_inner());
        failures.remove(key);
    }

    /// Count a failed reconcile; returns the number of failures before this one.
    pub fn record_failure(&self, key: &ClusterKey) -> u32 {
        let mut failures = self.failures.lock().unwrap_or_else(|e| e.into_inner());
        let count = failures.entry(key.clone()).or_insert(0);
        let previous = *count;
        *count = count.saturating_add(1);
        previous
    }

    pub fn reset_failures(&self, key: &ClusterKey) {
        let mut failures = self.failures.lock().unwrap_or_else(|e| e.into_inner());
        failures.remove(key);
    }
}
