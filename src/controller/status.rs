//! Status management.
//!
//! Conditions are edited through `ConditionBuilder`. All persisted status
//! changes go through `StatusRecorder`, which re-reads the object, applies a
//! mutation and writes it back conditioned on the `resourceVersion` it read,
//! retrying when another writer got there first.

use async_trait::async_trait;
use kube::api::{Api, Patch, PatchParams};
use kube::{Client, ResourceExt};
use tracing::{debug, warn};

use crate::controller::context::FIELD_MANAGER;
use crate::controller::error::{Error, Result};
use crate::crd::{Condition, ConditionType, Elasticsearch, ElasticsearchStatus};

/// Attempts made by `StatusRecorder::update` before giving up on conflicts.
pub const MAX_STATUS_ATTEMPTS: u32 = 5;

/// Builder for managing conditions list
pub struct ConditionBuilder {
    conditions: Vec<Condition>,
}

impl ConditionBuilder {
    /// Start from an existing conditions list
    pub fn from_conditions(conditions: Vec<Condition>) -> Self {
        Self { conditions }
    }

    /// Add or update a condition.
    ///
    /// The transition time is kept when the status does not change.
    pub fn set(&mut self, condition: Condition) -> &mut Self {
        // Find and replace existing condition of same type
        if let Some(existing) = self
            .conditions
            .iter_mut()
            .find(|c| c.r#type == condition.r#type)
        {
            let transition_time = if existing.status == condition.status {
                existing.last_transition_time.clone()
            } else {
                condition.last_transition_time.clone()
            };
            *existing = Condition {
                last_transition_time: transition_time,
                ..condition
            };
        } else {
            self.conditions.push(condition);
        }
        self
    }

    /// Set a condition of `condition_type`
    pub fn condition(
        &mut self,
        condition_type: ConditionType,
        status: bool,
        reason: &str,
        message: &str,
    ) -> &mut Self {
        self.set(Condition::new(condition_type, status, reason, message))
    }

    /// Remove a condition of `condition_type`
    pub fn remove(&mut self, condition_type: ConditionType) -> &mut Self {
        let type_name = condition_type.to_string();
        self.conditions.retain(|c| c.r#type != type_name);
        self
    }

    /// Build the conditions list
    pub fn build(self) -> Vec<Condition> {
        self.conditions
    }
}

/// Set a condition on a status.
pub fn set_condition(
    status: &mut ElasticsearchStatus,
    condition_type: ConditionType,
    value: bool,
    reason: &str,
    message: &str,
) {
    let mut builder = ConditionBuilder::from_conditions(std::mem::take(&mut status.conditions));
    builder.condition(condition_type, value, reason, message);
    status.conditions = builder.build();
}

/// Remove a condition from a status.
pub fn remove_condition(status: &mut ElasticsearchStatus, condition_type: ConditionType) {
    let mut builder = ConditionBuilder::from_conditions(std::mem::take(&mut status.conditions));
    builder.remove(condition_type);
    status.conditions = builder.build();
}

/// Check if a condition type is true
pub fn is_condition_true(conditions: &[Condition], condition_type: ConditionType) -> bool {
    let type_name = condition_type.to_string();
    conditions
        .iter()
        .find(|c| c.r#type == type_name)
        .is_some_and(|c| c.status == "True")
}

/// Get the reason for a condition
pub fn get_condition_reason(conditions: &[Condition], condition_type: ConditionType) -> Option<&str> {
    let type_name = condition_type.to_string();
    conditions
        .iter()
        .find(|c| c.r#type == type_name)
        .map(|c| c.reason.as_str())
}

// ============================================================================
// Status store
// ============================================================================

/// Versioned access to the status subresource.
#[async_trait]
pub trait StatusStore: Send + Sync {
    /// Current status and the `resourceVersion` it was read at.
    async fn get_status(&self, name: &str) -> Result<(ElasticsearchStatus, Option<String>)>;

    /// Write `status` if the object is still at `resource_version`.
    ///
    /// Returns `Error::Conflict` when it is not.
    async fn put_status(
        &self,
        name: &str,
        status: &ElasticsearchStatus,
        resource_version: Option<String>,
    ) -> Result<()>;
}

/// `StatusStore` backed by the Kubernetes API server.
#[derive(Clone)]
pub struct KubeStatusStore {
    api: Api<Elasticsearch>,
}

impl KubeStatusStore {
    pub fn new(client: Client, namespace: &str) -> Self {
        Self {
            api: Api::namespaced(client, namespace),
        }
    }
}

#[async_trait]
impl StatusStore for KubeStatusStore {
    async fn get_status(&self, name: &str) -> Result<(ElasticsearchStatus, Option<String>)> {
        let obj = self.api.get_status(name).await?;
        let resource_version = obj.resource_version();
        Ok((obj.status.unwrap_or_default(), resource_version))
    }

    async fn put_status(
        &self,
        name: &str,
        status: &ElasticsearchStatus,
        resource_version: Option<String>,
    ) -> Result<()> {
        let patch = serde_json::json!({
            "apiVersion": "elasticsearchoperator.smoketurner.com/v1alpha1",
            "kind": "Elasticsearch",
            "metadata": { "resourceVersion": resource_version },
            "status": status
        });
        match self
            .api
            .patch_status(name, &PatchParams::apply(FIELD_MANAGER), &Patch::Merge(&patch))
            .await
        {
            Ok(_) => Ok(()),
            Err(kube::Error::Api(e)) if e.code == 409 => {
                Err(Error::Conflict(format!("status of {} changed concurrently", name)))
            }
            Err(e) => Err(e.into()),
        }
    }
}

/// Read-modify-write access to one cluster's status.
pub struct StatusRecorder<'a> {
    store: &'a dyn StatusStore,
    name: String,
}

impl<'a> StatusRecorder<'a> {
    pub fn new(store: &'a dyn StatusStore, name: &str) -> Self {
        Self {
            store,
            name: name.to_string(),
        }
    }

    /// Latest persisted status.
    pub async fn current(&self) -> Result<ElasticsearchStatus> {
        Ok(self.store.get_status(&self.name).await?.0)
    }

    /// Apply `mutate` to the latest status and persist it.
    ///
    /// Skips the write when nothing changed. Retries on conflict up to
    /// `MAX_STATUS_ATTEMPTS` times, re-reading before each attempt.
    pub async fn update<F>(&self, mut mutate: F) -> Result<ElasticsearchStatus>
    where
        F: FnMut(&mut ElasticsearchStatus) + Send,
    {
        for attempt in 1..=MAX_STATUS_ATTEMPTS {
            let (original, resource_version) = self.store.get_status(&self.name).await?;
            let mut status = original.clone();
            mutate(&mut status);
            if status == original {
                return Ok(status);
            }

            match self
                .store
                .put_status(&self.name, &status, resource_version)
                .await
            {
                Ok(()) => return Ok(status),
                Err(e) if e.is_conflict() => {
                    debug!(name = %self.name, attempt = attempt, "Status write conflicted, retrying");
                }
                Err(e) => return Err(e),
            }
        }

        warn!(name = %self.name, attempts = MAX_STATUS_ATTEMPTS, "Giving up on status update");
        Err(Error::Conflict(format!(
            "status of {} still conflicting after {} attempts",
            self.name, MAX_STATUS_ATTEMPTS
        )))
    }
}
