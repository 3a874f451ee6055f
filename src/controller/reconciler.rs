//! Reconciliation loop for Elasticsearch.
//!
//! This module contains the main reconcile function that handles the lifecycle
//! of Elasticsearch custom resources. The Kubernetes wiring lives in
//! `reconcile`; the per-cluster work, which only sees the workload, gateway
//! and status seams, lives in `reconcile_cluster`.

use std::sync::Arc;
use std::time::{Duration, Instant};

use kube::{
    Api, ResourceExt,
    api::{Patch, PatchParams},
    runtime::controller::Action,
};
use tracing::{debug, error, info, warn};

use crate::{
    client::{
        ClusterHealth, ElasticsearchClient, ElasticsearchClientConfig, KubeWorkloadApi,
        WorkloadApi,
    },
    controller::{
        common::{add_finalizer, has_finalizer, remove_finalizer},
        context::{Context, FIELD_MANAGER},
        disk_watermark::clear_read_only_blocks,
        error::{Error, Result},
        managed_node::NodeEnv,
        node_registry::{ClusterKey, ClusterNodes},
        restart::{RestartOutcome, reconcile_restarts},
        status::{KubeStatusStore, StatusRecorder, remove_condition, set_condition},
        topology::{TopologyOutcome, assign_uuids, reconcile_topology, secret_hash, validate_uuids},
        validation::{VALIDATION_CONDITIONS, validate_spec},
    },
    crd::{ConditionType, Elasticsearch, RESTART_ANNOTATION},
    resources::common::{cluster_url, tls_secret_name},
};

/// Finalizer name for graceful deletion
pub const FINALIZER: &str = "elasticsearchoperator.smoketurner.com/finalizer";

/// Requeue interval while something is in flight
const ACTIVE_REQUEUE: Duration = Duration::from_secs(10);

/// Requeue interval of a settled cluster
const IDLE_REQUEUE: Duration = Duration::from_secs(60);

/// What one reconcile of a cluster did.
#[derive(Clone, Debug, PartialEq)]
pub struct ClusterReport {
    pub topology: TopologyOutcome,
    pub restart: RestartOutcome,
    pub unblocked_indices: Vec<String>,
    pub health: ClusterHealth,
    pub node_count: i32,
}

impl ClusterReport {
    /// Whether another reconcile should follow soon.
    pub fn is_active(&self) -> bool {
        !self.topology.is_converged() || matches!(self.restart, RestartOutcome::Deferred(_))
    }
}

/// Reconcile an Elasticsearch cluster
///
/// This is the main reconciliation function called by the controller.
/// It handles the full lifecycle: creation, updates, and deletion.
pub async fn reconcile(obj: Arc<Elasticsearch>, ctx: Arc<Context>) -> Result<Action> {
    let start_time = Instant::now();
    let name = obj.name_any();
    let namespace = obj.namespace().unwrap_or_else(|| "default".to_string());
    let key = ClusterKey::new(&namespace, &name);

    debug!(name = %name, namespace = %namespace, "Reconciling Elasticsearch");

    let api: Api<Elasticsearch> = Api::namespaced(ctx.client.clone(), &namespace);

    // Handle deletion
    if obj.metadata.deletion_timestamp.is_some() {
        return handle_deletion(&obj, &ctx, &api, &key).await;
    }

    // Ensure finalizer is present
    if !has_finalizer(obj.as_ref(), FINALIZER) {
        info!(name = %name, "Adding finalizer");
        add_finalizer(&api, &name, FINALIZER).await?;
        return Ok(Action::requeue(Duration::from_secs(1)));
    }

    // Node group identifiers are persisted before anything is named after them
    let mut spec = obj.spec.clone();
    if assign_uuids(&mut spec) {
        info!(name = %name, "Assigning node group identifiers");
        let patch = serde_json::json!({ "spec": { "nodes": spec.nodes } });
        api.patch(&name, &PatchParams::apply(FIELD_MANAGER), &Patch::Merge(&patch))
            .await?;
        return Ok(Action::requeue(Duration::from_secs(1)));
    }

    // One reconcile per cluster at a time touches its nodes
    let entry = ctx.registry.cluster(&key);
    let mut nodes = entry.lock().await;

    let workloads = KubeWorkloadApi::new(ctx.client.clone(), &namespace);
    let gateway = build_gateway(&obj, &workloads).await?;
    let store = KubeStatusStore::new(ctx.client.clone(), &namespace);
    let recorder = StatusRecorder::new(&store, &name);
    let env = NodeEnv {
        workloads: &workloads,
        gateway: &gateway,
        polling: ctx.polling,
    };

    let report = match reconcile_cluster(&obj, &mut nodes, &env, &recorder).await {
        Ok(report) => report,
        Err(e) => {
            if matches!(e, Error::Validation(_)) {
                error!(name = %name, error = %e, "Validation failed");
                ctx.publish_warning_event(&obj, "ValidationFailed", "Validating", Some(e.to_string()))
                    .await;
            }
            return Err(e);
        }
    };
    drop(nodes);

    publish_report_events(&obj, &ctx, &report).await;
    ctx.registry.reset_failures(&key);

    // Record metrics
    if let Some(ref health_state) = ctx.health_state {
        let duration = start_time.elapsed().as_secs_f64();
        health_state
            .metrics
            .record_reconcile(&namespace, &name, duration);
        let desired_nodes: i64 = obj
            .spec
            .nodes
            .iter()
            .map(|n| i64::from(n.node_count.max(0)))
            .sum();
        health_state.metrics.set_cluster_nodes(
            &namespace,
            &name,
            desired_nodes,
            i64::from(report.node_count),
        );
        if let RestartOutcome::Completed(kind) = report.restart {
            health_state.metrics.record_campaign(kind.reason());
        }
    }

    let requeue = if report.is_active() {
        ACTIVE_REQUEUE
    } else {
        IDLE_REQUEUE
    };
    Ok(Action::requeue(requeue))
}

/// Reconcile one cluster against its workloads, its gateway and its status.
///
/// Validates the spec, converges the node topology, runs at most one restart
/// campaign, lifts read-only index blocks and records live health.
pub async fn reconcile_cluster(
    resource: &Elasticsearch,
    nodes: &mut ClusterNodes,
    env: &NodeEnv<'_>,
    recorder: &StatusRecorder<'_>,
) -> Result<ClusterReport> {
    let name = resource.name_any();

    check_spec(resource, recorder).await?;

    let current_secret_hash = env
        .workloads
        .get_secret(&tls_secret_name(resource))
        .await?
        .map(|secret| secret_hash(&secret));

    let topology =
        reconcile_topology(resource, nodes, env, recorder, current_secret_hash).await?;

    let restart_request = resource.annotations().get(RESTART_ANNOTATION).cloned();
    let restart = reconcile_restarts(nodes, env, recorder, restart_request.as_deref()).await?;

    let unblocked_indices = match clear_read_only_blocks(nodes, env.gateway).await {
        Ok(indices) => indices,
        Err(e) => {
            warn!(name = %name, error = %e, "Failed to clear read-only index blocks");
            Vec::new()
        }
    };

    let health = env
        .gateway
        .get_cluster_health()
        .await
        .unwrap_or(ClusterHealth::Unknown);
    let node_count = env.gateway.get_cluster_node_count().await.unwrap_or(0);
    let allocation = env
        .gateway
        .get_shard_allocation()
        .await
        .ok()
        .map(|mode| mode.to_string());
    let generation = resource.metadata.generation;

    recorder
        .update(|status| {
            status.cluster_health = health.to_string();
            status.node_count = node_count;
            status.shard_allocation_enabled = allocation.clone();
            status.observed_generation = generation;
        })
        .await?;

    Ok(ClusterReport {
        topology,
        restart,
        unblocked_indices,
        health,
        node_count,
    })
}

/// Persist one condition per failed rule and fail when any rule failed.
async fn check_spec(resource: &Elasticsearch, recorder: &StatusRecorder<'_>) -> Result<()> {
    let violations = validate_spec(&resource.spec);
    let status = recorder.current().await?;
    let uuid_violation = validate_uuids(&resource.spec, &status);

    recorder
        .update(|status| {
            for condition in VALIDATION_CONDITIONS {
                match violations.iter().find(|v| v.condition == condition) {
                    Some(v) => set_condition(status, condition, true, v.reason, &v.message),
                    None => remove_condition(status, condition),
                }
            }
            match &uuid_violation {
                Some(v) => set_condition(status, ConditionType::InvalidUUID, true, v.reason, &v.message),
                None => remove_condition(status, ConditionType::InvalidUUID),
            }
        })
        .await?;

    let mut messages: Vec<String> = violations.iter().map(ToString::to_string).collect();
    messages.extend(uuid_violation.iter().map(ToString::to_string));

    if messages.is_empty() {
        Ok(())
    } else {
        Err(Error::Validation(messages.join("; ")))
    }
}

/// Build the REST client for a cluster from its TLS secret.
async fn build_gateway(
    resource: &Elasticsearch,
    workloads: &dyn WorkloadApi,
) -> Result<ElasticsearchClient> {
    let url = cluster_url(resource);
    let config = match workloads.get_secret(&tls_secret_name(resource)).await? {
        Some(secret) => ElasticsearchClientConfig::from_secret(url, &secret),
        None => {
            debug!(name = %resource.name_any(), "TLS secret not found, connecting without client certificate");
            ElasticsearchClientConfig {
                base_url: url,
                ..Default::default()
            }
        }
    };
    Ok(ElasticsearchClient::new(config)?)
}

async fn publish_report_events(obj: &Elasticsearch, ctx: &Context, report: &ClusterReport) {
    if !report.topology.created.is_empty() {
        ctx.publish_normal_event(
            obj,
            "NodesCreated",
            "Scaling",
            Some(format!("Created {}", report.topology.created.join(", "))),
        )
        .await;
    }
    if !report.topology.deleted.is_empty() {
        ctx.publish_normal_event(
            obj,
            "NodesDeleted",
            "Scaling",
            Some(format!("Deleted {}", report.topology.deleted.join(", "))),
        )
        .await;
    }
    match report.restart {
        RestartOutcome::Completed(kind) => {
            ctx.publish_normal_event(
                obj,
                "RestartCompleted",
                "Restarting",
                Some(format!("{} completed", kind)),
            )
            .await;
        }
        RestartOutcome::Deferred(kind) => {
            ctx.publish_warning_event(
                obj,
                "RestartDeferred",
                "Restarting",
                Some(format!("{} waiting for cluster health {}", kind, report.health)),
            )
            .await;
        }
        _ => {}
    }
    if !report.unblocked_indices.is_empty() {
        ctx.publish_normal_event(
            obj,
            "IndicesUnblocked",
            "Reconciling",
            Some(format!(
                "Cleared read-only block from {} indices",
                report.unblocked_indices.len()
            )),
        )
        .await;
    }
}

/// Error policy for the controller
pub fn error_policy(obj: Arc<Elasticsearch>, error: &Error, ctx: Arc<Context>) -> Action {
    let name = obj.name_any();
    let namespace = obj.namespace().unwrap_or_else(|| "default".to_string());

    // Record error metric
    if let Some(ref health_state) = ctx.health_state {
        health_state.metrics.record_error(&namespace, &name);
    }

    if error.is_not_found() {
        debug!(name = %name, "Resource not found (likely deleted)");
        return Action::await_change();
    }

    let retries = ctx.registry.record_failure(&ClusterKey::new(&namespace, &name));
    let delay = error.requeue_after_with_retry_count(retries);
    if error.is_retryable() {
        warn!(name = %name, error = %error, retries = retries, delay = ?delay, "Retryable error, will retry");
    } else {
        error!(name = %name, error = %error, "Non-retryable error");
    }
    Action::requeue(delay)
}

/// Handle deletion of an Elasticsearch cluster
///
/// Workloads are owned by the resource and garbage collected; only the
/// in-memory node registry needs tearing down.
async fn handle_deletion(
    obj: &Elasticsearch,
    ctx: &Context,
    api: &Api<Elasticsearch>,
    key: &ClusterKey,
) -> Result<Action> {
    let name = obj.name_any();
    info!(name = %name, "Handling deletion");

    ctx.registry.remove(key);
    remove_finalizer(api, &name, FINALIZER).await?;

    Ok(Action::await_change())
}
