//! Shared context for the controller.
//!
//! The Context struct holds shared state that is passed to the reconciler,
//! including the Kubernetes client, event recorder and node registry.

use std::sync::Arc;

use kube::runtime::events::{Event, EventType, Recorder, Reporter};
use kube::{Client, Resource};

use crate::controller::node_registry::NodeRegistry;
use crate::controller::polling::PollSettings;
use crate::crd::Elasticsearch;
use crate::health::HealthState;

/// Field manager name for the operator
pub const FIELD_MANAGER: &str = "elasticsearch-operator";

/// Shared context for the controller
#[derive(Clone)]
pub struct Context {
    /// Kubernetes client
    pub client: Client,
    /// Event reporter identity
    reporter: Reporter,
    /// Optional health state for metrics and readiness
    pub health_state: Option<Arc<HealthState>>,
    /// Managed nodes of every cluster
    pub registry: NodeRegistry,
    /// Interval and ceiling of bounded waits
    pub polling: PollSettings,
}

impl Context {
    /// Create a new context
    pub fn new(client: Client, health_state: Option<Arc<HealthState>>) -> Self {
        Self {
            client,
            reporter: Reporter {
                controller: FIELD_MANAGER.into(),
                instance: std::env::var("POD_NAME").ok(),
            },
            health_state,
            registry: NodeRegistry::new(),
            polling: PollSettings::default(),
        }
    }

    /// Replace the polling settings
    pub fn with_polling(mut self, polling: PollSettings) -> Self {
        self.polling = polling;
        self
    }

    /// Create an event recorder for publishing Kubernetes events
    fn recorder(&self) -> Recorder {
        Recorder::new(self.client.clone(), self.reporter.clone())
    }

    async fn publish(
        &self,
        resource: &Elasticsearch,
        type_: EventType,
        reason: &str,
        action: &str,
        note: Option<String>,
    ) {
        let recorder = self.recorder();
        let object_ref = resource.object_ref(&());
        if let Err(e) = recorder
            .publish(
                &Event {
                    type_,
                    reason: reason.into(),
                    note,
                    action: action.into(),
                    secondary: None,
                },
                &object_ref,
            )
            .await
        {
            tracing::warn!(reason = %reason, error = %e, "Failed to publish event");
        }
    }

    /// Publish a normal event for a resource
    pub async fn publish_normal_event(
        &self,
        resource: &Elasticsearch,
        reason: &str,
        action: &str,
        note: Option<String>,
    ) {
        self.publish(resource, EventType::Normal, reason, action, note)
            .await;
    }

    /// Publish a warning event for a resource
    pub async fn publish_warning_event(
        &self,
        resource: &Elasticsearch,
        reason: &str,
        action: &str,
        note: Option<String>,
    ) {
        self.publish(resource, EventType::Warning, reason, action, note)
            .await;
    }
}
