//! Shared context for the Bootstrap controller.

use std::sync::Arc;

use kube::runtime::events::{Event, EventType, Recorder, Reporter};
use kube::{Client, Resource};

use crate::controller::error::RetryLedger;
use crate::crd::Bootstrap;
use crate::health::HealthState;
use crate::source::Source;
use crate::webhook::TriggerMap;

/// Shared state handed to every reconcile invocation.
pub struct Context {
    /// Kubernetes client for the cluster the operator runs in.
    pub client: Client,
    /// Source provider chain.
    pub source: Box<dyn Source>,
    /// Webhook trigger registrations, shared with the webhook server.
    pub triggers: Arc<TriggerMap>,
    /// Consecutive-failure counts driving the retry backoff.
    pub retries: RetryLedger,
    /// Event reporter identity.
    reporter: Reporter,
    /// Health state for metrics (optional for tests).
    pub health_state: Option<Arc<HealthState>>,
}

impl Context {
    pub fn new(
        client: Client,
        source: Box<dyn Source>,
        triggers: Arc<TriggerMap>,
        health_state: Option<Arc<HealthState>>,
    ) -> Self {
        Self {
            client,
            source,
            triggers,
            retries: RetryLedger::new(),
            reporter: Reporter {
                controller: "crd-bootstrap".into(),
                instance: std::env::var("POD_NAME").ok(),
            },
            health_state,
        }
    }

    /// Record a successful reconciliation in metrics
    pub fn record_reconcile(&self, namespace: &str, name: &str, duration_secs: f64) {
        if let Some(ref state) = self.health_state {
            state
                .metrics
                .record_reconcile(namespace, name, duration_secs);
        }
    }

    /// Record a failed reconciliation in metrics
    pub fn record_error(&self, namespace: &str, name: &str) {
        if let Some(ref state) = self.health_state {
            state.metrics.record_error(namespace, name);
        }
    }

    /// Record the number of CRDs applied in one pass
    pub fn record_crds_applied(&self, namespace: &str, name: &str, count: u64) {
        if let Some(ref state) = self.health_state {
            state.metrics.record_crds_applied(namespace, name, count);
        }
    }

    fn recorder(&self) -> Recorder {
        Recorder::new(self.client.clone(), self.reporter.clone())
    }

    /// Publish a normal event for a Bootstrap
    pub async fn publish_normal_event(
        &self,
        bootstrap: &Bootstrap,
        reason: &str,
        action: &str,
        note: Option<String>,
    ) {
        let recorder = self.recorder();
        let object_ref = bootstrap.object_ref(&());
        if let Err(e) = recorder
            .publish(
                &Event {
                    type_: EventType::Normal,
                    reason: reason.into(),
                    note,
                    action: action.into(),
                    secondary: None,
                },
                &object_ref,
            )
            .await
        {
            tracing::warn!("Failed to publish event: {}", e);
        }
    }

    /// Publish a warning event for a Bootstrap
    pub async fn publish_warning_event(
        &self,
        bootstrap: &Bootstrap,
        reason: &str,
        action: &str,
        note: Option<String>,
    ) {
        let recorder = self.recorder();
        let object_ref = bootstrap.object_ref(&());
        if let Err(e) = recorder
            .publish(
                &Event {
                    type_: EventType::Warning,
                    reason: reason.into(),
                    note,
                    action: action.into(),
                    secondary: None,
                },
                &object_ref,
            )
            .await
        {
            tracing::warn!("Failed to publish warning event: {}", e);
        }
    }
}
