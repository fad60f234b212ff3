pub mod controller;
pub mod crd;
pub mod health;
pub mod source;
pub mod webhook;

pub use controller::{error_policy, reconcile, Backoff, Context, Error, Result, FINALIZER};
pub use crd::Bootstrap;

use std::sync::Arc;

use futures::StreamExt;
use kube::runtime::watcher::Config as WatcherConfig;
use kube::runtime::Controller;
use kube::{Api, Client};

use crate::health::HealthState;
use crate::webhook::TriggerMap;

/// Run the operator controller
///
/// This is the main controller loop that watches Bootstrap resources and
/// reconciles them. It can be called from main.rs or spawned as a background
/// task during integration tests.
pub async fn run_controller(
    client: Client,
    triggers: Arc<TriggerMap>,
    health_state: Option<Arc<HealthState>>,
) {
    tracing::info!("Starting controller for Bootstrap resources");

    let http = reqwest::Client::new();
    let source = source::build_chain(client.clone(), http);
    let ctx = Arc::new(Context::new(
        client.clone(),
        source,
        triggers,
        health_state,
    ));

    let bootstraps: Api<Bootstrap> = Api::all(client);

    // Configure watcher to handle dynamic resource creation
    let watcher_config = WatcherConfig::default().any_semantic();

    // Create and run the controller. Requeue cadence is driven by the
    // reconciler itself (spec.interval), so only the Bootstrap objects are
    // watched.
    Controller::new(bootstraps, watcher_config)
        .shutdown_on_signal()
        .run(reconcile, error_policy, ctx)
        .for_each(|result| async move {
            match result {
                Ok((obj, _action)) => {
                    tracing::debug!("Reconciled: {}", obj.name);
                }
                Err(e) => {
                    tracing::error!("Reconciliation error: {:?}", e);
                }
            }
        })
        .await;

    tracing::info!("Controller stream terminated");
}
