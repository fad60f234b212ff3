//! Reconciliation logic for Bootstrap resources.
//!
//! One pass asks the source chain whether a new revision should land,
//! fetches and parses it, validates it, server-side-applies the contained
//! CRDs and records the outcome in status. Deleting a Bootstrap prunes the
//! CRDs it owns when `spec.prune` is set.

use std::sync::Arc;

use k8s_openapi::apiextensions_apiserver::pkg::apis::apiextensions::v1::CustomResourceDefinition;
use kube::api::{DeleteParams, ListParams, Patch, PatchParams};
use kube::runtime::controller::Action;
use kube::{Api, Client, ResourceExt};
use tracing::{debug, error, info, instrument, warn};

use crate::controller::apply::{self, FIELD_MANAGER};
use crate::controller::breaking;
use crate::controller::context::Context;
use crate::controller::error::{Backoff, Error, Result};
use crate::controller::manifest;
use crate::controller::status::{self, mark_not_ready, mark_ready};
use crate::controller::validation;
use crate::crd::{Bootstrap, BootstrapStatus, UpdatePolicy, BOOTSTRAP_OWNER_LABEL_KEY};

/// Finalizer held while the controller still has teardown work to do.
pub const FINALIZER: &str = "delivery.crd-bootstrap";

/// Ready message used on both the applied and the no-update-needed paths.
const APPLIED_MESSAGE: &str = "Successfully applied crd(s)";

/// Main reconciliation function
#[instrument(skip(bootstrap, ctx), fields(name = %bootstrap.name_any(), namespace = bootstrap.namespace().unwrap_or_default()))]
pub async fn reconcile(bootstrap: Arc<Bootstrap>, ctx: Arc<Context>) -> Result<Action> {
    let start = std::time::Instant::now();
    let ns = bootstrap.namespace().unwrap_or_default();
    let name = bootstrap.name_any();

    if bootstrap.metadata.deletion_timestamp.is_some() {
        return handle_deletion(&bootstrap, &ctx, &ns).await;
    }

    info!("starting reconcile loop");

    ensure_finalizer(&bootstrap, &ctx, &ns).await?;

    let mut status = bootstrap.status.clone().unwrap_or_default();
    let outcome = reconcile_inner(&bootstrap, &ctx, &ns, &mut status).await;

    if let Err(primary) = &outcome {
        mark_not_ready(
            &mut status,
            bootstrap.metadata.generation,
            primary.reason(),
            &primary.to_string(),
        );
    }

    // Deferred status patch: the observed generation and conditions are
    // written on every exit path. A patch failure is joined with the
    // primary error, never replacing it.
    status.observed_generation = bootstrap.metadata.generation;
    let patch_outcome = status::patch_status(&ctx.client, &bootstrap, &status).await;

    let result = match (outcome, patch_outcome) {
        (Ok(action), Ok(())) => Ok(action),
        (Ok(_), Err(patch_err)) => Err(patch_err),
        (Err(primary), Ok(())) => Err(primary),
        (Err(primary), Err(patch_err)) => Err(Error::WithStatusPatchFailure {
            primary: Box::new(primary),
            patch: Box::new(patch_err),
        }),
    };

    match &result {
        Ok(_) => {
            // A completed pass ends the failure streak; the next error
            // backs off from the start again.
            ctx.retries.reset(&ns, &name);
            ctx.record_reconcile(&ns, &name, start.elapsed().as_secs_f64());
        }
        Err(e) => {
            error!("reconciliation failed: {e}");
            ctx.record_error(&ns, &name);
            ctx.publish_warning_event(
                &bootstrap,
                e.reason(),
                "Reconcile",
                Some(e.to_string()),
            )
            .await;
        }
    }

    result
}

/// Error policy: requeue with a delay that escalates for every consecutive
/// failure of the same object, read from the context's retry ledger.
pub fn error_policy(bootstrap: Arc<Bootstrap>, error: &Error, ctx: Arc<Context>) -> Action {
    let ns = bootstrap.namespace().unwrap_or_default();
    let name = bootstrap.name_any();

    let attempt = ctx.retries.note_failure(&ns, &name);
    let delay = Backoff::default().delay_for(error, attempt);

    if error.is_retryable() {
        warn!(
            "retryable error for {} (attempt {}): {}, requeuing in {:?}",
            name, attempt, error, delay
        );
    } else {
        error!(
            "non-retryable error for {}: {}, requeuing in {:?} pending a spec change",
            name, error, delay
        );
    }

    Action::requeue(delay)
}

/// The main pipeline: decide, fetch, parse, validate, apply, wait, record.
///
/// Conditions for the failure paths that return without an error are set
/// here; every `Err` return is translated into `Ready=False` with the
/// error's reason by the caller.
async fn reconcile_inner(
    bootstrap: &Bootstrap,
    ctx: &Context,
    ns: &str,
    status: &mut BootstrapStatus,
) -> Result<Action> {
    let generation = bootstrap.metadata.generation;
    let name = bootstrap.name_any();

    wait_for_trigger(bootstrap, ctx, ns, &name).await;

    let decision = ctx.source.has_update(bootstrap).await.map_err(Error::Fetch)?;
    if !decision.needs_apply {
        info!("no update was required");
        mark_ready(status, generation, APPLIED_MESSAGE);

        return Ok(Action::requeue(bootstrap.requeue_after()));
    }

    let revision = decision.revision;
    info!(%revision, "fetching CRD content");

    // Recorded before anything can fail so diagnosis survives a crash.
    status.last_attempted_revision = Some(revision.clone());

    // The temp directory is owned by this reconcile alone and removed on
    // every exit path when the guard drops.
    let temp = tempfile::Builder::new()
        .prefix("crd")
        .tempdir()
        .map_err(Error::TempFolder)?;

    let location = ctx
        .source
        .fetch_crd(temp.path(), bootstrap, &revision)
        .await
        .map_err(Error::Fetch)?;

    let target = apply::target_client(&ctx.client, bootstrap).await?;

    let mut crds = manifest::load_crds(&location)?;
    apply::tag_crds(&mut crds, &name);

    let mut applied = status.last_applied_crd_names.clone();
    for crd in &crds {
        *applied.entry(crd.name_any()).or_insert(0) += 1;
    }

    if let Err(err) = validation::validate_templates(bootstrap, &crds) {
        if !bootstrap.spec.continue_on_validation_error {
            error!("validation failed for the CRD with the provided template: {err}");
            mark_not_ready(status, generation, err.reason(), &err.to_string());

            // A failing template is a spec mistake; retrying without a spec
            // change cannot succeed.
            return Ok(Action::await_change());
        }

        warn!("validation failed for the CRD, but continue is set so the error is ignored: {err}");
    }

    if let Some(policy) = bootstrap.spec.update_policy {
        let found = breaking_changes_against_cluster(&target, &crds).await?;
        status.breaking_changes = found.clone();

        if !found.is_empty() {
            match policy {
                UpdatePolicy::Safe => {
                    let err = Error::BreakingChange(found.join("; "));
                    error!("{err}");
                    mark_not_ready(status, generation, err.reason(), &err.to_string());

                    return Ok(Action::await_change());
                }
                UpdatePolicy::Force => {
                    warn!(
                        changes = found.len(),
                        "breaking schema changes detected, applying anyway and recording them"
                    );
                }
            }
        }
    }

    apply::apply_crds(&target, &crds).await?;
    apply::wait_for_established(&target, &crds).await?;

    status.last_applied_crd_names = applied;
    status.last_applied_revision = Some(revision.clone());
    mark_ready(status, generation, APPLIED_MESSAGE);

    ctx.record_crds_applied(ns, &name, crds.len() as u64);
    ctx.publish_normal_event(
        bootstrap,
        "Applied",
        "Apply",
        Some(format!("applied revision {revision}")),
    )
    .await;

    info!("all done");

    Ok(Action::requeue(bootstrap.requeue_after()))
}

/// When the push webhook is enabled for this object, hold the poll until a
/// trigger arrives, falling back to the regular interval.
async fn wait_for_trigger(bootstrap: &Bootstrap, ctx: &Context, ns: &str, name: &str) {
    if !bootstrap
        .spec
        .webhook
        .as_ref()
        .is_some_and(|w| w.enabled)
    {
        return;
    }

    let trigger = ctx.triggers.register(ns, name);
    tokio::select! {
        _ = trigger.notified() => {
            info!("webhook trigger received");
        }
        _ = tokio::time::sleep(bootstrap.requeue_after()) => {
            debug!("no webhook trigger within the interval, polling anyway");
        }
    }
}

/// Diffs each incoming CRD against the one currently installed under the
/// same name. CRDs not installed yet have nothing to break.
async fn breaking_changes_against_cluster(
    client: &Client,
    crds: &[CustomResourceDefinition],
) -> Result<Vec<String>> {
    let api: Api<CustomResourceDefinition> = Api::all(client.clone());
    let mut found = Vec::new();

    for crd in crds {
        let name = crd.name_any();
        if let Some(existing) = api.get_opt(&name).await? {
            for change in breaking::detect_breaking_changes(&existing, crd) {
                found.push(format!("{name}: {change}"));
            }
        }
    }

    Ok(found)
}

/// Check if the finalizer is present
fn has_finalizer(bootstrap: &Bootstrap) -> bool {
    bootstrap
        .metadata
        .finalizers
        .as_ref()
        .is_some_and(|f| f.contains(&FINALIZER.to_string()))
}

/// Add the finalizer if missing, keeping any foreign finalizers intact.
async fn ensure_finalizer(bootstrap: &Bootstrap, ctx: &Context, ns: &str) -> Result<()> {
    if has_finalizer(bootstrap) {
        return Ok(());
    }

    let api: Api<Bootstrap> = Api::namespaced(ctx.client.clone(), ns);
    let name = bootstrap.name_any();

    let mut finalizers = bootstrap.metadata.finalizers.clone().unwrap_or_default();
    finalizers.push(FINALIZER.to_string());

    let patch = serde_json::json!({
        "metadata": {
            "finalizers": finalizers
        }
    });

    api.patch(&name, &PatchParams::apply(FIELD_MANAGER), &Patch::Merge(&patch))
        .await?;

    info!("added finalizer to {}", name);
    Ok(())
}

/// Remove our finalizer, keeping any foreign finalizers intact.
async fn remove_finalizer(bootstrap: &Bootstrap, ctx: &Context, ns: &str) -> Result<()> {
    let api: Api<Bootstrap> = Api::namespaced(ctx.client.clone(), ns);
    let name = bootstrap.name_any();

    let finalizers: Vec<String> = bootstrap
        .metadata
        .finalizers
        .clone()
        .unwrap_or_default()
        .into_iter()
        .filter(|f| f != FINALIZER)
        .collect();

    let patch = serde_json::json!({
        "metadata": {
            "finalizers": finalizers
        }
    });

    api.patch(&name, &PatchParams::apply(FIELD_MANAGER), &Patch::Merge(&patch))
        .await?;

    info!("removed finalizer from {}", name);
    Ok(())
}

/// Teardown: prune owned CRDs when requested, then release the finalizer.
/// A prune failure keeps the finalizer so the object stays visible with a
/// clear error.
async fn handle_deletion(bootstrap: &Bootstrap, ctx: &Context, ns: &str) -> Result<Action> {
    let name = bootstrap.name_any();

    if !has_finalizer(bootstrap) {
        return Ok(Action::await_change());
    }

    info!("handling deletion of {}", name);
    ctx.triggers.unregister(ns, &name);
    ctx.retries.reset(ns, &name);

    if bootstrap.spec.prune {
        info!("cleaning owned CRDs");

        let target = apply::target_client(&ctx.client, bootstrap).await?;
        let api: Api<CustomResourceDefinition> = Api::all(target);

        let selector = format!("{BOOTSTRAP_OWNER_LABEL_KEY}={name}");
        let owned = api.list(&ListParams::default().labels(&selector)).await?;

        info!(count = owned.items.len(), "found owned CRDs to clean");

        for crd in owned {
            let crd_name = crd.name_any();
            match api.delete(&crd_name, &DeleteParams::default()).await {
                Ok(_) => debug!(crd = %crd_name, "removed CRD"),
                Err(kube::Error::Api(e)) if e.code == 404 => {}
                Err(e) => return Err(e.into()),
            }
        }
    }

    remove_finalizer(bootstrap, ctx, ns).await?;

    Ok(Action::await_change())
}
