//! Status and conditions management for Bootstrap resources.

use chrono::Utc;
use kube::api::{Patch, PatchParams};
use kube::{Api, Client, ResourceExt};

use crate::controller::apply::FIELD_MANAGER;
use crate::controller::error::Result;
use crate::crd::{Bootstrap, BootstrapStatus, Condition};

/// Condition types published by the reconciler.
pub mod condition_types {
    /// The last reconcile of the observed generation succeeded.
    pub const READY: &str = "Ready";
}

/// Condition status values
pub mod condition_status {
    pub const TRUE: &str = "True";
    pub const FALSE: &str = "False";
}

/// Reason used on `Ready=True`.
pub const SUCCEEDED_REASON: &str = "Succeeded";

/// Sets a condition in place, preserving the transition time when the
/// status value did not change.
pub fn set_condition(
    conditions: &mut Vec<Condition>,
    generation: Option<i64>,
    type_: &str,
    status: &str,
    reason: &str,
    message: &str,
) {
    let now = Utc::now().to_rfc3339();

    if let Some(existing) = conditions.iter_mut().find(|c| c.type_ == type_) {
        if existing.status != status {
            existing.last_transition_time = now;
        }
        existing.status = status.to_string();
        existing.reason = reason.to_string();
        existing.message = message.to_string();
        existing.observed_generation = generation;
        return;
    }

    conditions.push(Condition {
        type_: type_.to_string(),
        status: status.to_string(),
        reason: reason.to_string(),
        message: message.to_string(),
        last_transition_time: now,
        observed_generation: generation,
    });
}

/// Marks `Ready=True` on the given status.
pub fn mark_ready(status: &mut BootstrapStatus, generation: Option<i64>, message: &str) {
    set_condition(
        &mut status.conditions,
        generation,
        condition_types::READY,
        condition_status::TRUE,
        SUCCEEDED_REASON,
        message,
    );
}

/// Marks `Ready=False` with the given reason on the given status.
pub fn mark_not_ready(
    status: &mut BootstrapStatus,
    generation: Option<i64>,
    reason: &str,
    message: &str,
) {
    set_condition(
        &mut status.conditions,
        generation,
        condition_types::READY,
        condition_status::FALSE,
        reason,
        message,
    );
}

/// Patches the status subresource of a Bootstrap.
pub async fn patch_status(
    client: &Client,
    bootstrap: &Bootstrap,
    status: &BootstrapStatus,
) -> Result<()> {
    let namespace = bootstrap.metadata.namespace.as_deref().unwrap_or("default");
    let api: Api<Bootstrap> = Api::namespaced(client.clone(), namespace);
    let name = bootstrap.name_any();

    let patch = serde_json::json!({ "status": status });
    api.patch_status(
        &name,
        &PatchParams::apply(FIELD_MANAGER),
        &Patch::Merge(&patch),
    )
    .await?;

    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn transition_time_only_moves_on_status_change() {
        let mut conditions = Vec::new();
        set_condition(
            &mut conditions,
            Some(1),
            condition_types::READY,
            condition_status::TRUE,
            SUCCEEDED_REASON,
            "applied",
        );
        let first_transition = conditions[0].last_transition_time.clone();

        // Same status again, message refreshed but no transition.
        set_condition(
            &mut conditions,
            Some(2),
            condition_types::READY,
            condition_status::TRUE,
            SUCCEEDED_REASON,
            "still applied",
        );
        assert_eq!(conditions.len(), 1);
        assert_eq!(conditions[0].last_transition_time, first_transition);
        assert_eq!(conditions[0].message, "still applied");
        assert_eq!(conditions[0].observed_generation, Some(2));

        // Flipping the status records a transition.
        set_condition(
            &mut conditions,
            Some(3),
            condition_types::READY,
            condition_status::FALSE,
            "CRDFetchFailed",
            "boom",
        );
        assert_eq!(conditions[0].status, condition_status::FALSE);
        assert_eq!(conditions[0].reason, "CRDFetchFailed");
    }
}
