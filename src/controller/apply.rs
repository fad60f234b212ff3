//! Server-side apply of CRD objects and the wait for their establishment.

use std::time::Duration;

use k8s_openapi::apiextensions_apiserver::pkg::apis::apiextensions::v1::CustomResourceDefinition;
use kube::api::{Patch, PatchParams};
use kube::config::{KubeConfigOptions, Kubeconfig};
use kube::{Api, Client, Config, ResourceExt};
use tokio::time::{sleep, Instant};
use tracing::{debug, info};

use crate::controller::error::{Error, Result};
use crate::crd::{Bootstrap, BOOTSTRAP_OWNER_LABEL_KEY, KUBECONFIG_KEY};
use crate::source::auth;

/// Field manager identity under server-side apply.
pub const FIELD_MANAGER: &str = "delivery";

/// How long a CRD may take to reach Established after an apply.
pub const WAIT_TIMEOUT: Duration = Duration::from_secs(60);

const WAIT_POLL_INTERVAL: Duration = Duration::from_secs(2);

/// Builds the client for the cluster the CRDs should land in: a kubeconfig
/// held in a secret, an impersonated service account, or the local cluster.
pub async fn target_client(client: &Client, bootstrap: &Bootstrap) -> Result<Client> {
    let Some(kube_config) = &bootstrap.spec.kube_config else {
        return Ok(client.clone());
    };

    let namespace = bootstrap.metadata.namespace.as_deref().unwrap_or("default");

    if let Some(secret_ref) = &kube_config.secret_ref {
        let key = secret_ref.key.as_deref().unwrap_or(KUBECONFIG_KEY);
        let raw = auth::secret_value(client, namespace, &secret_ref.name, key)
            .await
            .map_err(|e| Error::ResourceManager(e.to_string()))?;

        let kubeconfig = Kubeconfig::from_yaml(&String::from_utf8_lossy(&raw))
            .map_err(|e| Error::ResourceManager(format!("loading kubeconfig failed: {e}")))?;
        let config = Config::from_custom_kubeconfig(kubeconfig, &KubeConfigOptions::default())
            .await
            .map_err(|e| Error::ResourceManager(format!("loading kubeconfig failed: {e}")))?;

        return Client::try_from(config).map_err(|e| Error::ResourceManager(e.to_string()));
    }

    if let Some(service_account) = &kube_config.service_account {
        let mut config = Config::infer()
            .await
            .map_err(|e| Error::ResourceManager(e.to_string()))?;
        config.auth_info.impersonate =
            Some(format!("system:serviceaccount:{namespace}:{service_account}"));

        return Client::try_from(config).map_err(|e| Error::ResourceManager(e.to_string()));
    }

    Ok(client.clone())
}

/// Stamps the owner label onto every object. The label is the sole index
/// prune uses; an unlabeled CRD is never deleted.
pub fn tag_crds(crds: &mut [CustomResourceDefinition], owner: &str) {
    for crd in crds {
        crd.labels_mut()
            .insert(BOOTSTRAP_OWNER_LABEL_KEY.to_string(), owner.to_string());
    }
}

/// Server-side-applies every object in loader order, taking ownership of
/// conflicting fields.
pub async fn apply_crds(client: &Client, crds: &[CustomResourceDefinition]) -> Result<()> {
    let api: Api<CustomResourceDefinition> = Api::all(client.clone());
    let params = PatchParams::apply(FIELD_MANAGER).force();

    for crd in crds {
        let name = crd.name_any();
        api.patch(&name, &params, &Patch::Apply(crd))
            .await
            .map_err(Error::Apply)?;
        debug!(%name, "applied CustomResourceDefinition");
    }

    Ok(())
}

/// Polls every applied CRD until its status reports both `Established` and
/// `NamesAccepted`, or the timeout elapses.
pub async fn wait_for_established(client: &Client, crds: &[CustomResourceDefinition]) -> Result<()> {
    let api: Api<CustomResourceDefinition> = Api::all(client.clone());
    let deadline = Instant::now() + WAIT_TIMEOUT;

    for crd in crds {
        let name = crd.name_any();

        loop {
            let current = api.get(&name).await.map_err(|e| Error::Wait(e.to_string()))?;
            if is_established(&current) {
                info!(%name, "CustomResourceDefinition established");
                break;
            }

            if Instant::now() + WAIT_POLL_INTERVAL > deadline {
                return Err(Error::Wait(format!(
                    "CustomResourceDefinition {name} did not become established within {WAIT_TIMEOUT:?}"
                )));
            }

            sleep(WAIT_POLL_INTERVAL).await;
        }
    }

    Ok(())
}

/// Whether the API server accepted the CRD's names and serves the new kind.
pub fn is_established(crd: &CustomResourceDefinition) -> bool {
    let conditions = crd
        .status
        .as_ref()
        .map(|s| s.conditions.as_deref().unwrap_or_default())
        .unwrap_or_default();

    let has = |type_: &str| {
        conditions
            .iter()
            .any(|c| c.type_ == type_ && c.status == "True")
    };

    has("Established") && has("NamesAccepted")
}

#[cfg(test)]
mod tests {
    use super::*;
    use k8s_openapi::apiextensions_apiserver::pkg::apis::apiextensions::v1::{
        CustomResourceDefinitionCondition, CustomResourceDefinitionStatus,
    };

    fn crd_with_conditions(conditions: Vec<(&str, &str)>) -> CustomResourceDefinition {
        CustomResourceDefinition {
            status: Some(CustomResourceDefinitionStatus {
                conditions: Some(
                    conditions
                        .into_iter()
                        .map(|(type_, status)| CustomResourceDefinitionCondition {
                            type_: type_.to_string(),
                            status: status.to_string(),
                            ..Default::default()
                        })
                        .collect(),
                ),
                ..Default::default()
            }),
            ..Default::default()
        }
    }

    #[test]
    fn established_requires_both_conditions() {
        assert!(is_established(&crd_with_conditions(vec![
            ("Established", "True"),
            ("NamesAccepted", "True"),
        ])));
        assert!(!is_established(&crd_with_conditions(vec![
            ("Established", "True"),
            ("NamesAccepted", "False"),
        ])));
        assert!(!is_established(&crd_with_conditions(vec![(
            "Established",
            "True"
        )])));
        assert!(!is_established(&CustomResourceDefinition::default()));
    }

    #[test]
    fn tagging_preserves_existing_labels() {
        let mut crd = CustomResourceDefinition::default();
        crd.metadata.name = Some("krokevents.delivery.krok.app".to_string());
        crd.labels_mut()
            .insert("app.kubernetes.io/name".to_string(), "krok".to_string());

        let mut crds = vec![crd];
        tag_crds(&mut crds, "bootstrap-sample");

        let labels = crds[0].labels();
        assert_eq!(
            labels.get(BOOTSTRAP_OWNER_LABEL_KEY).map(String::as_str),
            Some("bootstrap-sample")
        );
        assert_eq!(
            labels.get("app.kubernetes.io/name").map(String::as_str),
            Some("krok")
        );
    }
}
