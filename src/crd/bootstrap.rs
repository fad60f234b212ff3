use kube::CustomResource;
use schemars::JsonSchema;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::time::Duration;

/// Label carried by every CRD applied by the operator. The value is the name
/// of the owning Bootstrap; prune only ever deletes CRDs carrying it.
pub const BOOTSTRAP_OWNER_LABEL_KEY: &str = "delivery.crd-bootstrap.owned";

/// Secret key holding a bearer token for URL/GitHub/GitLab/Helm sources.
pub const TOKEN_KEY: &str = "token";
/// Secret keys for basic auth against HTTP Helm repositories.
pub const USERNAME_KEY: &str = "username";
pub const PASSWORD_KEY: &str = "password";
/// Secret key holding a Docker-style config for OCI Helm registries.
pub const DOCKER_JSON_CONFIG_KEY: &str = ".dockerconfigjson";
/// Default secret key holding a kubeconfig for remote-cluster targeting.
pub const KUBECONFIG_KEY: &str = "value";

/// Requeue interval used when the spec does not declare one.
const DEFAULT_INTERVAL: Duration = Duration::from_secs(600);

/// Bootstrap is the Schema for the bootstraps API. It declares a single
/// source of truth for a set of CRDs, a version constraint and how to keep
/// the cluster in sync with it.
#[derive(CustomResource, Serialize, Deserialize, Clone, Debug, JsonSchema)]
#[kube(
    group = "delivery.crd-bootstrap",
    version = "v1alpha1",
    kind = "Bootstrap",
    plural = "bootstraps",
    namespaced,
    status = "BootstrapStatus",
    printcolumn = r#"{"name":"Ready", "type":"string", "jsonPath":".status.conditions[?(@.type==\"Ready\")].status"}"#,
    printcolumn = r#"{"name":"Status", "type":"string", "jsonPath":".status.conditions[?(@.type==\"Ready\")].message"}"#,
    printcolumn = r#"{"name":"Applied", "type":"string", "jsonPath":".status.lastAppliedRevision"}"#,
    printcolumn = r#"{"name":"Age", "type":"date", "jsonPath":".metadata.creationTimestamp"}"#
)]
#[serde(rename_all = "camelCase")]
pub struct BootstrapSpec {
    /// Regular interval at which to poll the source for a new version,
    /// e.g. "30s", "5m", "1h". Defaults to ten minutes.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub interval: Option<String>,

    /// Reference to a source which provides CRD content based on some
    /// contract. Exactly one sub-field is expected to be set; dispatch picks
    /// the first populated one.
    pub source: Source,

    /// Constraints for sources to check candidates against. Either a semver
    /// constraint, or a digest in case of URL sources. A pinned digest will
    /// ONLY sync content matching that digest.
    #[serde(default)]
    pub version: VersionSpec,

    /// Example objects keyed by CRD kind, validated against the fetched
    /// CRD's schema before applying. Values are preserved unchanged.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub template: Option<BTreeMap<String, serde_json::Value>>,

    /// Still apply a CRD even if template validation failed for it.
    #[serde(default)]
    pub continue_on_validation_error: bool,

    /// Clean up all applied CRDs once the Bootstrap object is removed.
    #[serde(default)]
    pub prune: bool,

    /// How to treat schema changes that would reject previously-valid stored
    /// instances. Unset disables the check.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub update_policy: Option<UpdatePolicy>,

    /// Target a remote cluster instead of the one the operator runs in.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub kube_config: Option<KubeConfig>,

    /// Push-trigger configuration. When enabled, a webhook call can wake the
    /// reconciler ahead of its polling interval.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub webhook: Option<WebhookSpec>,
}

/// Options from where to fetch CRD content.
#[derive(Serialize, Deserialize, Clone, Debug, Default, JsonSchema)]
#[serde(rename_all = "camelCase")]
pub struct Source {
    /// ConfigMap type source.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub config_map: Option<ConfigMapSource>,

    /// GitLab release type source.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub git_lab: Option<GitLabSource>,

    /// GitHub release type source.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub git_hub: Option<GitHubSource>,

    /// URL type source.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub url: Option<UrlSource>,

    /// Helm chart type source.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub helm: Option<HelmSource>,
}

/// Reference to a ConfigMap holding the CRD content under `crd.yaml` and its
/// version under `version`.
#[derive(Serialize, Deserialize, Clone, Debug, JsonSchema)]
#[serde(rename_all = "camelCase")]
pub struct ConfigMapSource {
    /// Name of the config map.
    pub name: String,
    /// Namespace of the config map.
    pub namespace: String,
}

/// A URL from which to fetch the CRD. Versioning is driven by the digest of
/// the downloaded content.
#[derive(Serialize, Deserialize, Clone, Debug, JsonSchema)]
#[serde(rename_all = "camelCase")]
pub struct UrlSource {
    /// URL from which to download the YAML content.
    pub url: String,
    /// Secret holding a bearer token under `token` in case the URL isn't
    /// public.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub secret_ref: Option<LocalObjectReference>,
}

/// A GitHub source where the CRD comes from the release section of a
/// repository.
#[derive(Serialize, Deserialize, Clone, Debug, JsonSchema)]
#[serde(rename_all = "camelCase")]
pub struct GitHubSource {
    /// Overrides the GitHub download url. Defaults to github.com.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub base_url: Option<String>,
    /// Overrides the GitHub API url. Defaults to api.github.com.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub base_api_url: Option<String>,
    /// Owner of the repository.
    pub owner: String,
    /// Name of the repository.
    pub repo: String,
    /// Name of the release asset that contains the CRD definitions.
    pub manifest: String,
    /// Secret holding a token under `token` in case the repository is
    /// private.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub secret_ref: Option<LocalObjectReference>,
}

/// A GitLab source where the CRD comes from the release assets of a project.
#[derive(Serialize, Deserialize, Clone, Debug, JsonSchema)]
#[serde(rename_all = "camelCase")]
pub struct GitLabSource {
    /// Overrides the GitLab API url. Defaults to gitlab.com/api/v4.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub base_api_url: Option<String>,
    /// Owner of the project.
    pub owner: String,
    /// Name of the project.
    pub repo: String,
    /// Name of the release asset link that contains the CRD definitions.
    pub manifest: String,
    /// Secret holding a token under `token` in case the project is private.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub secret_ref: Option<LocalObjectReference>,
}

/// A Helm chart source. CRDs are collected from every directory literally
/// named `crds` inside the chart.
#[derive(Serialize, Deserialize, Clone, Debug, JsonSchema)]
#[serde(rename_all = "camelCase")]
pub struct HelmSource {
    /// Either an HTTP repository URL or an `oci://` reference.
    pub chart_reference: String,
    /// Chart name inside an HTTP repository's index. Ignored for OCI
    /// references.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub chart_name: Option<String>,
    /// Credentials secret. `username`/`password` for HTTP repositories, a
    /// `.dockerconfigjson` entry for OCI registries.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub secret_ref: Option<LocalObjectReference>,
}

/// Reference to a secret in the Bootstrap's own namespace.
#[derive(Serialize, Deserialize, Clone, Debug, JsonSchema)]
#[serde(rename_all = "camelCase")]
pub struct LocalObjectReference {
    /// Name of the referenced secret.
    pub name: String,
}

/// Constraints sources check candidate revisions against. A semver
/// constraint and a pinned digest are mutually exclusive forms; the digest
/// form only applies to URL sources.
#[derive(Serialize, Deserialize, Clone, Debug, Default, JsonSchema)]
#[serde(rename_all = "camelCase")]
pub struct VersionSpec {
    /// A constraint expression like `>=v1 <v2`.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub semver: Option<String>,

    /// Hex-encoded sha-256 of the content behind a URL source.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub digest: Option<String>,
}

/// What to do when an incoming CRD schema would reject previously-valid
/// stored instances.
#[derive(Serialize, Deserialize, Clone, Copy, Debug, PartialEq, Eq, JsonSchema)]
#[serde(rename_all = "lowercase")]
pub enum UpdatePolicy {
    /// Abort the apply and surface the breaking changes in status.
    Safe,
    /// Apply anyway but record the breaking changes for operator review.
    Force,
}

/// Remote-cluster binding. Either a secret holding a kubeconfig, or a
/// service account to impersonate.
#[derive(Serialize, Deserialize, Clone, Debug, JsonSchema)]
#[serde(rename_all = "camelCase")]
pub struct KubeConfig {
    /// Secret holding a kubeconfig under `value` (or `key` if set).
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub secret_ref: Option<KubeConfigSecretReference>,

    /// Service account to impersonate in the local cluster.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub service_account: Option<String>,
}

/// Reference to a kubeconfig-holding secret with an optional key override.
#[derive(Serialize, Deserialize, Clone, Debug, JsonSchema)]
#[serde(rename_all = "camelCase")]
pub struct KubeConfigSecretReference {
    /// Name of the secret.
    pub name: String,
    /// Key inside the secret. Defaults to `value`.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub key: Option<String>,
}

/// Push-trigger configuration for a Bootstrap.
#[derive(Serialize, Deserialize, Clone, Debug, JsonSchema)]
#[serde(rename_all = "camelCase")]
pub struct WebhookSpec {
    /// Whether webhook triggering is enabled for this object.
    #[serde(default)]
    pub enabled: bool,

    /// Secret used to validate the HMAC signature of incoming requests.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub secret: Option<WebhookSecretReference>,

    /// Headers that must be present with exactly these values.
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub headers: BTreeMap<String, String>,
}

/// Reference to the secret holding the webhook HMAC key.
#[derive(Serialize, Deserialize, Clone, Debug, JsonSchema)]
#[serde(rename_all = "camelCase")]
pub struct WebhookSecretReference {
    /// Name of the secret.
    pub name: String,
    /// Namespace of the secret. Defaults to the Bootstrap's namespace.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub namespace: Option<String>,
    /// Key inside the secret. Defaults to `secret`.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub secret_key: Option<String>,
}

/// Observed state of a Bootstrap.
#[derive(Serialize, Deserialize, Clone, Debug, Default, JsonSchema)]
#[serde(rename_all = "camelCase")]
pub struct BootstrapStatus {
    /// Last reconciled generation.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub observed_generation: Option<i64>,

    /// Conditions of this object. The reconciler publishes `Ready`.
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub conditions: Vec<Condition>,

    /// Names of every CRD ever applied under this Bootstrap and the number
    /// of times each was applied.
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub last_applied_crd_names: BTreeMap<String, i64>,

    /// Version or digest most recently attempted, whether it succeeded or
    /// failed.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub last_attempted_revision: Option<String>,

    /// Version or digest that was last successfully applied.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub last_applied_revision: Option<String>,

    /// Breaking schema changes found during the last reconcile that ran the
    /// update-policy check.
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub breaking_changes: Vec<String>,
}

/// Kubernetes-style condition.
#[derive(Serialize, Deserialize, Clone, Debug, JsonSchema)]
#[serde(rename_all = "camelCase")]
pub struct Condition {
    /// Type of condition.
    #[serde(rename = "type")]
    pub type_: String,

    /// Status of the condition: True, False, or Unknown.
    pub status: String,

    /// Reason for the condition's last transition.
    pub reason: String,

    /// Human-readable message.
    pub message: String,

    /// Last time the condition transitioned.
    pub last_transition_time: String,

    /// Generation observed when the condition was set.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub observed_generation: Option<i64>,
}

impl Bootstrap {
    /// Duration after which the object must be reconciled again.
    pub fn requeue_after(&self) -> Duration {
        self.spec
            .interval
            .as_deref()
            .and_then(|raw| parse_duration(raw).ok())
            .filter(|d| !d.is_zero())
            .unwrap_or(DEFAULT_INTERVAL)
    }

    /// The semver constraint, defaulting to "match anything" when unset.
    pub fn semver_constraint(&self) -> &str {
        self.spec.version.semver.as_deref().unwrap_or("*")
    }
}

/// Parses a Kubernetes-style duration string such as "90s", "5m" or "1h30m".
/// Supported units are ms, s, m and h.
pub fn parse_duration(raw: &str) -> Result<Duration, String> {
    let s = raw.trim();
    if s.is_empty() {
        return Err("empty duration".to_string());
    }

    let mut total = Duration::ZERO;
    let mut chars = s.chars().peekable();

    while chars.peek().is_some() {
        let mut number = String::new();
        while let Some(c) = chars.peek() {
            if c.is_ascii_digit() || *c == '.' {
                number.push(*c);
                chars.next();
            } else {
                break;
            }
        }

        let value: f64 = number
            .parse()
            .map_err(|_| format!("invalid number in duration {raw:?}"))?;

        let mut unit = String::new();
        while let Some(c) = chars.peek() {
            if c.is_ascii_alphabetic() {
                unit.push(*c);
                chars.next();
            } else {
                break;
            }
        }

        let multiplier = match unit.as_str() {
            "ms" => 0.001,
            "s" => 1.0,
            "m" => 60.0,
            "h" => 3600.0,
            _ => return Err(format!("unknown unit {unit:?} in duration {raw:?}")),
        };

        total += Duration::from_secs_f64(value * multiplier);
    }

    Ok(total)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_simple_durations() {
        assert_eq!(parse_duration("10s").unwrap(), Duration::from_secs(10));
        assert_eq!(parse_duration("5m").unwrap(), Duration::from_secs(300));
        assert_eq!(parse_duration("1h30m").unwrap(), Duration::from_secs(5400));
        assert_eq!(parse_duration("500ms").unwrap(), Duration::from_millis(500));
    }

    #[test]
    fn rejects_garbage_durations() {
        assert!(parse_duration("").is_err());
        assert!(parse_duration("10x").is_err());
        assert!(parse_duration("abc").is_err());
    }
}
