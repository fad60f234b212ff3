//! Push-trigger webhook server.
//!
//! A webhook call wakes the matching Bootstrap's reconcile ahead of its
//! polling interval. The server validates required headers and an HMAC
//! signature against a referenced secret, then checks that the payload
//! matches the Bootstrap's configured source before signalling.

use std::collections::{BTreeMap, HashMap};
use std::sync::{Arc, RwLock};

use axum::body::Bytes;
use axum::extract::{Path, State};
use axum::http::{HeaderMap, StatusCode};
use axum::response::IntoResponse;
use axum::routing::{get, post};
use axum::Router;
use hmac::{Hmac, Mac};
use kube::{Api, Client, ResourceExt};
use serde::Deserialize;
use sha2::Sha256;
use tokio::net::TcpListener;
use tokio::sync::Notify;
use tracing::{info, warn};

use crate::crd::{Bootstrap, GitHubSource, GitLabSource, HelmSource, WebhookSpec};

const DEFAULT_SECRET_KEY: &str = "secret";

/// Registry of per-Bootstrap wake-up signals, keyed by `namespace/name`.
///
/// Each entry behaves like a single-slot channel: signalling an already
/// pending entry is a no-op, so a burst of webhook calls collapses into one
/// wake-up.
#[derive(Default)]
pub struct TriggerMap {
    inner: RwLock<HashMap<String, Arc<Notify>>>,
}

impl TriggerMap {
    pub fn new() -> Self {
        Self::default()
    }

    fn key(namespace: &str, name: &str) -> String {
        format!("{namespace}/{name}")
    }

    /// Creates or returns the trigger for a Bootstrap.
    pub fn register(&self, namespace: &str, name: &str) -> Arc<Notify> {
        let key = Self::key(namespace, name);
        let mut map = self.inner.write().expect("trigger map lock poisoned");

        map.entry(key).or_default().clone()
    }

    /// Drops the trigger for a Bootstrap, typically on deletion.
    pub fn unregister(&self, namespace: &str, name: &str) {
        let key = Self::key(namespace, name);
        let mut map = self.inner.write().expect("trigger map lock poisoned");
        map.remove(&key);
    }

    /// Wakes a registered Bootstrap. Unknown keys are ignored.
    pub fn trigger(&self, namespace: &str, name: &str) {
        let key = Self::key(namespace, name);
        let map = self.inner.read().expect("trigger map lock poisoned");
        if let Some(notify) = map.get(&key) {
            notify.notify_one();
        }
    }
}

/// The payload shape shared by GitHub and GitLab release webhooks plus the
/// subset Helm repositories send.
#[derive(Debug, Default, Deserialize)]
pub struct WebhookPayload {
    #[serde(default)]
    pub repository: PayloadRepository,
    #[serde(default)]
    pub action: String,
}

#[derive(Debug, Default, Deserialize)]
pub struct PayloadRepository {
    #[serde(default)]
    pub name: String,
    #[serde(default)]
    pub full_name: String,
}

/// Checks that the payload is about the repository or chart the Bootstrap
/// actually watches.
pub fn validate_payload(bootstrap: &Bootstrap, payload: &WebhookPayload) -> bool {
    let source = &bootstrap.spec.source;

    if let Some(github) = &source.git_hub {
        return validate_github_payload(github, payload);
    }
    if let Some(gitlab) = &source.git_lab {
        return validate_gitlab_payload(gitlab, payload);
    }
    if let Some(helm) = &source.helm {
        return validate_helm_payload(helm, payload);
    }

    false
}

fn validate_github_payload(github: &GitHubSource, payload: &WebhookPayload) -> bool {
    let expected = format!("{}/{}", github.owner, github.repo);
    payload.repository.full_name == expected && payload.action == "published"
}

fn validate_gitlab_payload(gitlab: &GitLabSource, payload: &WebhookPayload) -> bool {
    let expected = format!("{}/{}", gitlab.owner, gitlab.repo);
    payload.repository.full_name == expected
}

fn validate_helm_payload(helm: &HelmSource, payload: &WebhookPayload) -> bool {
    helm.chart_name.as_deref() == Some(payload.repository.name.as_str())
}

/// Verifies the request's HMAC-SHA256 signature against the shared key.
/// GitHub sends `X-Hub-Signature-256: sha256=<hex>`; GitLab sends the bare
/// hex under `X-Gitlab-Token`.
pub fn verify_signature(key: &[u8], headers: &HeaderMap, body: &[u8]) -> Result<(), String> {
    let signature = headers
        .get("X-Hub-Signature-256")
        .or_else(|| headers.get("X-Gitlab-Token"))
        .and_then(|v| v.to_str().ok())
        .ok_or_else(|| "no signature found in headers".to_string())?;

    let signature = signature.strip_prefix("sha256=").unwrap_or(signature);
    let signature =
        hex::decode(signature).map_err(|_| "signature is not valid hex".to_string())?;

    let mut mac = Hmac::<Sha256>::new_from_slice(key)
        .map_err(|_| "invalid HMAC key length".to_string())?;
    mac.update(body);
    mac.verify_slice(&signature)
        .map_err(|_| "HMAC signature validation failed".to_string())
}

/// Checks that every header required by the webhook spec is present with
/// the exact expected value.
pub fn verify_headers(required: &BTreeMap<String, String>, headers: &HeaderMap) -> Result<(), String> {
    for (key, expected) in required {
        let actual = headers.get(key).and_then(|v| v.to_str().ok());
        if actual != Some(expected.as_str()) {
            return Err(format!("header {key} mismatch"));
        }
    }

    Ok(())
}

struct ServerState {
    client: Client,
    triggers: Arc<TriggerMap>,
}

/// Runs the webhook server on the given port.
pub async fn run_webhook_server(
    client: Client,
    triggers: Arc<TriggerMap>,
    port: u16,
) -> Result<(), std::io::Error> {
    let state = Arc::new(ServerState { client, triggers });

    let app = Router::new()
        .route("/webhook/{name}", post(handle_webhook))
        .route("/health", get(|| async { (StatusCode::OK, "OK") }))
        .with_state(state);

    let listener = TcpListener::bind(("0.0.0.0", port)).await?;
    info!(%port, "webhook server listening");

    axum::serve(listener, app).await
}

async fn handle_webhook(
    Path(name): Path<String>,
    State(state): State<Arc<ServerState>>,
    headers: HeaderMap,
    body: Bytes,
) -> impl IntoResponse {
    let bootstrap = match find_bootstrap(&state.client, &name).await {
        Ok(bootstrap) => bootstrap,
        Err(message) => {
            warn!(%name, %message, "webhook request for unknown Bootstrap");
            return (StatusCode::NOT_FOUND, "Bootstrap object not found");
        }
    };

    let Some(webhook) = bootstrap.spec.webhook.as_ref().filter(|w| w.enabled) else {
        return (StatusCode::BAD_REQUEST, "Webhook not enabled");
    };

    if let Err(message) = authenticate(&state.client, &bootstrap, webhook, &headers, &body).await {
        warn!(%name, %message, "webhook authentication failed");
        return (StatusCode::UNAUTHORIZED, "Authentication failed");
    }

    let payload: WebhookPayload = match serde_json::from_slice(&body) {
        Ok(payload) => payload,
        Err(_) => return (StatusCode::BAD_REQUEST, "Invalid payload"),
    };

    if !validate_payload(&bootstrap, &payload) {
        return (StatusCode::BAD_REQUEST, "Payload validation failed");
    }

    let namespace = bootstrap.metadata.namespace.as_deref().unwrap_or("default");
    state.triggers.trigger(namespace, &bootstrap.name_any());
    info!(%name, "webhook processed, reconcile triggered");

    (StatusCode::OK, "OK")
}

/// Looks up a Bootstrap by name across all namespaces; webhook paths only
/// carry the name.
async fn find_bootstrap(client: &Client, name: &str) -> Result<Bootstrap, String> {
    let api: Api<Bootstrap> = Api::all(client.clone());
    let list = api
        .list(&Default::default())
        .await
        .map_err(|e| format!("failed to list Bootstrap objects: {e}"))?;

    list.items
        .into_iter()
        .find(|b| b.name_any() == name)
        .ok_or_else(|| format!("Bootstrap object {name} not found"))
}

async fn authenticate(
    client: &Client,
    bootstrap: &Bootstrap,
    webhook: &WebhookSpec,
    headers: &HeaderMap,
    body: &[u8],
) -> Result<(), String> {
    verify_headers(&webhook.headers, headers)?;

    let Some(secret_ref) = &webhook.secret else {
        return Ok(());
    };

    let namespace = secret_ref
        .namespace
        .as_deref()
        .or(bootstrap.metadata.namespace.as_deref())
        .unwrap_or("default");
    let key_name = secret_ref.secret_key.as_deref().unwrap_or(DEFAULT_SECRET_KEY);

    let key = crate::source::auth::secret_value(client, namespace, &secret_ref.name, key_name)
        .await
        .map_err(|e| format!("failed to get webhook secret: {e}"))?;

    verify_signature(&key, headers, body)
}

#[cfg(test)]
mod tests {
    use super::*;
    use sha2::Digest;

    #[test]
    fn trigger_map_register_is_idempotent() {
        let map = TriggerMap::new();
        let first = map.register("default", "sample");
        let second = map.register("default", "sample");
        assert!(Arc::ptr_eq(&first, &second));

        map.unregister("default", "sample");
        let third = map.register("default", "sample");
        assert!(!Arc::ptr_eq(&first, &third));
    }

    #[test]
    fn triggering_unknown_key_is_a_noop() {
        let map = TriggerMap::new();
        map.trigger("default", "missing");
    }

    #[test]
    fn hmac_signature_round_trip() {
        let key = b"webhook-secret";
        let body = br#"{"action": "published"}"#;

        let mut mac = Hmac::<Sha256>::new_from_slice(key).unwrap();
        mac.update(body);
        let signature = hex::encode(mac.finalize().into_bytes());

        let mut headers = HeaderMap::new();
        headers.insert(
            "X-Hub-Signature-256",
            format!("sha256={signature}").parse().unwrap(),
        );
        assert!(verify_signature(key, &headers, body).is_ok());

        // Tampered body fails.
        assert!(verify_signature(key, &headers, b"{}").is_err());
    }

    #[test]
    fn missing_signature_is_rejected() {
        let headers = HeaderMap::new();
        assert!(verify_signature(b"key", &headers, b"body").is_err());

        // A digest of the body is not an HMAC.
        let mut headers = HeaderMap::new();
        let digest = hex::encode(Sha256::digest(b"body"));
        headers.insert("X-Gitlab-Token", digest.parse().unwrap());
        assert!(verify_signature(b"key", &headers, b"body").is_err());
    }

    #[test]
    fn required_headers_must_match_exactly() {
        let mut required = BTreeMap::new();
        required.insert("X-Custom".to_string(), "expected".to_string());

        let mut headers = HeaderMap::new();
        headers.insert("X-Custom", "expected".parse().unwrap());
        assert!(verify_headers(&required, &headers).is_ok());

        headers.insert("X-Custom", "other".parse().unwrap());
        assert!(verify_headers(&required, &headers).is_err());
    }
}
