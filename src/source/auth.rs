//! Authenticated HTTP clients built from referenced secrets.

use k8s_openapi::api::core::v1::Secret;
use kube::{Api, Client};
use reqwest::header::{HeaderMap, HeaderValue, AUTHORIZATION};

use crate::crd::TOKEN_KEY;
use crate::source::SourceError;

/// Reads the named secret and returns the value stored under `key`.
pub async fn secret_value(
    client: &Client,
    namespace: &str,
    name: &str,
    key: &str,
) -> Result<Vec<u8>, SourceError> {
    let api: Api<Secret> = Api::namespaced(client.clone(), namespace);
    let secret = api.get(name).await?;

    secret
        .data
        .as_ref()
        .and_then(|data| data.get(key))
        .map(|bytes| bytes.0.clone())
        .ok_or_else(|| SourceError::SecretKeyMissing {
            name: name.to_string(),
            key: key.to_string(),
        })
}

/// Builds an HTTP client that sends the bearer token stored under the
/// `token` key of the referenced secret with every request.
pub async fn token_client(
    client: &Client,
    namespace: &str,
    secret_name: &str,
) -> Result<reqwest::Client, SourceError> {
    let token = secret_value(client, namespace, secret_name, TOKEN_KEY).await?;
    let token = String::from_utf8_lossy(&token).trim().to_string();

    let mut headers = HeaderMap::new();
    let mut value = HeaderValue::from_str(&format!("Bearer {token}"))
        .map_err(|e| SourceError::Other(format!("token is not a valid header value: {e}")))?;
    value.set_sensitive(true);
    headers.insert(AUTHORIZATION, value);

    reqwest::Client::builder()
        .default_headers(headers)
        .build()
        .map_err(SourceError::Http)
}
