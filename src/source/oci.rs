//! Minimal OCI distribution client, enough to list tags on a Helm chart
//! repository and pull a chart layer. Handles anonymous access, basic auth
//! from a Docker-style config secret and the bearer-token challenge flow.

use std::collections::HashMap;

use reqwest::header::WWW_AUTHENTICATE;
use reqwest::{Response, StatusCode};
use serde::Deserialize;
use tracing::debug;

use crate::source::SourceError;

const MANIFEST_ACCEPT: &str =
    "application/vnd.oci.image.manifest.v1+json, application/vnd.oci.image.index.v1+json";
const HELM_CHART_LAYER: &str = "application/vnd.cncf.helm.chart.content.v1.tar+gzip";

/// A parsed `oci://host/repository` reference.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Reference {
    pub host: String,
    pub repository: String,
}

impl Reference {
    /// Parses an `oci://` chart reference into host and repository parts.
    pub fn parse(raw: &str) -> Result<Self, SourceError> {
        let trimmed = raw
            .strip_prefix("oci://")
            .ok_or_else(|| SourceError::Other(format!("not an oci reference: {raw}")))?;

        let (host, repository) = trimmed
            .split_once('/')
            .ok_or_else(|| SourceError::Other(format!("missing repository path in {raw}")))?;
        if host.is_empty() || repository.is_empty() {
            return Err(SourceError::Other(format!("malformed oci reference: {raw}")));
        }

        Ok(Self {
            host: host.to_string(),
            repository: repository.trim_end_matches('/').to_string(),
        })
    }
}

/// Username/password credentials for a registry host.
#[derive(Clone, Debug)]
pub struct Credentials {
    pub username: String,
    pub password: String,
}

/// Docker-style config file, the format stored under `.dockerconfigjson`.
#[derive(Deserialize)]
pub struct DockerConfig {
    #[serde(default)]
    auths: HashMap<String, DockerAuth>,
}

#[derive(Deserialize)]
struct DockerAuth {
    #[serde(default)]
    username: Option<String>,
    #[serde(default)]
    password: Option<String>,
}

impl DockerConfig {
    pub fn parse(raw: &[u8]) -> Result<Self, SourceError> {
        serde_json::from_slice(raw)
            .map_err(|e| SourceError::Other(format!("failed to parse docker config: {e}")))
    }

    /// Looks up credentials for a registry host.
    pub fn credentials_for(&self, host: &str) -> Option<Credentials> {
        let auth = self.auths.get(host)?;
        Some(Credentials {
            username: auth.username.clone()?,
            password: auth.password.clone()?,
        })
    }
}

#[derive(Deserialize)]
struct TagList {
    #[serde(default)]
    tags: Vec<String>,
}

#[derive(Deserialize)]
struct Manifest {
    #[serde(default)]
    layers: Vec<Descriptor>,
}

#[derive(Deserialize)]
struct Descriptor {
    #[serde(rename = "mediaType")]
    media_type: String,
    digest: String,
}

#[derive(Deserialize)]
struct TokenResponse {
    #[serde(default)]
    token: Option<String>,
    #[serde(default)]
    access_token: Option<String>,
}

/// Client against a single registry host.
pub struct Registry {
    http: reqwest::Client,
    credentials: Option<Credentials>,
}

impl Registry {
    pub fn new(http: reqwest::Client, credentials: Option<Credentials>) -> Self {
        Self { http, credentials }
    }

    /// Lists the tags of a repository; for Helm charts these are the chart
    /// versions.
    pub async fn list_tags(&self, reference: &Reference) -> Result<Vec<String>, SourceError> {
        let url = format!(
            "https://{}/v2/{}/tags/list",
            reference.host, reference.repository
        );
        let response = self.get(&url, reference, None).await?;
        let list: TagList = response.json().await?;

        Ok(list.tags)
    }

    /// Pulls the chart content layer of the manifest at `tag` and returns
    /// the raw tgz bytes.
    pub async fn pull_chart(
        &self,
        reference: &Reference,
        tag: &str,
    ) -> Result<Vec<u8>, SourceError> {
        let url = format!(
            "https://{}/v2/{}/manifests/{}",
            reference.host, reference.repository, tag
        );
        let response = self.get(&url, reference, Some(MANIFEST_ACCEPT)).await?;
        let manifest: Manifest = response.json().await?;

        let layer = manifest
            .layers
            .into_iter()
            .find(|l| l.media_type == HELM_CHART_LAYER)
            .ok_or_else(|| {
                SourceError::Other(format!("manifest {tag} has no helm chart content layer"))
            })?;

        let blob_url = format!(
            "https://{}/v2/{}/blobs/{}",
            reference.host, reference.repository, layer.digest
        );
        let response = self.get(&blob_url, reference, None).await?;
        let body = response.bytes().await?;

        Ok(body.to_vec())
    }

    /// Performs a GET, transparently following the registry's bearer-token
    /// challenge when the first attempt comes back 401.
    async fn get(
        &self,
        url: &str,
        reference: &Reference,
        accept: Option<&str>,
    ) -> Result<Response, SourceError> {
        let response = self.send(url, accept, Token::None).await?;
        if response.status() != StatusCode::UNAUTHORIZED {
            return checked(response, url);
        }

        let challenge = response
            .headers()
            .get(WWW_AUTHENTICATE)
            .and_then(|h| h.to_str().ok())
            .map(parse_challenge);

        let Some(challenge) = challenge else {
            return checked(response, url);
        };

        debug!(realm = %challenge.realm, "registry requested token auth");
        let token = self.request_token(&challenge, reference).await?;
        let response = self.send(url, accept, Token::Bearer(&token)).await?;

        checked(response, url)
    }

    async fn send(
        &self,
        url: &str,
        accept: Option<&str>,
        token: Token<'_>,
    ) -> Result<Response, SourceError> {
        let mut request = self.http.get(url);
        if let Some(accept) = accept {
            request = request.header(reqwest::header::ACCEPT, accept);
        }

        match token {
            Token::Bearer(token) => request = request.bearer_auth(token),
            Token::None => {
                if let Some(creds) = &self.credentials {
                    request = request.basic_auth(&creds.username, Some(&creds.password));
                }
            }
        }

        Ok(request.send().await?)
    }

    async fn request_token(
        &self,
        challenge: &Challenge,
        reference: &Reference,
    ) -> Result<String, SourceError> {
        let scope = challenge
            .scope
            .clone()
            .unwrap_or_else(|| format!("repository:{}:pull", reference.repository));

        let mut request = self.http.get(&challenge.realm).query(&[("scope", scope)]);
        if let Some(service) = &challenge.service {
            request = request.query(&[("service", service)]);
        }
        if let Some(creds) = &self.credentials {
            request = request.basic_auth(&creds.username, Some(&creds.password));
        }

        let response = request.send().await?;
        let status = response.status();
        if !status.is_success() {
            return Err(SourceError::from_status(status.as_u16(), &challenge.realm));
        }

        let token: TokenResponse = response.json().await?;
        token
            .token
            .or(token.access_token)
            .ok_or_else(|| SourceError::Other("token endpoint returned no token".to_string()))
    }
}

enum Token<'a> {
    None,
    Bearer(&'a str),
}

fn checked(response: Response, url: &str) -> Result<Response, SourceError> {
    let status = response.status();
    if !status.is_success() {
        return Err(SourceError::from_status(status.as_u16(), url));
    }

    Ok(response)
}

#[derive(Debug, Default, PartialEq, Eq)]
struct Challenge {
    realm: String,
    service: Option<String>,
    scope: Option<String>,
}

/// Parses a `WWW-Authenticate: Bearer realm="…",service="…",scope="…"`
/// header value.
fn parse_challenge(raw: &str) -> Challenge {
    let mut challenge = Challenge::default();
    let params = raw.strip_prefix("Bearer ").unwrap_or(raw);

    for param in params.split(',') {
        let Some((key, value)) = param.split_once('=') else {
            continue;
        };
        let value = value.trim().trim_matches('"').to_string();

        match key.trim() {
            "realm" => challenge.realm = value,
            "service" => challenge.service = Some(value),
            "scope" => challenge.scope = Some(value),
            _ => {}
        }
    }

    challenge
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_oci_references() {
        let reference = Reference::parse("oci://ghcr.io/skarlso/charts/crd-bootstrap").unwrap();
        assert_eq!(reference.host, "ghcr.io");
        assert_eq!(reference.repository, "skarlso/charts/crd-bootstrap");

        assert!(Reference::parse("https://example.com/chart").is_err());
        assert!(Reference::parse("oci://hostonly").is_err());
    }

    #[test]
    fn parses_bearer_challenges() {
        let challenge = parse_challenge(
            r#"Bearer realm="https://ghcr.io/token",service="ghcr.io",scope="repository:a/b:pull""#,
        );
        assert_eq!(challenge.realm, "https://ghcr.io/token");
        assert_eq!(challenge.service.as_deref(), Some("ghcr.io"));
        assert_eq!(challenge.scope.as_deref(), Some("repository:a/b:pull"));
    }

    #[test]
    fn docker_config_lookup() {
        let raw = br#"{"auths": {"ghcr.io": {"username": "bot", "password": "hunter2"}}}"#;
        let config = DockerConfig::parse(raw).unwrap();

        let creds = config.credentials_for("ghcr.io").unwrap();
        assert_eq!(creds.username, "bot");
        assert_eq!(creds.password, "hunter2");
        assert!(config.credentials_for("docker.io").is_none());
    }
}
