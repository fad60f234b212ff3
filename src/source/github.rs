//! GitHub source: the CRD manifest is a release asset; the latest release
//! tag drives versioning.

use std::path::{Path, PathBuf};
use std::time::Duration;

use async_trait::async_trait;
use kube::Client;
use serde::Deserialize;
use tracing::debug;

use crate::crd::{Bootstrap, GitHubSource};
use crate::source::{auth, version, Decision, Source, SourceError};

const GITHUB_BASE: &str = "https://github.com";
const GITHUB_API_BASE: &str = "https://api.github.com";

/// Timeout for release metadata probes.
const PROBE_TIMEOUT: Duration = Duration::from_secs(15);

#[derive(Deserialize)]
struct ReleaseMeta {
    tag_name: String,
}

pub struct GitHubProvider {
    http: reqwest::Client,
    client: Client,
    next: Option<Box<dyn Source>>,
}

impl GitHubProvider {
    pub fn new(http: reqwest::Client, client: Client, next: Option<Box<dyn Source>>) -> Self {
        Self { http, client, next }
    }

    async fn client_for(
        &self,
        source: &GitHubSource,
        namespace: &str,
    ) -> Result<reqwest::Client, SourceError> {
        match &source.secret_ref {
            Some(secret_ref) => auth::token_client(&self.client, namespace, &secret_ref.name).await,
            None => Ok(self.http.clone()),
        }
    }

    /// Asks the GitHub API for the repository's latest release tag.
    async fn latest_version(
        &self,
        source: &GitHubSource,
        namespace: &str,
    ) -> Result<String, SourceError> {
        let http = self.client_for(source, namespace).await?;
        let url = latest_release_url(source);
        debug!(%url, "checking for latest release");

        let response = http.get(&url).timeout(PROBE_TIMEOUT).send().await?;
        let status = response.status();
        if !status.is_success() {
            return Err(SourceError::from_status(status.as_u16(), &url));
        }

        let meta: ReleaseMeta = response.json().await?;
        if meta.tag_name.is_empty() {
            return Err(SourceError::Other(
                "failed to retrieve latest version, please make sure owner and repo are spelled correctly"
                    .to_string(),
            ));
        }

        Ok(meta.tag_name)
    }
}

/// URL of the latest-release metadata endpoint.
pub fn latest_release_url(source: &GitHubSource) -> String {
    let api = source.base_api_url.as_deref().unwrap_or(GITHUB_API_BASE);
    format!("{}/repos/{}/{}/releases/latest", api, source.owner, source.repo)
}

/// URL of the release asset for a given tag.
pub fn download_url(source: &GitHubSource, tag: &str) -> String {
    let base = source.base_url.as_deref().unwrap_or(GITHUB_BASE);
    format!(
        "{}/{}/{}/releases/download/{}/{}",
        base, source.owner, source.repo, tag, source.manifest
    )
}

#[async_trait]
impl Source for GitHubProvider {
    async fn has_update(&self, bootstrap: &Bootstrap) -> Result<Decision, SourceError> {
        let Some(source) = &bootstrap.spec.source.git_hub else {
            return match &self.next {
                Some(next) => next.has_update(bootstrap).await,
                None => Err(SourceError::NoConfiguredSource),
            };
        };

        let namespace = bootstrap.metadata.namespace.as_deref().unwrap_or("default");
        let latest = self.latest_version(source, namespace).await?;

        version::decide(
            &latest,
            bootstrap
                .status
                .as_ref()
                .and_then(|s| s.last_applied_revision.as_deref()),
            bootstrap.semver_constraint(),
        )
    }

    async fn fetch_crd(
        &self,
        work_dir: &Path,
        bootstrap: &Bootstrap,
        revision: &str,
    ) -> Result<PathBuf, SourceError> {
        let Some(source) = &bootstrap.spec.source.git_hub else {
            return match &self.next {
                Some(next) => next.fetch_crd(work_dir, bootstrap, revision).await,
                None => Err(SourceError::NoConfiguredSource),
            };
        };

        let namespace = bootstrap.metadata.namespace.as_deref().unwrap_or("default");
        let http = self.client_for(source, namespace).await?;

        let url = download_url(source, revision);
        let response = http.get(&url).send().await?;
        let status = response.status();
        if !status.is_success() {
            return Err(SourceError::from_status(status.as_u16(), &url));
        }

        let body = response.bytes().await?;
        let path = work_dir.join(&source.manifest);
        tokio::fs::write(&path, &body).await?;

        Ok(path)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sample_source() -> GitHubSource {
        GitHubSource {
            base_url: None,
            base_api_url: None,
            owner: "krok-o".to_string(),
            repo: "operator".to_string(),
            manifest: "delivery.yaml".to_string(),
            secret_ref: None,
        }
    }

    #[test]
    fn default_urls() {
        let source = sample_source();
        assert_eq!(
            latest_release_url(&source),
            "https://api.github.com/repos/krok-o/operator/releases/latest"
        );
        assert_eq!(
            download_url(&source, "v1.2.3"),
            "https://github.com/krok-o/operator/releases/download/v1.2.3/delivery.yaml"
        );
    }

    #[test]
    fn base_url_overrides() {
        let mut source = sample_source();
        source.base_url = Some("https://ghe.example.com".to_string());
        source.base_api_url = Some("https://ghe.example.com/api/v3".to_string());

        assert_eq!(
            latest_release_url(&source),
            "https://ghe.example.com/api/v3/repos/krok-o/operator/releases/latest"
        );
        assert_eq!(
            download_url(&source, "v2.0.0"),
            "https://ghe.example.com/krok-o/operator/releases/download/v2.0.0/delivery.yaml"
        );
    }
}
