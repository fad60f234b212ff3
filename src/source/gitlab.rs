//! GitLab source: the CRD manifest is a release asset link; the latest
//! release tag drives versioning.

use std::path::{Path, PathBuf};
use std::time::Duration;

use async_trait::async_trait;
use kube::Client;
use serde::Deserialize;
use tracing::debug;

use crate::crd::{Bootstrap, GitLabSource};
use crate::source::{auth, version, Decision, Source, SourceError};

const GITLAB_API_BASE: &str = "https://gitlab.com/api/v4";

/// Timeout for release metadata probes.
const PROBE_TIMEOUT: Duration = Duration::from_secs(15);

#[derive(Deserialize)]
struct ReleaseMeta {
    tag_name: String,
}

#[derive(Deserialize)]
struct Release {
    assets: Assets,
}

#[derive(Deserialize)]
struct Assets {
    links: Vec<AssetLink>,
}

#[derive(Deserialize)]
struct AssetLink {
    name: String,
    url: String,
}

pub struct GitLabProvider {
    http: reqwest::Client,
    client: Client,
    next: Option<Box<dyn Source>>,
}

impl GitLabProvider {
    pub fn new(http: reqwest::Client, client: Client, next: Option<Box<dyn Source>>) -> Self {
        Self { http, client, next }
    }

    async fn client_for(
        &self,
        source: &GitLabSource,
        namespace: &str,
    ) -> Result<reqwest::Client, SourceError> {
        match &source.secret_ref {
            Some(secret_ref) => auth::token_client(&self.client, namespace, &secret_ref.name).await,
            None => Ok(self.http.clone()),
        }
    }

    async fn get_checked(
        &self,
        http: &reqwest::Client,
        url: &str,
        timeout: Option<Duration>,
    ) -> Result<reqwest::Response, SourceError> {
        let mut request = http.get(url);
        if let Some(timeout) = timeout {
            request = request.timeout(timeout);
        }

        let response = request.send().await?;
        let status = response.status();
        if !status.is_success() {
            return Err(SourceError::from_status(status.as_u16(), url));
        }

        Ok(response)
    }

    /// Asks the GitLab API for the project's latest release tag.
    async fn latest_version(
        &self,
        source: &GitLabSource,
        namespace: &str,
    ) -> Result<String, SourceError> {
        let http = self.client_for(source, namespace).await?;
        let url = latest_release_url(source);
        debug!(%url, "checking for latest release");

        let response = self.get_checked(&http, &url, Some(PROBE_TIMEOUT)).await?;
        let meta: ReleaseMeta = response.json().await?;
        if meta.tag_name.is_empty() {
            return Err(SourceError::Other(
                "failed to retrieve latest version, please make sure owner and repo are spelled correctly"
                    .to_string(),
            ));
        }

        debug!(version = %meta.tag_name, "latest version found");

        Ok(meta.tag_name)
    }
}

/// URL of the latest-release permalink endpoint. GitLab addresses projects
/// by url-encoded `owner%2Frepo`.
pub fn latest_release_url(source: &GitLabSource) -> String {
    let api = source.base_api_url.as_deref().unwrap_or(GITLAB_API_BASE);
    format!(
        "{}/projects/{}%2F{}/releases/permalink/latest",
        api, source.owner, source.repo
    )
}

/// URL of the release metadata for a given tag.
pub fn release_url(source: &GitLabSource, tag: &str) -> String {
    let api = source.base_api_url.as_deref().unwrap_or(GITLAB_API_BASE);
    format!(
        "{}/projects/{}%2F{}/releases/{}",
        api, source.owner, source.repo, tag
    )
}

#[async_trait]
impl Source for GitLabProvider {
    async fn has_update(&self, bootstrap: &Bootstrap) -> Result<Decision, SourceError> {
        let Some(source) = &bootstrap.spec.source.git_lab else {
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
        let Some(source) = &bootstrap.spec.source.git_lab else {
            return match &self.next {
                Some(next) => next.fetch_crd(work_dir, bootstrap, revision).await,
                None => Err(SourceError::NoConfiguredSource),
            };
        };

        let namespace = bootstrap.metadata.namespace.as_deref().unwrap_or("default");
        let http = self.client_for(source, namespace).await?;

        // The release metadata carries named asset links; download the one
        // matching the configured manifest name.
        let response = self
            .get_checked(&http, &release_url(source, revision), None)
            .await?;
        let release: Release = response.json().await?;

        let asset_url = release
            .assets
            .links
            .into_iter()
            .find(|link| link.name == source.manifest)
            .map(|link| link.url)
            .ok_or_else(|| SourceError::AssetNotFound(source.manifest.clone()))?;

        let response = self.get_checked(&http, &asset_url, None).await?;
        let body = response.bytes().await?;

        let path = work_dir.join(&source.manifest);
        tokio::fs::write(&path, &body).await?;

        Ok(path)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn project_urls_are_percent_encoded() {
        let source = GitLabSource {
            base_api_url: None,
            owner: "skarlso".to_string(),
            repo: "gitlab-test-1".to_string(),
            manifest: "crds.yaml".to_string(),
            secret_ref: None,
        };

        assert_eq!(
            latest_release_url(&source),
            "https://gitlab.com/api/v4/projects/skarlso%2Fgitlab-test-1/releases/permalink/latest"
        );
        assert_eq!(
            release_url(&source, "v0.3.0"),
            "https://gitlab.com/api/v4/projects/skarlso%2Fgitlab-test-1/releases/v0.3.0"
        );
    }

    #[test]
    fn asset_links_deserialize() {
        let raw = r#"{"assets": {"links": [{"name": "crds.yaml", "url": "https://example.com/crds.yaml", "link_type": "other"}]}}"#;
        let release: Release = serde_json::from_str(raw).unwrap();
        assert_eq!(release.assets.links.len(), 1);
        assert_eq!(release.assets.links[0].name, "crds.yaml");
    }
}
