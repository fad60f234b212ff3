//! Helm source: CRDs are collected from every directory literally named
//! `crds` inside a chart. Charts come from either an HTTP repository
//! (`index.yaml`) or an OCI registry.

use std::collections::HashMap;
use std::fs;
use std::io;
use std::path::{Path, PathBuf};

use async_trait::async_trait;
use flate2::read::GzDecoder;
use kube::Client;
use serde::Deserialize;
use tar::Archive;
use tracing::debug;

use crate::crd::{
    Bootstrap, HelmSource, DOCKER_JSON_CONFIG_KEY, PASSWORD_KEY, TOKEN_KEY, USERNAME_KEY,
};
use crate::source::oci::{Credentials, DockerConfig, Reference, Registry};
use crate::source::{auth, version, Decision, Source, SourceError};

const MANIFEST_FILE: &str = "crds.yaml";

/// Parsed subset of a Helm repository `index.yaml`. Helm's own search
/// machinery needs repositories added and refreshed first; reading the index
/// directly avoids all of that.
#[derive(Deserialize)]
struct RepoIndex {
    #[serde(default)]
    entries: HashMap<String, Vec<IndexEntry>>,
}

#[derive(Deserialize)]
struct IndexEntry {
    version: String,
    #[serde(default)]
    urls: Vec<String>,
}

enum HttpRepoAuth {
    None,
    Basic { username: String, password: String },
    Bearer(String),
}

pub struct HelmProvider {
    http: reqwest::Client,
    client: Client,
    next: Option<Box<dyn Source>>,
}

impl HelmProvider {
    pub fn new(http: reqwest::Client, client: Client, next: Option<Box<dyn Source>>) -> Self {
        Self { http, client, next }
    }

    fn is_oci(reference: &str) -> bool {
        reference.starts_with("oci://")
    }

    /// Reads the credentials secret for an OCI registry and picks the entry
    /// matching the reference's host.
    async fn oci_credentials(
        &self,
        source: &HelmSource,
        namespace: &str,
        reference: &Reference,
    ) -> Result<Option<Credentials>, SourceError> {
        let Some(secret_ref) = &source.secret_ref else {
            return Ok(None);
        };

        let raw = auth::secret_value(
            &self.client,
            namespace,
            &secret_ref.name,
            DOCKER_JSON_CONFIG_KEY,
        )
        .await?;
        let config = DockerConfig::parse(&raw)?;

        config
            .credentials_for(&reference.host)
            .map(Some)
            .ok_or_else(|| {
                SourceError::Other(format!(
                    "failed to find auth configuration for host {}",
                    reference.host
                ))
            })
    }

    /// Reads the credentials secret for an HTTP repository. Username plus
    /// password selects basic auth; a lone token selects bearer auth.
    async fn http_repo_auth(
        &self,
        source: &HelmSource,
        namespace: &str,
    ) -> Result<HttpRepoAuth, SourceError> {
        let Some(secret_ref) = &source.secret_ref else {
            return Ok(HttpRepoAuth::None);
        };

        let api: kube::Api<k8s_openapi::api::core::v1::Secret> =
            kube::Api::namespaced(self.client.clone(), namespace);
        let secret = api.get(&secret_ref.name).await?;
        let data = secret.data.unwrap_or_default();

        if let (Some(username), Some(password)) = (data.get(USERNAME_KEY), data.get(PASSWORD_KEY)) {
            return Ok(HttpRepoAuth::Basic {
                username: String::from_utf8_lossy(&username.0).to_string(),
                password: String::from_utf8_lossy(&password.0).to_string(),
            });
        }

        if let Some(token) = data.get(TOKEN_KEY) {
            return Ok(HttpRepoAuth::Bearer(
                String::from_utf8_lossy(&token.0).trim().to_string(),
            ));
        }

        Err(SourceError::SecretKeyMissing {
            name: secret_ref.name.clone(),
            key: format!("{USERNAME_KEY}/{PASSWORD_KEY} or {TOKEN_KEY}"),
        })
    }

    async fn get_with_auth(
        &self,
        url: &str,
        repo_auth: &HttpRepoAuth,
    ) -> Result<reqwest::Response, SourceError> {
        let mut request = self.http.get(url);
        match repo_auth {
            HttpRepoAuth::Basic { username, password } => {
                request = request.basic_auth(username, Some(password));
            }
            HttpRepoAuth::Bearer(token) => request = request.bearer_auth(token),
            HttpRepoAuth::None => {}
        }

        let response = request.send().await?;
        let status = response.status();
        if !status.is_success() {
            return Err(SourceError::from_status(status.as_u16(), url));
        }

        Ok(response)
    }

    async fn fetch_index(
        &self,
        source: &HelmSource,
        repo_auth: &HttpRepoAuth,
    ) -> Result<RepoIndex, SourceError> {
        let url = format!(
            "{}/index.yaml",
            source.chart_reference.trim_end_matches('/')
        );
        debug!(%url, "fetching repository index");

        let response = self.get_with_auth(&url, repo_auth).await?;
        let body = response.bytes().await?;

        serde_yaml::from_slice(&body)
            .map_err(|e| SourceError::Other(format!("failed to parse index.yaml: {e}")))
    }

    fn chart_name<'a>(source: &'a HelmSource) -> Result<&'a str, SourceError> {
        source.chart_name.as_deref().ok_or_else(|| {
            SourceError::Other("chartName is required for HTTP helm repositories".to_string())
        })
    }

    /// Collects the version list for the chart, from tags (OCI) or the
    /// repository index (HTTP).
    async fn versions(
        &self,
        source: &HelmSource,
        namespace: &str,
    ) -> Result<Vec<String>, SourceError> {
        if Self::is_oci(&source.chart_reference) {
            let reference = Reference::parse(&source.chart_reference)?;
            let credentials = self.oci_credentials(source, namespace, &reference).await?;
            let registry = Registry::new(self.http.clone(), credentials);

            return registry.list_tags(&reference).await;
        }

        let repo_auth = self.http_repo_auth(source, namespace).await?;
        let index = self.fetch_index(source, &repo_auth).await?;
        let name = Self::chart_name(source)?;

        let entries = index.entries.get(name).ok_or_else(|| {
            SourceError::Other(format!("no charts found in registry with name {name}"))
        })?;

        Ok(entries.iter().map(|e| e.version.clone()).collect())
    }

    /// Downloads the chart tgz for `revision` and returns its bytes.
    async fn download_chart(
        &self,
        source: &HelmSource,
        namespace: &str,
        revision: &str,
    ) -> Result<Vec<u8>, SourceError> {
        if Self::is_oci(&source.chart_reference) {
            let reference = Reference::parse(&source.chart_reference)?;
            let credentials = self.oci_credentials(source, namespace, &reference).await?;
            let registry = Registry::new(self.http.clone(), credentials);

            return registry.pull_chart(&reference, revision).await;
        }

        let repo_auth = self.http_repo_auth(source, namespace).await?;
        let index = self.fetch_index(source, &repo_auth).await?;
        let name = Self::chart_name(source)?;

        let url = index
            .entries
            .get(name)
            .and_then(|entries| entries.iter().find(|e| e.version == revision))
            .and_then(|entry| entry.urls.first())
            .map(|url| resolve_chart_url(&source.chart_reference, url))
            .ok_or_else(|| {
                SourceError::Other(format!("chart {name} version {revision} not found in index"))
            })?;

        let response = self.get_with_auth(&url, &repo_auth).await?;
        let body = response.bytes().await?;

        Ok(body.to_vec())
    }
}

/// Index entries may carry absolute URLs or paths relative to the
/// repository root.
fn resolve_chart_url(repo: &str, url: &str) -> String {
    if url.starts_with("http://") || url.starts_with("https://") {
        return url.to_string();
    }

    format!("{}/{}", repo.trim_end_matches('/'), url)
}

/// Expands a chart tgz and concatenates every file found under any directory
/// literally named `crds` into a `---`-separated bundle at
/// `<work_dir>/crds.yaml`.
fn extract_crds(work_dir: &Path, chart_tgz: &[u8]) -> Result<PathBuf, SourceError> {
    let chart_dir = work_dir.join("helm-temp");
    fs::create_dir_all(&chart_dir)?;

    let decoder = GzDecoder::new(chart_tgz);
    Archive::new(decoder).unpack(&chart_dir)?;

    let mut bundle = Vec::new();
    for file in collect_crd_files(&chart_dir)? {
        let content = fs::read(&file)?;
        bundle.extend_from_slice(b"---\n");
        bundle.extend_from_slice(&content);
    }

    let path = work_dir.join(MANIFEST_FILE);
    fs::write(&path, bundle)?;
    fs::remove_dir_all(&chart_dir)?;

    Ok(path)
}

/// Walks the extracted tree and returns the files of every directory named
/// `crds`, in stable traversal order.
fn collect_crd_files(root: &Path) -> io::Result<Vec<PathBuf>> {
    let mut found = Vec::new();
    let mut stack = vec![root.to_path_buf()];

    while let Some(dir) = stack.pop() {
        let mut entries: Vec<_> = fs::read_dir(&dir)?.collect::<io::Result<_>>()?;
        entries.sort_by_key(|e| e.path());

        for entry in entries {
            let path = entry.path();
            if !path.is_dir() {
                continue;
            }

            if path.file_name().is_some_and(|n| n == "crds") {
                let mut files: Vec<_> = fs::read_dir(&path)?
                    .collect::<io::Result<Vec<_>>>()?
                    .into_iter()
                    .map(|e| e.path())
                    .filter(|p| p.is_file())
                    .collect();
                files.sort();
                found.extend(files);
            } else {
                stack.push(path);
            }
        }
    }

    Ok(found)
}

#[async_trait]
impl Source for HelmProvider {
    async fn has_update(&self, bootstrap: &Bootstrap) -> Result<Decision, SourceError> {
        let Some(source) = &bootstrap.spec.source.helm else {
            return match &self.next {
                Some(next) => next.has_update(bootstrap).await,
                None => Err(SourceError::NoConfiguredSource),
            };
        };

        let namespace = bootstrap.metadata.namespace.as_deref().unwrap_or("default");
        let versions = self.versions(source, namespace).await?;
        let constraint = bootstrap.semver_constraint();
        let latest = version::pick_latest_satisfying(&versions, constraint)?;

        version::decide(
            &latest,
            bootstrap
                .status
                .as_ref()
                .and_then(|s| s.last_applied_revision.as_deref()),
            constraint,
        )
    }

    async fn fetch_crd(
        &self,
        work_dir: &Path,
        bootstrap: &Bootstrap,
        revision: &str,
    ) -> Result<PathBuf, SourceError> {
        let Some(source) = &bootstrap.spec.source.helm else {
            return match &self.next {
                Some(next) => next.fetch_crd(work_dir, bootstrap, revision).await,
                None => Err(SourceError::NoConfiguredSource),
            };
        };

        let namespace = bootstrap.metadata.namespace.as_deref().unwrap_or("default");
        let chart = self.download_chart(source, namespace, revision).await?;

        extract_crds(work_dir, &chart)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_repo_index() {
        let raw = r#"
apiVersion: v1
entries:
  crd-bootstrap:
    - version: 0.4.3
      urls:
        - charts/crd-bootstrap-0.4.3.tgz
    - version: 0.4.2
      urls:
        - https://charts.example.com/crd-bootstrap-0.4.2.tgz
"#;
        let index: RepoIndex = serde_yaml::from_str(raw).unwrap();
        let entries = &index.entries["crd-bootstrap"];
        assert_eq!(entries.len(), 2);
        assert_eq!(entries[0].version, "0.4.3");
    }

    #[test]
    fn resolves_relative_chart_urls() {
        assert_eq!(
            resolve_chart_url("https://charts.example.com/", "charts/a-1.0.0.tgz"),
            "https://charts.example.com/charts/a-1.0.0.tgz"
        );
        assert_eq!(
            resolve_chart_url("https://charts.example.com", "https://cdn.example.com/a.tgz"),
            "https://cdn.example.com/a.tgz"
        );
    }

    #[test]
    fn collects_files_from_crds_directories_only() {
        let root = tempfile::tempdir().unwrap();
        let chart = root.path().join("chart");
        fs::create_dir_all(chart.join("crds")).unwrap();
        fs::create_dir_all(chart.join("templates")).unwrap();
        fs::create_dir_all(chart.join("charts/sub/crds")).unwrap();

        fs::write(chart.join("crds/a.yaml"), "kind: A").unwrap();
        fs::write(chart.join("templates/b.yaml"), "kind: B").unwrap();
        fs::write(chart.join("charts/sub/crds/c.yaml"), "kind: C").unwrap();

        let files = collect_crd_files(root.path()).unwrap();
        let names: Vec<_> = files
            .iter()
            .filter_map(|p| p.file_name().and_then(|n| n.to_str()))
            .collect();

        assert_eq!(files.len(), 2);
        assert!(names.contains(&"a.yaml"));
        assert!(names.contains(&"c.yaml"));
        assert!(!names.contains(&"b.yaml"));
    }
}
