//! Source providers for CRD content.
//!
//! A provider answers two questions: "is there a revision we should apply?"
//! and "fetch that revision into this directory". Providers are composed as
//! a linear responsibility chain; each one handles the call when its
//! sub-field of `spec.source` is populated and delegates to the next one
//! otherwise. The tail of the chain fails with [`SourceError::NoConfiguredSource`].

pub mod auth;
pub mod configmap;
pub mod github;
pub mod gitlab;
pub mod helm;
pub mod oci;
pub mod url;
pub mod version;

use std::path::{Path, PathBuf};

use async_trait::async_trait;
use thiserror::Error;

use crate::crd::Bootstrap;

/// Outcome of an update probe against a source.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Decision {
    /// Whether the revision should be applied.
    pub needs_apply: bool,
    /// The candidate revision (a semver tag or a content digest). When no
    /// apply is needed this carries the revision the object stays on.
    pub revision: String,
}

impl Decision {
    pub fn apply(revision: impl Into<String>) -> Self {
        Self {
            needs_apply: true,
            revision: revision.into(),
        }
    }

    pub fn skip(revision: impl Into<String>) -> Self {
        Self {
            needs_apply: false,
            revision: revision.into(),
        }
    }
}

/// Errors surfaced by source providers.
#[derive(Error, Debug)]
pub enum SourceError {
    #[error("no configured source: none of the source fields are set")]
    NoConfiguredSource,

    #[error("source {0} not found")]
    SourceNotFound(String),

    #[error("version key missing from config map {0}")]
    VersionMissing(String),

    #[error("config map version {found} does not match requested revision {requested}")]
    RevisionMismatch { requested: String, found: String },

    #[error("crd.yaml key missing from config map {0}")]
    ContentMissing(String),

    #[error("upstream returned client error status {status} for {url}")]
    Upstream4xx { status: u16, url: String },

    #[error("upstream returned server error status {status} for {url}")]
    Upstream5xx { status: u16, url: String },

    #[error("failed to parse version {version:?}: {message}")]
    InvalidVersion { version: String, message: String },

    #[error("failed to parse constraint {constraint:?}: {message}")]
    InvalidConstraint { constraint: String, message: String },

    #[error("no version satisfying constraint {0:?} found")]
    NoSatisfyingVersion(String),

    #[error("secret {name} is missing key {key}")]
    SecretKeyMissing { name: String, key: String },

    #[error("asset link {0} not found under release assets")]
    AssetNotFound(String),

    #[error("Kubernetes API error: {0}")]
    Kube(#[from] kube::Error),

    #[error("HTTP request failed: {0}")]
    Http(#[from] reqwest::Error),

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("{0}")]
    Other(String),
}

impl SourceError {
    /// Builds the appropriate upstream error for a non-2xx response status.
    pub fn from_status(status: u16, url: impl Into<String>) -> Self {
        if (400..500).contains(&status) {
            SourceError::Upstream4xx {
                status,
                url: url.into(),
            }
        } else {
            SourceError::Upstream5xx {
                status,
                url: url.into(),
            }
        }
    }
}

/// Contract every source provider implements.
#[async_trait]
pub trait Source: Send + Sync {
    /// Decides whether the source holds a revision that should be applied,
    /// given the Bootstrap's constraint and revision history.
    async fn has_update(&self, bootstrap: &Bootstrap) -> Result<Decision, SourceError>;

    /// Fetches the CRD content for `revision` into `work_dir` and returns
    /// the path of the written manifest file.
    async fn fetch_crd(
        &self,
        work_dir: &Path,
        bootstrap: &Bootstrap,
        revision: &str,
    ) -> Result<PathBuf, SourceError>;
}

/// Chain tail: reached when no source field was populated.
struct NoSource;

#[async_trait]
impl Source for NoSource {
    async fn has_update(&self, _bootstrap: &Bootstrap) -> Result<Decision, SourceError> {
        Err(SourceError::NoConfiguredSource)
    }

    async fn fetch_crd(
        &self,
        _work_dir: &Path,
        _bootstrap: &Bootstrap,
        _revision: &str,
    ) -> Result<PathBuf, SourceError> {
        Err(SourceError::NoConfiguredSource)
    }
}

/// Builds the provider chain. Order is fixed at startup: ConfigMap →
/// GitLab → GitHub → URL → Helm, with a failing tail.
pub fn build_chain(client: kube::Client, http: reqwest::Client) -> Box<dyn Source> {
    let tail: Box<dyn Source> = Box::new(NoSource);
    let helm: Box<dyn Source> = Box::new(helm::HelmProvider::new(
        http.clone(),
        client.clone(),
        Some(tail),
    ));
    let url: Box<dyn Source> =
        Box::new(url::UrlProvider::new(http.clone(), client.clone(), Some(helm)));
    let github: Box<dyn Source> = Box::new(github::GitHubProvider::new(
        http.clone(),
        client.clone(),
        Some(url),
    ));
    let gitlab: Box<dyn Source> = Box::new(gitlab::GitLabProvider::new(
        http,
        client.clone(),
        Some(github),
    ));

    Box::new(configmap::ConfigMapProvider::new(client, Some(gitlab)))
}
