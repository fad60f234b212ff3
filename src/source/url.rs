//! URL source: content is fetched from an absolute URL and versioned by the
//! sha-256 digest of its bytes.

use std::path::{Path, PathBuf};

use async_trait::async_trait;
use kube::Client;
use sha2::{Digest, Sha256};
use tracing::debug;

use crate::crd::{Bootstrap, UrlSource};
use crate::source::{auth, Decision, Source, SourceError};

const MANIFEST_FILE: &str = "crds.yaml";

pub struct UrlProvider {
    http: reqwest::Client,
    client: Client,
    next: Option<Box<dyn Source>>,
}

impl UrlProvider {
    pub fn new(http: reqwest::Client, client: Client, next: Option<Box<dyn Source>>) -> Self {
        Self { http, client, next }
    }

    /// Downloads the content and writes it to `<dir>/crds.yaml`, returning
    /// the written bytes so callers can hash them.
    async fn fetch(
        &self,
        dir: &Path,
        source: &UrlSource,
        namespace: &str,
    ) -> Result<Vec<u8>, SourceError> {
        let http = match &source.secret_ref {
            Some(secret_ref) => auth::token_client(&self.client, namespace, &secret_ref.name).await?,
            None => self.http.clone(),
        };

        let response = http.get(&source.url).send().await?;
        let status = response.status();
        if !status.is_success() {
            return Err(SourceError::from_status(status.as_u16(), &source.url));
        }

        let body = response.bytes().await?;
        tokio::fs::write(dir.join(MANIFEST_FILE), &body).await?;

        Ok(body.to_vec())
    }
}

/// The update decision for digest-versioned content.
///
/// With a pinned digest only matching content is ever applied; anything else
/// is silently skipped so the last applied revision stays put. Without a
/// pin, content is applied whenever its hash differs from the one already
/// applied.
pub fn decide_digest(
    computed: &str,
    pinned: Option<&str>,
    last_applied: Option<&str>,
) -> Decision {
    if let Some(pinned) = pinned.filter(|p| !p.is_empty()) {
        // Re-applying identical content is safe, server-side apply makes it
        // a no-op.
        if pinned == computed {
            return Decision::apply(pinned);
        }

        return Decision::skip("");
    }

    if last_applied == Some(computed) {
        return Decision::skip(computed);
    }

    Decision::apply(computed)
}

#[async_trait]
impl Source for UrlProvider {
    async fn has_update(&self, bootstrap: &Bootstrap) -> Result<Decision, SourceError> {
        let Some(source) = &bootstrap.spec.source.url else {
            return match &self.next {
                Some(next) => next.has_update(bootstrap).await,
                None => Err(SourceError::NoConfiguredSource),
            };
        };

        let namespace = bootstrap.metadata.namespace.as_deref().unwrap_or("default");
        let dir = tempfile::Builder::new().prefix("crd-url").tempdir()?;
        let body = self.fetch(dir.path(), source, namespace).await?;

        let computed = hex::encode(Sha256::digest(&body));
        debug!(digest = %computed, "hashed downloaded content");

        Ok(decide_digest(
            &computed,
            bootstrap.spec.version.digest.as_deref(),
            bootstrap
                .status
                .as_ref()
                .and_then(|s| s.last_applied_revision.as_deref()),
        ))
    }

    async fn fetch_crd(
        &self,
        work_dir: &Path,
        bootstrap: &Bootstrap,
        revision: &str,
    ) -> Result<PathBuf, SourceError> {
        let Some(source) = &bootstrap.spec.source.url else {
            return match &self.next {
                Some(next) => next.fetch_crd(work_dir, bootstrap, revision).await,
                None => Err(SourceError::NoConfiguredSource),
            };
        };

        let namespace = bootstrap.metadata.namespace.as_deref().unwrap_or("default");
        self.fetch(work_dir, source, namespace).await?;

        Ok(work_dir.join(MANIFEST_FILE))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn pinned_digest_match_applies() {
        let decision = decide_digest("aaaa", Some("aaaa"), None);
        assert_eq!(decision, Decision::apply("aaaa"));
    }

    #[test]
    fn pinned_digest_mismatch_skips_silently() {
        let decision = decide_digest("aaaa", Some("bbbb"), Some("cccc"));
        assert!(!decision.needs_apply);
        assert!(decision.revision.is_empty());
    }

    #[test]
    fn rolling_digest_applies_on_change_only() {
        assert_eq!(decide_digest("h1", None, None), Decision::apply("h1"));
        assert_eq!(decide_digest("h1", None, Some("h1")), Decision::skip("h1"));
        assert_eq!(
            decide_digest("h2", None, Some("h1")),
            Decision::apply("h2")
        );
    }
}
