//! ConfigMap source: the CRD content lives under `crd.yaml` in a config map
//! and its version under `version`.

use std::path::{Path, PathBuf};

use async_trait::async_trait;
use k8s_openapi::api::core::v1::ConfigMap;
use kube::{Api, Client};
use tracing::debug;

use crate::crd::Bootstrap;
use crate::source::{version, Decision, Source, SourceError};

const VERSION_KEY: &str = "version";
const CONTENT_KEY: &str = "crd.yaml";

pub struct ConfigMapProvider {
    client: Client,
    next: Option<Box<dyn Source>>,
}

impl ConfigMapProvider {
    pub fn new(client: Client, next: Option<Box<dyn Source>>) -> Self {
        Self { client, next }
    }

    async fn get_config_map(&self, name: &str, namespace: &str) -> Result<ConfigMap, SourceError> {
        let api: Api<ConfigMap> = Api::namespaced(self.client.clone(), namespace);
        match api.get(name).await {
            Ok(cm) => Ok(cm),
            Err(kube::Error::Api(e)) if e.code == 404 => Err(SourceError::SourceNotFound(
                format!("{namespace}/{name}"),
            )),
            Err(e) => Err(e.into()),
        }
    }
}

#[async_trait]
impl Source for ConfigMapProvider {
    async fn has_update(&self, bootstrap: &Bootstrap) -> Result<Decision, SourceError> {
        let Some(source) = &bootstrap.spec.source.config_map else {
            return match &self.next {
                Some(next) => next.has_update(bootstrap).await,
                None => Err(SourceError::NoConfiguredSource),
            };
        };

        let cm = self.get_config_map(&source.name, &source.namespace).await?;
        let candidate = cm
            .data
            .as_ref()
            .and_then(|data| data.get(VERSION_KEY))
            .ok_or_else(|| SourceError::VersionMissing(source.name.clone()))?;

        debug!(version = %candidate, "config map offers version");

        version::decide(
            candidate,
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
        let Some(source) = &bootstrap.spec.source.config_map else {
            return match &self.next {
                Some(next) => next.fetch_crd(work_dir, bootstrap, revision).await,
                None => Err(SourceError::NoConfiguredSource),
            };
        };

        let cm = self.get_config_map(&source.name, &source.namespace).await?;
        let data = cm.data.unwrap_or_default();

        // The map may have moved on since the update probe; refuse to serve
        // content that no longer matches the decided revision.
        let found = data
            .get(VERSION_KEY)
            .ok_or_else(|| SourceError::VersionMissing(source.name.clone()))?;
        if found != revision {
            return Err(SourceError::RevisionMismatch {
                requested: revision.to_string(),
                found: found.clone(),
            });
        }

        let content = data
            .get(CONTENT_KEY)
            .ok_or_else(|| SourceError::ContentMissing(source.name.clone()))?;

        let path = work_dir.join(CONTENT_KEY);
        tokio::fs::write(&path, content).await?;

        Ok(path)
    }
}
