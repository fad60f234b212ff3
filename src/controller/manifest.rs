//! Loads CRD manifests fetched by a source provider.

use std::path::Path;

use k8s_openapi::apiextensions_apiserver::pkg::apis::apiextensions::v1::CustomResourceDefinition;
use serde::Deserialize;

use crate::controller::error::{Error, Result};

/// Reads a manifest file into the CRD objects it contains.
///
/// The file may hold multiple `---`-separated YAML documents. Documents of
/// any other kind are dropped silently, which allows pointing a Bootstrap at
/// kitchen-sink installers without failing. A parse error in any document
/// fails the whole batch.
pub fn load_crds(path: &Path) -> Result<Vec<CustomResourceDefinition>> {
    let meta = std::fs::symlink_metadata(path)
        .map_err(|e| Error::ReadObjects(format!("failed to stat {}: {e}", path.display())))?;
    if !meta.is_file() {
        return Err(Error::ReadObjects(format!(
            "expected {:?} to be a file",
            path.display()
        )));
    }

    let content = std::fs::read_to_string(path)
        .map_err(|e| Error::ReadObjects(format!("failed to read {}: {e}", path.display())))?;

    let mut crds = Vec::new();
    for document in serde_yaml::Deserializer::from_str(&content) {
        let value = serde_yaml::Value::deserialize(document)
            .map_err(|e| Error::ReadObjects(format!("invalid YAML document: {e}")))?;

        if value.is_null() {
            continue;
        }

        let kind = value.get("kind").and_then(|k| k.as_str());
        if kind != Some("CustomResourceDefinition") {
            continue;
        }

        let crd: CustomResourceDefinition = serde_yaml::from_value(value)
            .map_err(|e| Error::ReadObjects(format!("invalid CustomResourceDefinition: {e}")))?;
        crds.push(crd);
    }

    Ok(crds)
}
