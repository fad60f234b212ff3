//! Validates user-supplied template objects against the OpenAPI schemas of
//! incoming CRDs, before anything touches the cluster.

use jsonschema::JSONSchema;
use k8s_openapi::apiextensions_apiserver::pkg::apis::apiextensions::v1::CustomResourceDefinition;
use tracing::debug;

use crate::controller::error::{Error, Result};
use crate::crd::Bootstrap;

/// Runs each `spec.template` entry through the schema of the matching CRD
/// kind, for every version of that CRD which declares a schema.
///
/// Failures across all kinds and versions are aggregated into one error so
/// the status message names every offending kind at once.
pub fn validate_templates(
    bootstrap: &Bootstrap,
    crds: &[CustomResourceDefinition],
) -> Result<()> {
    let Some(templates) = bootstrap.spec.template.as_ref().filter(|t| !t.is_empty()) else {
        return Ok(());
    };

    let mut failures = Vec::new();

    for crd in crds {
        let kind = &crd.spec.names.kind;
        let Some(example) = templates.get(kind) else {
            continue;
        };

        debug!(%kind, "validating template against CRD schema");

        for crd_version in &crd.spec.versions {
            let Some(schema) = crd_version
                .schema
                .as_ref()
                .and_then(|s| s.open_api_v3_schema.as_ref())
            else {
                continue;
            };

            let schema_value = serde_json::to_value(schema)?;
            let compiled = match JSONSchema::compile(&schema_value) {
                Ok(compiled) => compiled,
                Err(e) => {
                    failures.push(format!(
                        "kind {kind} version {}: schema does not compile: {e}",
                        crd_version.name
                    ));
                    continue;
                }
            };

            let validation_result = compiled.validate(example);
            if let Err(errors) = validation_result {
                let messages: Vec<String> = errors.map(|e| e.to_string()).collect();
                failures.push(format!(
                    "failed to validate kind {kind} version {}: {}",
                    crd_version.name,
                    messages.join("; ")
                ));
            }
        }
    }

    if failures.is_empty() {
        return Ok(());
    }

    Err(Error::Validation(failures.join("; ")))
}
