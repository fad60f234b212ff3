//! Unit tests for template validation against CRD schemas.

use std::collections::BTreeMap;

use crd_bootstrap::controller::validation::validate_templates;
use crd_bootstrap::crd::{Bootstrap, BootstrapSpec, Source, VersionSpec};
use serde_json::json;

use crate::fixtures::krok_event_crd;

fn bootstrap_with_template(template: Option<BTreeMap<String, serde_json::Value>>) -> Bootstrap {
    Bootstrap::new(
        "bootstrap-sample",
        BootstrapSpec {
            interval: Some("10s".to_string()),
            source: Source::default(),
            version: VersionSpec {
                semver: Some("1.0.0".to_string()),
                digest: None,
            },
            template,
            continue_on_validation_error: false,
            prune: false,
            update_policy: None,
            kube_config: None,
            webhook: None,
        },
    )
}

#[test]
fn no_template_passes() {
    let bootstrap = bootstrap_with_template(None);
    assert!(validate_templates(&bootstrap, &[krok_event_crd()]).is_ok());
}

#[test]
fn valid_template_passes() {
    let mut template = BTreeMap::new();
    template.insert(
        "KrokEvent".to_string(),
        json!({"spec": {"payload": "hook", "retries": 3}}),
    );

    let bootstrap = bootstrap_with_template(Some(template));
    assert!(validate_templates(&bootstrap, &[krok_event_crd()]).is_ok());
}

#[test]
fn unknown_field_fails_and_names_the_kind() {
    let mut template = BTreeMap::new();
    template.insert(
        "KrokEvent".to_string(),
        json!({"spec": {"payload": "hook", "unknownField": "x"}}),
    );

    let bootstrap = bootstrap_with_template(Some(template));
    let err = validate_templates(&bootstrap, &[krok_event_crd()]).unwrap_err();
    assert!(err.to_string().contains("KrokEvent"), "got: {err}");
}

#[test]
fn missing_required_field_fails() {
    let mut template = BTreeMap::new();
    template.insert("KrokEvent".to_string(), json!({"spec": {"retries": 1}}));

    let bootstrap = bootstrap_with_template(Some(template));
    assert!(validate_templates(&bootstrap, &[krok_event_crd()]).is_err());
}

#[test]
fn out_of_bounds_value_fails() {
    let mut template = BTreeMap::new();
    template.insert(
        "KrokEvent".to_string(),
        json!({"spec": {"payload": "hook", "retries": 99}}),
    );

    let bootstrap = bootstrap_with_template(Some(template));
    assert!(validate_templates(&bootstrap, &[krok_event_crd()]).is_err());
}

#[test]
fn templates_for_other_kinds_are_ignored() {
    let mut template = BTreeMap::new();
    template.insert("SomethingElse".to_string(), json!({"spec": {"bogus": 1}}));

    let bootstrap = bootstrap_with_template(Some(template));
    assert!(validate_templates(&bootstrap, &[krok_event_crd()]).is_ok());
}
