//! Unit tests for the Bootstrap CRD shape and defaults.

use std::time::Duration;

use crd_bootstrap::crd::{Bootstrap, UpdatePolicy};

#[test]
fn deserializes_a_full_object() {
    let raw = r#"
apiVersion: delivery.crd-bootstrap/v1alpha1
kind: Bootstrap
metadata:
  name: bootstrap-sample
  namespace: default
spec:
  interval: 10s
  source:
    configMap:
      name: cm
      namespace: default
  version:
    semver: 1.0.0
  template:
    KrokEvent:
      spec:
        payload: hook
  prune: true
"#;

    let bootstrap: Bootstrap = serde_yaml::from_str(raw).unwrap();
    let source = bootstrap.spec.source.config_map.as_ref().unwrap();
    assert_eq!(source.name, "cm");
    assert_eq!(source.namespace, "default");
    assert_eq!(bootstrap.spec.version.semver.as_deref(), Some("1.0.0"));
    assert!(bootstrap.spec.prune);
    assert!(!bootstrap.spec.continue_on_validation_error);
    assert!(bootstrap.spec.template.as_ref().unwrap().contains_key("KrokEvent"));
    assert_eq!(bootstrap.requeue_after(), Duration::from_secs(10));
}

#[test]
fn source_field_names_match_the_api() {
    let raw = r#"
apiVersion: delivery.crd-bootstrap/v1alpha1
kind: Bootstrap
metadata:
  name: gh
spec:
  source:
    gitHub:
      owner: krok-o
      repo: operator
      manifest: delivery.yaml
  version:
    semver: ">=0.1"
"#;

    let bootstrap: Bootstrap = serde_yaml::from_str(raw).unwrap();
    let github = bootstrap.spec.source.git_hub.as_ref().unwrap();
    assert_eq!(github.owner, "krok-o");
    assert_eq!(github.manifest, "delivery.yaml");
}

#[test]
fn update_policy_parses_lowercase() {
    let raw = r#"
apiVersion: delivery.crd-bootstrap/v1alpha1
kind: Bootstrap
metadata:
  name: safe
spec:
  source:
    url:
      url: https://example.com/crds.yaml
  updatePolicy: safe
"#;

    let bootstrap: Bootstrap = serde_yaml::from_str(raw).unwrap();
    assert_eq!(bootstrap.spec.update_policy, Some(UpdatePolicy::Safe));
}

#[test]
fn interval_defaults_when_missing_or_invalid() {
    let raw = r#"
apiVersion: delivery.crd-bootstrap/v1alpha1
kind: Bootstrap
metadata:
  name: plain
spec:
  source:
    url:
      url: https://example.com/crds.yaml
"#;

    let bootstrap: Bootstrap = serde_yaml::from_str(raw).unwrap();
    assert_eq!(bootstrap.requeue_after(), Duration::from_secs(600));
    assert_eq!(bootstrap.semver_constraint(), "*");
}
