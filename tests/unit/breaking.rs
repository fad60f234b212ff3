//! Unit tests for breaking-change detection between CRD revisions.

use crd_bootstrap::controller::breaking::detect_breaking_changes;
use k8s_openapi::apiextensions_apiserver::pkg::apis::apiextensions::v1::CustomResourceDefinition;

use crate::fixtures::krok_event_crd;

fn crd_from_yaml(raw: &str) -> CustomResourceDefinition {
    serde_yaml::from_str(raw).unwrap()
}

fn mutated(mutate: impl FnOnce(&mut serde_yaml::Value)) -> CustomResourceDefinition {
    let mut value: serde_yaml::Value = serde_yaml::from_str(crate::fixtures::KROK_EVENT_CRD).unwrap();
    mutate(&mut value);
    serde_yaml::from_value(value).unwrap()
}

fn spec_schema<'a>(value: &'a mut serde_yaml::Value) -> &'a mut serde_yaml::Value {
    &mut value["spec"]["versions"][0]["schema"]["openAPIV3Schema"]["properties"]["spec"]
}

#[test]
fn identical_schemas_are_clean() {
    let changes = detect_breaking_changes(&krok_event_crd(), &krok_event_crd());
    assert!(changes.is_empty(), "got: {changes:?}");
}

#[test]
fn type_change_is_breaking() {
    let new = mutated(|value| {
        spec_schema(value)["properties"]["payload"]["type"] = "integer".into();
    });

    let changes = detect_breaking_changes(&krok_event_crd(), &new);
    assert!(
        changes.iter().any(|c| c.contains("type changed")),
        "got: {changes:?}"
    );
}

#[test]
fn newly_required_field_is_breaking() {
    let new = mutated(|value| {
        let required = &mut spec_schema(value)["required"];
        let mut list = required.as_sequence().cloned().unwrap_or_default();
        list.push("retries".into());
        *required = serde_yaml::Value::Sequence(list);
    });

    let changes = detect_breaking_changes(&krok_event_crd(), &new);
    assert!(
        changes.iter().any(|c| c.contains("became required")),
        "got: {changes:?}"
    );
}

#[test]
fn removed_required_property_is_breaking() {
    let new = mutated(|value| {
        let properties = spec_schema(value)["properties"].as_mapping_mut().unwrap();
        properties.remove("payload");
    });

    let changes = detect_breaking_changes(&krok_event_crd(), &new);
    assert!(
        changes.iter().any(|c| c.contains("required property removed")),
        "got: {changes:?}"
    );
}

#[test]
fn tightened_numeric_bounds_are_breaking() {
    let new = mutated(|value| {
        spec_schema(value)["properties"]["retries"]["minimum"] = 1.into();
    });

    let changes = detect_breaking_changes(&krok_event_crd(), &new);
    assert!(
        changes.iter().any(|c| c.contains("minimum raised")),
        "got: {changes:?}"
    );
}

#[test]
fn widened_bounds_are_not_breaking() {
    let new = mutated(|value| {
        spec_schema(value)["properties"]["retries"]["maximum"] = 100.into();
    });

    let changes = detect_breaking_changes(&krok_event_crd(), &new);
    assert!(changes.is_empty(), "got: {changes:?}");
}

#[test]
fn removed_version_is_breaking() {
    let old = mutated(|value| {
        let versions = value["spec"]["versions"].as_sequence_mut().unwrap();
        let mut v1 = versions[0].clone();
        v1["name"] = "v1".into();
        v1["storage"] = false.into();
        versions.push(v1);
    });

    let changes = detect_breaking_changes(&old, &krok_event_crd());
    assert!(
        changes.iter().any(|c| c.contains("removed")),
        "got: {changes:?}"
    );
}

#[test]
fn removed_enum_value_is_breaking() {
    let old = crd_from_yaml(
        r#"
apiVersion: apiextensions.k8s.io/v1
kind: CustomResourceDefinition
metadata:
  name: modes.example.com
spec:
  group: example.com
  names: {kind: Mode, listKind: ModeList, plural: modes, singular: mode}
  scope: Cluster
  versions:
    - name: v1
      served: true
      storage: true
      schema:
        openAPIV3Schema:
          type: object
          properties:
            spec:
              type: object
              properties:
                level:
                  type: string
                  enum: [low, medium, high]
"#,
    );

    let mut new = old.clone();
    let schema = new.spec.versions[0]
        .schema
        .as_mut()
        .unwrap()
        .open_api_v3_schema
        .as_mut()
        .unwrap();
    let level = schema
        .properties
        .as_mut()
        .unwrap()
        .get_mut("spec")
        .unwrap()
        .properties
        .as_mut()
        .unwrap()
        .get_mut("level")
        .unwrap();
    level.enum_.as_mut().unwrap().pop();

    let changes = detect_breaking_changes(&old, &new);
    assert!(
        changes.iter().any(|c| c.contains("enum value")),
        "got: {changes:?}"
    );
}
