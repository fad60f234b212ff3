//! Detects schema changes that would reject previously-valid stored
//! instances of a CRD.

use std::collections::BTreeMap;

use k8s_openapi::apiextensions_apiserver::pkg::apis::apiextensions::v1::{
    CustomResourceDefinition, JSONSchemaProps,
};

/// Compares the schemas of an installed CRD against an incoming one and
/// returns a description of every breaking change found.
///
/// Breaking means previously-valid stored instances could be rejected:
/// removed served versions, changed types, newly-required fields, removed
/// required properties, removed enum values and tightened numeric or length
/// bounds.
pub fn detect_breaking_changes(
    old_crd: &CustomResourceDefinition,
    new_crd: &CustomResourceDefinition,
) -> Vec<String> {
    let mut breaking = Vec::new();

    let new_versions: BTreeMap<&str, &JSONSchemaProps> = new_crd
        .spec
        .versions
        .iter()
        .filter_map(|v| {
            v.schema
                .as_ref()
                .and_then(|s| s.open_api_v3_schema.as_ref())
                .map(|schema| (v.name.as_str(), schema))
        })
        .collect();

    for old_version in &old_crd.spec.versions {
        let Some(old_schema) = old_version
            .schema
            .as_ref()
            .and_then(|s| s.open_api_v3_schema.as_ref())
        else {
            continue;
        };

        let Some(new_schema) = new_versions.get(old_version.name.as_str()) else {
            breaking.push(format!("version {:?} removed", old_version.name));
            continue;
        };

        let mut changes = Vec::new();
        compare_schemas(old_schema, new_schema, "", &mut changes);

        for change in changes {
            breaking.push(format!("version {}: {}", old_version.name, change));
        }
    }

    breaking
}

fn compare_schemas(
    old: &JSONSchemaProps,
    new: &JSONSchemaProps,
    path: &str,
    changes: &mut Vec<String>,
) {
    if let (Some(old_type), Some(new_type)) = (&old.type_, &new.type_) {
        if old_type != new_type {
            changes.push(format!(
                "{}: type changed from {old_type:?} to {new_type:?}",
                display_path(path)
            ));
            // A different type makes the remaining keyword comparisons
            // meaningless.
            return;
        }
    }

    compare_required(old, new, path, changes);
    compare_enums(old, new, path, changes);
    compare_bounds(old, new, path, changes);

    // Recurse into properties both sides know about; flag the ones that
    // vanished while being required.
    let empty = BTreeMap::new();
    let old_props = old.properties.as_ref().unwrap_or(&empty);
    let new_props = new.properties.as_ref().unwrap_or(&empty);
    let old_required = old.required.clone().unwrap_or_default();

    for (name, old_prop) in old_props {
        let child_path = join_path(path, name);
        match new_props.get(name) {
            Some(new_prop) => compare_schemas(old_prop, new_prop, &child_path, changes),
            None => {
                if old_required.iter().any(|r| r == name) {
                    changes.push(format!(
                        "{}: required property removed",
                        display_path(&child_path)
                    ));
                }
            }
        }
    }

    if let (Some(old_items), Some(new_items)) = (&old.items, &new.items) {
        use k8s_openapi::apiextensions_apiserver::pkg::apis::apiextensions::v1::JSONSchemaPropsOrArray;
        if let (
            JSONSchemaPropsOrArray::Schema(old_item),
            JSONSchemaPropsOrArray::Schema(new_item),
        ) = (old_items, new_items)
        {
            compare_schemas(old_item, new_item, &join_path(path, "[]"), changes);
        }
    }
}

fn compare_required(
    old: &JSONSchemaProps,
    new: &JSONSchemaProps,
    path: &str,
    changes: &mut Vec<String>,
) {
    let old_required = old.required.clone().unwrap_or_default();
    let new_required = new.required.clone().unwrap_or_default();

    for name in &new_required {
        if !old_required.contains(name) {
            changes.push(format!(
                "{}: field {name:?} became required",
                display_path(path)
            ));
        }
    }
}

fn compare_enums(
    old: &JSONSchemaProps,
    new: &JSONSchemaProps,
    path: &str,
    changes: &mut Vec<String>,
) {
    let (Some(old_enum), Some(new_enum)) = (&old.enum_, &new.enum_) else {
        return;
    };

    for value in old_enum {
        if !new_enum.contains(value) {
            changes.push(format!(
                "{}: enum value {} removed",
                display_path(path),
                serde_json::to_string(&value.0).unwrap_or_default()
            ));
        }
    }
}

fn compare_bounds(
    old: &JSONSchemaProps,
    new: &JSONSchemaProps,
    path: &str,
    changes: &mut Vec<String>,
) {
    let raised = |old: Option<f64>, new: Option<f64>| match (old, new) {
        (Some(o), Some(n)) => n > o,
        (None, Some(_)) => true,
        _ => false,
    };
    let lowered = |old: Option<f64>, new: Option<f64>| match (old, new) {
        (Some(o), Some(n)) => n < o,
        (None, Some(_)) => true,
        _ => false,
    };

    if raised(old.minimum, new.minimum) {
        changes.push(format!("{}: minimum raised", display_path(path)));
    }
    if lowered(old.maximum, new.maximum) {
        changes.push(format!("{}: maximum lowered", display_path(path)));
    }

    let raised_len = |old: Option<i64>, new: Option<i64>| match (old, new) {
        (Some(o), Some(n)) => n > o,
        (None, Some(_)) => true,
        _ => false,
    };
    let lowered_len = |old: Option<i64>, new: Option<i64>| match (old, new) {
        (Some(o), Some(n)) => n < o,
        (None, Some(_)) => true,
        _ => false,
    };

    if raised_len(old.min_length, new.min_length) {
        changes.push(format!("{}: minLength raised", display_path(path)));
    }
    if lowered_len(old.max_length, new.max_length) {
        changes.push(format!("{}: maxLength lowered", display_path(path)));
    }
    if raised_len(old.min_items, new.min_items) {
        changes.push(format!("{}: minItems raised", display_path(path)));
    }
    if lowered_len(old.max_items, new.max_items) {
        changes.push(format!("{}: maxItems lowered", display_path(path)));
    }
}

fn join_path(path: &str, name: &str) -> String {
    if path.is_empty() {
        name.to_string()
    } else {
        format!("{path}.{name}")
    }
}

fn display_path(path: &str) -> &str {
    if path.is_empty() {
        "(root)"
    } else {
        path
    }
}
