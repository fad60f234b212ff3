//! Unit tests for the manifest loader.

use std::fs;

use crd_bootstrap::controller::manifest::load_crds;

use crate::fixtures::KROK_EVENT_CRD;

#[test]
fn loads_single_crd() {
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("crd.yaml");
    fs::write(&path, KROK_EVENT_CRD).unwrap();

    let crds = load_crds(&path).unwrap();
    assert_eq!(crds.len(), 1);
    assert_eq!(
        crds[0].metadata.name.as_deref(),
        Some("krokevents.delivery.krok.app")
    );
    assert_eq!(crds[0].spec.names.kind, "KrokEvent");
}

#[test]
fn drops_non_crd_documents_silently() {
    // A kitchen-sink installer: one CRD among a namespace, a deployment and
    // a service.
    let bundle = format!(
        "{KROK_EVENT_CRD}\n---\napiVersion: v1\nkind: Namespace\nmetadata:\n  name: krok\n---\napiVersion: apps/v1\nkind: Deployment\nmetadata:\n  name: krok-operator\n---\napiVersion: v1\nkind: Service\nmetadata:\n  name: krok\n"
    );

    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("install.yaml");
    fs::write(&path, bundle).unwrap();

    let crds = load_crds(&path).unwrap();
    assert_eq!(crds.len(), 1);
    assert_eq!(crds[0].spec.names.kind, "KrokEvent");
}

#[test]
fn any_invalid_document_fails_the_batch() {
    let bundle = format!("{KROK_EVENT_CRD}\n---\n: not yaml at all {{{{\n");

    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("broken.yaml");
    fs::write(&path, bundle).unwrap();

    assert!(load_crds(&path).is_err());
}

#[test]
fn empty_documents_are_skipped() {
    let bundle = format!("---\n{KROK_EVENT_CRD}\n---\n---\n");

    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("crd.yaml");
    fs::write(&path, bundle).unwrap();

    let crds = load_crds(&path).unwrap();
    assert_eq!(crds.len(), 1);
}

#[test]
fn directories_are_rejected() {
    let dir = tempfile::tempdir().unwrap();
    assert!(load_crds(dir.path()).is_err());
}

#[test]
fn missing_files_are_rejected() {
    let dir = tempfile::tempdir().unwrap();
    assert!(load_crds(&dir.path().join("nope.yaml")).is_err());
}
