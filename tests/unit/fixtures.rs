//! Shared fixtures for unit tests.

use k8s_openapi::apiextensions_apiserver::pkg::apis::apiextensions::v1::CustomResourceDefinition;

/// A small but complete CRD with a structural schema that rejects unknown
/// fields under `spec`.
pub const KROK_EVENT_CRD: &str = r#"
apiVersion: apiextensions.k8s.io/v1
kind: CustomResourceDefinition
metadata:
  name: krokevents.delivery.krok.app
spec:
  group: delivery.krok.app
  names:
    kind: KrokEvent
    listKind: KrokEventList
    plural: krokevents
    singular: krokevent
  scope: Namespaced
  versions:
    - name: v1alpha1
      served: true
      storage: true
      schema:
        openAPIV3Schema:
          type: object
          properties:
            spec:
              type: object
              additionalProperties: false
              properties:
                payload:
                  type: string
                retries:
                  type: integer
                  minimum: 0
                  maximum: 10
              required:
                - payload
            status:
              type: object
              x-kubernetes-preserve-unknown-fields: true
"#;

pub fn krok_event_crd() -> CustomResourceDefinition {
    serde_yaml::from_str(KROK_EVENT_CRD).expect("fixture CRD parses")
}
