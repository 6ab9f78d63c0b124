use kube::CustomResourceExt;
use observability_operator::{Observability, ObservabilitySpec, ObservabilityStatus};
use serde_json::json;

#[test]
fn empty_spec_serializes_to_empty_object() {
    let j = serde_json::to_value(ObservabilitySpec::default()).unwrap();
    assert_eq!(j, json!({}));
}

#[test]
fn status_uses_camel_case() {
    let status = ObservabilityStatus { observed_generation: Some(2), last_reconcile: Some("2024-01-01T00:00:00Z".into()) };
    let j = serde_json::to_value(&status).unwrap();
    assert_eq!(j, json!({"observedGeneration": 2, "lastReconcile": "2024-01-01T00:00:00Z"}));
}

#[test]
fn crd_is_namespaced_with_status_subresource() {
    let crd = Observability::crd();
    assert_eq!(crd.spec.group, "observability.redhat.com");
    assert_eq!(crd.spec.scope, "Namespaced");
    assert_eq!(crd.spec.names.kind, "Observability");
    let version = &crd.spec.versions[0];
    assert_eq!(version.name, "v1");
    assert!(version.subresources.as_ref().and_then(|s| s.status.as_ref()).is_some());
}
