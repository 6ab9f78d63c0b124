use kube::CustomResource;
use schemars::JsonSchema;
use serde::{Deserialize, Serialize};

pub const KIND: &str = "Observability";

/// Desired state of the managed-services observability stack.
///
/// The bootstrapper creates the singleton with every field unset; the
/// reconciler fills in defaults.
#[derive(CustomResource, Serialize, Deserialize, Debug, Clone, Default, JsonSchema, PartialEq)]
#[kube(group = "observability.redhat.com", version = "v1", kind = "Observability", namespaced, status = "ObservabilityStatus")]
pub struct ObservabilitySpec {}

#[derive(Serialize, Deserialize, Debug, Clone, Default, JsonSchema, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct ObservabilityStatus {
    pub observed_generation: Option<i64>,
    pub last_reconcile: Option<String>,
}
