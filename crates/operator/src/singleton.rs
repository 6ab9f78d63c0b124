//! Singleton `Observability` bootstrap.
//!
//! Exactly one create is issued per process start, before the manager
//! starts. The object is removed again by [`crate::shutdown::supervise`].
use tracing::{info, warn};

use crate::client::{DataClient, ObjectKey};
use crate::crd::{Observability, ObservabilitySpec};
use crate::error::{Error, Result};
use crate::telemetry::record_singleton_op;

pub const SINGLETON_NAME: &str = "managed-services-observability";
pub const SINGLETON_NAMESPACE: &str = "openshift-monitoring";

/// Fixed identity of the singleton object.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SingletonDescriptor {
    pub name: String,
    pub namespace: String,
}

impl Default for SingletonDescriptor {
    fn default() -> Self {
        Self { name: SINGLETON_NAME.into(), namespace: SINGLETON_NAMESPACE.into() }
    }
}

impl SingletonDescriptor {
    /// Builds the object with every spec field left unset.
    pub fn build(&self) -> Observability {
        let mut obj = Observability::new(&self.name, ObservabilitySpec::default());
        obj.metadata.namespace = Some(self.namespace.clone());
        obj
    }

    pub fn key(&self) -> ObjectKey {
        ObjectKey { kind: crate::crd::KIND.into(), name: self.name.clone(), namespace: self.namespace.clone() }
    }
}

/// How [`ensure`] treats an object left behind by an earlier run.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum CreatePolicy {
    /// Any create error, "already exists" included, aborts startup.
    #[default]
    Strict,
    /// "Already exists" is accepted and the existing object adopted.
    AdoptExisting,
}

/// Creates the singleton once. Returns the object the caller now owns and
/// must hand to the termination handler for cleanup.
pub async fn ensure<C: DataClient>(client: &C, descriptor: &SingletonDescriptor, policy: CreatePolicy) -> Result<Observability> {
    let obj = descriptor.build();
    let key = descriptor.key();
    match client.create(&obj).await {
        Ok(created) => {
            record_singleton_op("create", true);
            info!(target: "setup", kind = %key.kind, name = %key.name, namespace = %key.namespace, "created singleton");
            Ok(created)
        }
        Err(e) if policy == CreatePolicy::AdoptExisting && e.is_already_exists() => {
            record_singleton_op("create", true);
            warn!(target: "setup", kind = %key.kind, name = %key.name, namespace = %key.namespace, "singleton already exists, adopting it");
            let existing = client.get::<Observability>(&key.name, &key.namespace).await
                .map_err(|e| Error::Bootstrap { kind: key.kind.clone(), name: key.name.clone(), namespace: key.namespace.clone(), source: Box::new(e) })?;
            Ok(existing.unwrap_or(obj))
        }
        Err(e) => {
            record_singleton_op("create", false);
            Err(Error::Bootstrap { kind: key.kind, name: key.name, namespace: key.namespace, source: Box::new(e) })
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use kube::ResourceExt;

    #[test]
    fn descriptor_builds_fixed_object() {
        let obj = SingletonDescriptor::default().build();
        assert_eq!(obj.name_any(), "managed-services-observability");
        assert_eq!(obj.namespace().as_deref(), Some("openshift-monitoring"));
        assert_eq!(obj.spec, ObservabilitySpec::default());
        assert!(obj.status.is_none());
        let v = serde_json::to_value(&obj).unwrap();
        assert_eq!(v["apiVersion"], "observability.redhat.com/v1");
        assert_eq!(v["kind"], "Observability");
    }
}
