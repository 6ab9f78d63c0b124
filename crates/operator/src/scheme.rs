//! Explicit type registry.
//!
//! A [`Scheme`] records which kinds the operator understands. It is built
//! once in `main`, wrapped in an `Arc` and handed to the manager, after which
//! nothing can add to it.
use std::collections::BTreeMap;
use std::fmt;

use k8s_openapi::api::coordination::v1::Lease;
use k8s_openapi::api::core::v1::{Event, Namespace};
use kube::Resource;

use crate::crd::Observability;
use crate::error::{Error, Result};

#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct GroupVersionKind {
    pub group: String,
    pub version: String,
    pub kind: String,
}

impl GroupVersionKind {
    pub fn of<K: Resource<DynamicType = ()>>() -> Self {
        Self { group: K::group(&()).into_owned(), version: K::version(&()).into_owned(), kind: K::kind(&()).into_owned() }
    }

    pub fn api_version(&self) -> String {
        if self.group.is_empty() { self.version.clone() } else { format!("{}/{}", self.group, self.version) }
    }
}

impl fmt::Display for GroupVersionKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result { write!(f, "{}, Kind={}", self.api_version(), self.kind) }
}

/// What the registry knows about a kind beyond its identity.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ResourceDescriptor {
    pub plural: String,
    pub namespaced: bool,
}

/// A self-describing set of kinds that can be added to a scheme in one call.
pub struct TypeGroup {
    name: &'static str,
    entries: Vec<(GroupVersionKind, ResourceDescriptor)>,
}

impl TypeGroup {
    pub fn new(name: &'static str) -> Self { Self { name, entries: Vec::new() } }

    pub fn with<K: Resource<DynamicType = ()>>(mut self, namespaced: bool) -> Self {
        let descriptor = ResourceDescriptor { plural: K::plural(&()).into_owned(), namespaced };
        self.entries.push((GroupVersionKind::of::<K>(), descriptor));
        self
    }
}

/// Core platform kinds the manager itself touches.
pub fn core_group() -> TypeGroup {
    TypeGroup::new("core")
        .with::<Namespace>(false)
        .with::<Event>(true)
        .with::<Lease>(true)
}

/// Kinds served by this operator.
pub fn observability_group() -> TypeGroup {
    TypeGroup::new("observability.redhat.com/v1").with::<Observability>(true)
}

#[derive(Debug, Default)]
pub struct Scheme {
    kinds: BTreeMap<GroupVersionKind, ResourceDescriptor>,
}

impl Scheme {
    pub fn new() -> Self { Self::default() }

    /// Scheme with both groups this binary needs.
    pub fn with_defaults() -> Result<Self> {
        let mut scheme = Self::new();
        scheme.add_to_scheme(core_group())?;
        scheme.add_to_scheme(observability_group())?;
        Ok(scheme)
    }

    pub fn register<K: Resource<DynamicType = ()>>(&mut self, namespaced: bool) -> Result<()> {
        let descriptor = ResourceDescriptor { plural: K::plural(&()).into_owned(), namespaced };
        self.insert(GroupVersionKind::of::<K>(), descriptor)
    }

    /// Adds every kind of `group`. Stops at the first duplicate; kinds added
    /// before the duplicate stay registered.
    pub fn add_to_scheme(&mut self, group: TypeGroup) -> Result<()> {
        let name = group.name;
        for (gvk, descriptor) in group.entries {
            self.insert(gvk, descriptor).map_err(|e| Error::Scheme(format!("adding group {name}: {e}")))?;
        }
        tracing::debug!(target: "setup", group = name, kinds = self.kinds.len(), "scheme.group_added");
        Ok(())
    }

    fn insert(&mut self, gvk: GroupVersionKind, descriptor: ResourceDescriptor) -> Result<()> {
        if self.kinds.contains_key(&gvk) {
            return Err(Error::Scheme(format!("kind {gvk} registered twice")));
        }
        self.kinds.insert(gvk, descriptor);
        Ok(())
    }

    pub fn is_registered<K: Resource<DynamicType = ()>>(&self) -> bool {
        self.kinds.contains_key(&GroupVersionKind::of::<K>())
    }

    pub fn descriptor(&self, gvk: &GroupVersionKind) -> Option<&ResourceDescriptor> { self.kinds.get(gvk) }

    /// Fails with [`Error::UnregisteredKind`] when `K` is unknown.
    pub fn require<K: Resource<DynamicType = ()>>(&self) -> Result<()> {
        if self.is_registered::<K>() { Ok(()) } else { Err(Error::UnregisteredKind(GroupVersionKind::of::<K>().to_string())) }
    }

    pub fn is_empty(&self) -> bool { self.kinds.is_empty() }

    pub fn len(&self) -> usize { self.kinds.len() }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_cover_core_and_observability() {
        let scheme = Scheme::with_defaults().unwrap();
        assert!(scheme.is_registered::<Observability>());
        assert!(scheme.is_registered::<Lease>());
        assert_eq!(scheme.len(), 4);
        let gvk = GroupVersionKind::of::<Observability>();
        assert_eq!(gvk.api_version(), "observability.redhat.com/v1");
        assert_eq!(scheme.descriptor(&gvk).unwrap().plural, "observabilities");
    }

    #[test]
    fn duplicate_kind_is_rejected() {
        let mut scheme = Scheme::new();
        scheme.register::<Observability>(true).unwrap();
        let err = scheme.add_to_scheme(observability_group()).unwrap_err();
        assert!(err.to_string().contains("registered twice"), "{err}");
    }

    #[test]
    fn require_reports_missing_kind() {
        let scheme = Scheme::new();
        let err = scheme.require::<Observability>().unwrap_err();
        assert!(matches!(err, Error::UnregisteredKind(k) if k.contains("Kind=Observability")));
    }

    #[test]
    fn core_kinds_use_empty_group() {
        assert_eq!(GroupVersionKind::of::<Namespace>().api_version(), "v1");
        assert_eq!(GroupVersionKind::of::<Lease>().api_version(), "coordination.k8s.io/v1");
    }
}
