use std::fmt::Debug;

use kube::core::DynamicObject;

use crate::{ResourceKey, ResourceKind};

/// The metadata surface the reconciliation engine needs from a cluster object.
///
/// Objects are replaced wholesale on upsert and never mutated in place, so
/// implementations only need read access.
pub trait ClusterObject: Clone + PartialEq + Debug + Send + Sync + 'static {
    fn key(&self) -> ResourceKey;
    fn generation(&self) -> Option<i64>;
    fn resource_version(&self) -> Option<&str>;
    fn annotation(&self, name: &str) -> Option<&str>;
    fn label(&self, name: &str) -> Option<&str>;
}

impl ClusterObject for DynamicObject {
    fn key(&self) -> ResourceKey {
        ResourceKey {
            namespace: self.metadata.namespace.clone(),
            name: self.metadata.name.clone().unwrap_or_default(),
        }
    }

    fn generation(&self) -> Option<i64> {
        self.metadata.generation
    }

    fn resource_version(&self) -> Option<&str> {
        self.metadata.resource_version.as_deref()
    }

    fn annotation(&self, name: &str) -> Option<&str> {
        self.metadata.annotations.as_ref()?.get(name).map(String::as_str)
    }

    fn label(&self, name: &str) -> Option<&str> {
        self.metadata.labels.as_ref()?.get(name).map(String::as_str)
    }
}

/// Kind extraction for dynamic objects.
///
/// # Panics
///
/// Panics if the object carries no TypeMeta. Producers stamp it before
/// emitting events, so a missing one is a wiring bug.
pub fn dynamic_object_kind(obj: &DynamicObject) -> ResourceKind {
    match &obj.types {
        Some(tm) => ResourceKind::from_api_version(&tm.api_version, &tm.kind),
        None => panic!(
            "object {} has no apiVersion/kind; cannot resolve its resource kind",
            ClusterObject::key(obj)
        ),
    }
}
