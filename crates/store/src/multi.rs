use std::sync::Arc;

use gantry_core::{ClusterObject, ResourceKey, ResourceKind};
use rustc_hash::FxHashMap;

use crate::typed::TypedStore;

/// Resolves the kind of an object.
pub type KindFn<O> = Arc<dyn Fn(&O) -> ResourceKind + Send + Sync>;

/// Routes objects to the [`TypedStore`] of their kind.
///
/// Every registered kind has an entry; tracked-but-not-persisted kinds map to
/// `None` and all operations on them are no-ops. Any operation on a kind that
/// was never registered panics.
pub struct MultiKindStore<O> {
    stores: FxHashMap<ResourceKind, Option<TypedStore<O>>>,
    extract_kind: KindFn<O>,
}

/// Read-only view handed to graph builders.
pub type ClusterState<O> = MultiKindStore<O>;

impl<O: ClusterObject> MultiKindStore<O> {
    pub fn new(
        extract_kind: KindFn<O>,
        persisted: impl IntoIterator<Item = ResourceKind>,
        tracked: impl IntoIterator<Item = ResourceKind>,
    ) -> Self {
        let mut stores = FxHashMap::default();
        for kind in persisted {
            stores.insert(kind, Some(TypedStore::new()));
        }
        for kind in tracked {
            stores.entry(kind).or_insert(None);
        }
        Self { stores, extract_kind }
    }

    pub fn kind_of(&self, obj: &O) -> ResourceKind {
        (self.extract_kind)(obj)
    }

    fn must_find(&self, kind: &ResourceKind) -> Option<&TypedStore<O>> {
        match self.stores.get(kind) {
            Some(store) => store.as_ref(),
            None => panic!("object store for kind {} not found", kind),
        }
    }

    fn must_find_mut(&mut self, kind: &ResourceKind) -> Option<&mut TypedStore<O>> {
        match self.stores.get_mut(kind) {
            Some(store) => store.as_mut(),
            None => panic!("object store for kind {} not found", kind),
        }
    }

    pub fn is_registered(&self, kind: &ResourceKind) -> bool {
        self.stores.contains_key(kind)
    }

    pub fn is_persisted(&self, kind: &ResourceKind) -> bool {
        self.must_find(kind).is_some()
    }

    pub fn get(&self, kind: &ResourceKind, key: &ResourceKey) -> Option<&O> {
        self.must_find(kind)?.get(key)
    }

    /// Store the object under its kind. Returns the previous object, if any.
    pub fn upsert(&mut self, obj: O) -> Option<O> {
        let kind = self.kind_of(&obj);
        self.must_find_mut(&kind)?.upsert(obj)
    }

    pub fn delete(&mut self, kind: &ResourceKind, key: &ResourceKey) -> Option<O> {
        self.must_find_mut(kind)?.delete(key)
    }

    /// Objects of one kind; empty for tracked-only kinds.
    pub fn objects<'a>(&'a self, kind: &ResourceKind) -> impl Iterator<Item = &'a O> + 'a {
        self.must_find(kind).into_iter().flat_map(|s| s.iter().map(|(_, o)| o))
    }

    pub fn len(&self, kind: &ResourceKind) -> usize {
        self.must_find(kind).map(TypedStore::len).unwrap_or(0)
    }

    pub fn kinds(&self) -> impl Iterator<Item = &ResourceKind> {
        self.stores.keys()
    }
}

#[cfg(test)]
mod tests {
    use gantry_core::dynamic_object_kind;
    use kube::core::{ApiResource, DynamicObject, GroupVersionKind};

    use super::*;

    fn kind(k: &str) -> ResourceKind {
        ResourceKind::parse(k).unwrap()
    }

    fn obj(k: &str, ns: &str, name: &str) -> DynamicObject {
        let ar = ApiResource::from_gvk(&kind(k).to_gvk());
        DynamicObject::new(name, &ar).within(ns)
    }

    fn store() -> MultiKindStore<DynamicObject> {
        MultiKindStore::new(
            Arc::new(dynamic_object_kind),
            [kind("v1/Service")],
            [kind("discovery.k8s.io/v1/EndpointSlice")],
        )
    }

    #[test]
    fn routes_by_kind() {
        let mut s = store();
        s.upsert(obj("v1/Service", "default", "web"));
        let key = ResourceKey::namespaced("default", "web");
        assert!(s.get(&kind("v1/Service"), &key).is_some());
        assert_eq!(s.len(&kind("v1/Service")), 1);
        assert!(s.is_persisted(&kind("v1/Service")));
        assert!(s.delete(&kind("v1/Service"), &key).is_some());
        assert_eq!(s.objects(&kind("v1/Service")).count(), 0);
    }

    #[test]
    fn tracked_only_kinds_are_noops() {
        let mut s = store();
        let slices = kind("discovery.k8s.io/v1/EndpointSlice");
        assert!(!s.is_persisted(&slices));
        assert!(s.upsert(obj("discovery.k8s.io/v1/EndpointSlice", "default", "web-abc")).is_none());
        assert!(s.get(&slices, &ResourceKey::namespaced("default", "web-abc")).is_none());
        assert!(s.delete(&slices, &ResourceKey::namespaced("default", "web-abc")).is_none());
        assert_eq!(s.objects(&slices).count(), 0);
    }

    #[test]
    #[should_panic(expected = "object store for kind v1/Secret not found")]
    fn unregistered_kind_panics() {
        let mut s = store();
        s.upsert(obj("v1/Secret", "default", "tls"));
    }

    #[test]
    fn kind_from_gvk_matches_extractor() {
        let gvk = GroupVersionKind::gvk("", "v1", "Service");
        let o = DynamicObject::new("x", &ApiResource::from_gvk(&gvk));
        assert_eq!(store().kind_of(&o), ResourceKind::from(&gvk));
    }
}
