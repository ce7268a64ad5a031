use gantry_core::{ClusterObject, ResourceKey};
use rustc_hash::FxHashMap;

/// Last known object of one kind, keyed by namespace/name.
///
/// No locking of its own: callers serialize access.
#[derive(Debug, Clone)]
pub struct TypedStore<O> {
    objects: FxHashMap<ResourceKey, O>,
}

impl<O> Default for TypedStore<O> {
    fn default() -> Self {
        Self { objects: FxHashMap::default() }
    }
}

impl<O: ClusterObject> TypedStore<O> {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn len(&self) -> usize { self.objects.len() }
    pub fn is_empty(&self) -> bool { self.objects.is_empty() }

    pub fn get(&self, key: &ResourceKey) -> Option<&O> {
        self.objects.get(key)
    }

    /// Replace any existing entry for the object's key. Returns the previous object.
    pub fn upsert(&mut self, obj: O) -> Option<O> {
        self.objects.insert(obj.key(), obj)
    }

    /// Remove the entry if present. Returns the removed object.
    pub fn delete(&mut self, key: &ResourceKey) -> Option<O> {
        self.objects.remove(key)
    }

    pub fn iter(&self) -> impl Iterator<Item = (&ResourceKey, &O)> {
        self.objects.iter()
    }
}

#[cfg(test)]
mod tests {
    use kube::core::{ApiResource, DynamicObject, GroupVersionKind};

    use super::*;

    fn svc(ns: &str, name: &str, gen: i64) -> DynamicObject {
        let ar = ApiResource::from_gvk(&GroupVersionKind::gvk("", "v1", "Service"));
        let mut o = DynamicObject::new(name, &ar).within(ns);
        o.metadata.generation = Some(gen);
        o
    }

    #[test]
    fn upsert_replaces_and_delete_is_idempotent() {
        let mut s = TypedStore::new();
        assert!(s.upsert(svc("default", "a", 1)).is_none());
        let prev = s.upsert(svc("default", "a", 2)).unwrap();
        assert_eq!(prev.metadata.generation, Some(1));
        assert_eq!(s.len(), 1);
        assert_eq!(s.get(&ResourceKey::namespaced("default", "a")).unwrap().metadata.generation, Some(2));

        s.upsert(svc("other", "a", 1));
        assert_eq!(s.len(), 2);

        assert!(s.delete(&ResourceKey::namespaced("default", "a")).is_some());
        assert!(s.delete(&ResourceKey::namespaced("default", "a")).is_none());
        assert!(s.get(&ResourceKey::namespaced("default", "a")).is_none());
        assert_eq!(s.iter().count(), 1);
    }
}
