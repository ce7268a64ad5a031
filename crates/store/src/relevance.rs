//! Per-kind rules deciding whether an upsert or delete must propagate.

use std::sync::Arc;

use gantry_core::{ClusterObject, ResourceKey};

/// Decides whether a change to an object of one kind is relevant.
///
/// Rules run on every event before any graph rebuild, so they must be cheap.
pub trait RelevanceRule<O>: Send + Sync {
    /// `old` is the previously stored object (always `None` for kinds that are
    /// not persisted).
    fn upsert_relevant(&self, old: Option<&O>, new: &O) -> bool;

    /// `last_known` is the object removed from the store for persisted kinds.
    fn delete_relevant(&self, key: &ResourceKey, last_known: Option<&O>) -> bool;

    /// Short policy name for diagnostics.
    fn policy(&self) -> &'static str {
        "custom"
    }
}

/// Every upsert and delete matters.
#[derive(Debug, Clone, Copy, Default)]
pub struct AlwaysRelevant;

impl<O> RelevanceRule<O> for AlwaysRelevant {
    fn upsert_relevant(&self, _old: Option<&O>, _new: &O) -> bool {
        true
    }

    fn delete_relevant(&self, _key: &ResourceKey, _last_known: Option<&O>) -> bool {
        true
    }

    fn policy(&self) -> &'static str {
        "always"
    }
}

/// How two versions of an object are compared by [`Unchanged`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Equality {
    /// `metadata.generation` (bumped by the API server on spec changes only).
    Generation,
    /// `metadata.resourceVersion` (bumped on any write, status included).
    ResourceVersion,
    /// Full object equality.
    Content,
}

/// Filters out upserts whose content is unchanged from the stored version.
/// Deletes are always relevant.
#[derive(Debug, Clone, Copy)]
pub struct Unchanged {
    equality: Equality,
}

impl Unchanged {
    pub fn new(equality: Equality) -> Self {
        Self { equality }
    }

    pub fn generation() -> Self {
        Self::new(Equality::Generation)
    }

    pub fn resource_version() -> Self {
        Self::new(Equality::ResourceVersion)
    }

    pub fn content() -> Self {
        Self::new(Equality::Content)
    }
}

impl<O: ClusterObject> RelevanceRule<O> for Unchanged {
    fn upsert_relevant(&self, old: Option<&O>, new: &O) -> bool {
        let Some(old) = old else { return true };
        match self.equality {
            Equality::Generation => old.generation() != new.generation(),
            Equality::ResourceVersion => old.resource_version() != new.resource_version(),
            Equality::Content => old != new,
        }
    }

    fn delete_relevant(&self, _key: &ResourceKey, _last_known: Option<&O>) -> bool {
        true
    }

    fn policy(&self) -> &'static str {
        match self.equality {
            Equality::Generation => "generation",
            Equality::ResourceVersion => "resource-version",
            Equality::Content => "content",
        }
    }
}

/// Answers whether the current downstream graph references an object.
///
/// On upsert the new object is passed; on delete the last known object is
/// passed when the kind is persisted, otherwise only the key is available.
pub type ReferenceCheck<O> = Arc<dyn Fn(&ResourceKey, Option<&O>) -> bool + Send + Sync>;

/// Relevance gated by an injected reference check.
pub struct FuncPredicate<O> {
    is_referenced: ReferenceCheck<O>,
}

impl<O> FuncPredicate<O> {
    pub fn new(is_referenced: ReferenceCheck<O>) -> Self {
        Self { is_referenced }
    }
}

impl<O: ClusterObject> RelevanceRule<O> for FuncPredicate<O> {
    fn upsert_relevant(&self, _old: Option<&O>, new: &O) -> bool {
        (self.is_referenced)(&new.key(), Some(new))
    }

    fn delete_relevant(&self, key: &ResourceKey, last_known: Option<&O>) -> bool {
        (self.is_referenced)(key, last_known)
    }

    fn policy(&self) -> &'static str {
        "referenced"
    }
}

/// Relevant on upsert iff the named annotation's value changed. An absent
/// annotation differs from every present value. Deletes are always relevant.
#[derive(Debug, Clone)]
pub struct AnnotationChanged {
    annotation: String,
}

impl AnnotationChanged {
    pub fn new(annotation: impl Into<String>) -> Self {
        Self { annotation: annotation.into() }
    }
}

impl<O: ClusterObject> RelevanceRule<O> for AnnotationChanged {
    fn upsert_relevant(&self, old: Option<&O>, new: &O) -> bool {
        let Some(old) = old else { return true };
        old.annotation(&self.annotation) != new.annotation(&self.annotation)
    }

    fn delete_relevant(&self, _key: &ResourceKey, _last_known: Option<&O>) -> bool {
        true
    }

    fn policy(&self) -> &'static str {
        "annotation"
    }
}

#[cfg(test)]
mod tests {
    use std::collections::BTreeMap;
    use std::sync::atomic::{AtomicBool, Ordering};

    use kube::core::{ApiResource, DynamicObject, GroupVersionKind};

    use super::*;

    fn route(gen: i64, rv: &str) -> DynamicObject {
        let ar = ApiResource::from_gvk(&GroupVersionKind::gvk("gateway.networking.k8s.io", "v1", "HTTPRoute"));
        let mut o = DynamicObject::new("r", &ar).within("default");
        o.metadata.generation = Some(gen);
        o.metadata.resource_version = Some(rv.to_string());
        o
    }

    fn annotated(value: Option<&str>) -> DynamicObject {
        let mut o = route(1, "1");
        o.metadata.annotations =
            value.map(|v| BTreeMap::from([("gateway.networking.k8s.io/bundle-version".to_string(), v.to_string())]));
        o
    }

    #[test]
    fn always_relevant() {
        let o = route(1, "1");
        assert!(AlwaysRelevant.upsert_relevant(Some(&o), &o));
        assert!(RelevanceRule::<DynamicObject>::delete_relevant(&AlwaysRelevant, &o_key(), None));
    }

    fn o_key() -> ResourceKey {
        ResourceKey::namespaced("default", "r")
    }

    #[test]
    fn unchanged_by_generation_ignores_status_writes() {
        let rule = Unchanged::generation();
        assert!(rule.upsert_relevant(None, &route(1, "1")));
        assert!(!rule.upsert_relevant(Some(&route(1, "1")), &route(1, "2")));
        assert!(rule.upsert_relevant(Some(&route(1, "2")), &route(2, "3")));
        assert!(RelevanceRule::<DynamicObject>::delete_relevant(&rule, &o_key(), None));
    }

    #[test]
    fn unchanged_by_resource_version_and_content() {
        let rv = Unchanged::resource_version();
        assert!(!rv.upsert_relevant(Some(&route(1, "5")), &route(2, "5")));
        assert!(rv.upsert_relevant(Some(&route(1, "5")), &route(1, "6")));

        let content = Unchanged::content();
        assert!(!content.upsert_relevant(Some(&route(1, "5")), &route(1, "5")));
        let mut changed = route(1, "5");
        changed.data = serde_json::json!({"spec": {"hostnames": ["a.example.com"]}});
        assert!(content.upsert_relevant(Some(&route(1, "5")), &changed));
    }

    #[test]
    fn func_predicate_consults_the_check() {
        let referenced = Arc::new(AtomicBool::new(false));
        let flag = Arc::clone(&referenced);
        let rule: FuncPredicate<DynamicObject> =
            FuncPredicate::new(Arc::new(move |_key: &ResourceKey, _obj: Option<&DynamicObject>| {
                flag.load(Ordering::SeqCst)
            }));
        assert!(!rule.upsert_relevant(None, &route(1, "1")));
        assert!(!rule.delete_relevant(&o_key(), None));
        referenced.store(true, Ordering::SeqCst);
        assert!(rule.upsert_relevant(Some(&route(1, "1")), &route(1, "1")));
        assert!(rule.delete_relevant(&o_key(), None));
    }

    #[test]
    fn func_predicate_receives_key_and_object() {
        let rule: FuncPredicate<DynamicObject> = FuncPredicate::new(Arc::new(|key: &ResourceKey, obj: Option<&DynamicObject>| {
            key.name == "r" && obj.map(|o| o.metadata.generation == Some(7)).unwrap_or(true)
        }));
        assert!(rule.upsert_relevant(None, &route(7, "1")));
        assert!(!rule.upsert_relevant(None, &route(6, "1")));
        assert!(rule.delete_relevant(&o_key(), None));
        assert!(!rule.delete_relevant(&ResourceKey::namespaced("default", "other"), None));
    }

    #[test]
    fn annotation_changed() {
        let rule = AnnotationChanged::new("gateway.networking.k8s.io/bundle-version");
        assert!(rule.upsert_relevant(None, &annotated(Some("v1.1.0"))));
        assert!(!rule.upsert_relevant(Some(&annotated(Some("v1.1.0"))), &annotated(Some("v1.1.0"))));
        assert!(rule.upsert_relevant(Some(&annotated(Some("v1.1.0"))), &annotated(Some("v1.2.0"))));
        assert!(rule.upsert_relevant(Some(&annotated(None)), &annotated(Some(""))));
        assert!(rule.upsert_relevant(Some(&annotated(Some("v1.1.0"))), &annotated(None)));
        assert!(!rule.upsert_relevant(Some(&annotated(None)), &annotated(None)));
        assert!(RelevanceRule::<DynamicObject>::delete_relevant(&rule, &o_key(), None));
    }
}
