use gantry_core::{ChangeSeverity, ClusterObject, ResourceKey, ResourceKind};
use rustc_hash::FxHashMap;

use crate::multi::{ClusterState, KindFn, MultiKindStore};
use crate::registry::KindRegistry;
use crate::relevance::RelevanceRule;

/// Applies upserts and deletes to the cluster state and accumulates the most
/// severe relevant change since the last [`take_and_reset_severity`].
///
/// Works only with kinds present in the [`KindRegistry`]; anything else panics.
///
/// [`take_and_reset_severity`]: ChangeTracker::take_and_reset_severity
pub struct ChangeTracker<O> {
    store: MultiKindStore<O>,
    rules: FxHashMap<ResourceKind, Box<dyn RelevanceRule<O>>>,
    endpoints_kind: Option<ResourceKind>,
    severity: ChangeSeverity,
}

impl<O: ClusterObject> ChangeTracker<O> {
    pub fn new(registry: KindRegistry<O>, extract_kind: KindFn<O>) -> Self {
        let mut persisted = Vec::new();
        let mut tracked = Vec::new();
        let mut rules = FxHashMap::default();
        for entry in registry.entries {
            if entry.persisted {
                persisted.push(entry.kind.clone());
            } else {
                tracked.push(entry.kind.clone());
            }
            rules.insert(entry.kind, entry.rule);
        }
        Self {
            store: MultiKindStore::new(extract_kind, persisted, tracked),
            rules,
            endpoints_kind: registry.endpoints_kind,
            severity: ChangeSeverity::NoChange,
        }
    }

    pub fn state(&self) -> &ClusterState<O> {
        &self.store
    }

    pub fn kind_of(&self, obj: &O) -> ResourceKind {
        self.store.kind_of(obj)
    }

    /// Panics if the kind is not registered.
    pub fn assert_supported(&self, kind: &ResourceKind) {
        if !self.rules.contains_key(kind) {
            panic!("unsupported kind {}", kind);
        }
    }

    fn severity_for(&self, kind: &ResourceKind) -> ChangeSeverity {
        if self.endpoints_kind.as_ref() == Some(kind) {
            ChangeSeverity::EndpointsOnlyChange
        } else {
            ChangeSeverity::ClusterStateChange
        }
    }

    pub fn upsert(&mut self, obj: O) {
        let kind = self.kind_of(&obj);
        let Some(rule) = self.rules.get(&kind) else {
            panic!("unsupported kind {}", kind);
        };
        let relevant = if self.store.is_persisted(&kind) {
            let relevant = rule.upsert_relevant(self.store.get(&kind, &obj.key()), &obj);
            self.store.upsert(obj);
            relevant
        } else {
            rule.upsert_relevant(None, &obj)
        };
        if relevant {
            let severity = self.severity_for(&kind);
            self.severity.raise(severity);
        }
    }

    pub fn delete(&mut self, kind: &ResourceKind, key: &ResourceKey) {
        let Some(rule) = self.rules.get(kind) else {
            panic!("unsupported kind {}", kind);
        };
        let relevant = if self.store.is_persisted(kind) {
            // Deleting something we never stored (e.g. a duplicate delete) is not a change.
            let Some(last) = self.store.delete(kind, key) else { return };
            rule.delete_relevant(key, Some(&last))
        } else {
            rule.delete_relevant(key, None)
        };
        if relevant {
            let severity = self.severity_for(kind);
            self.severity.raise(severity);
        }
    }

    /// Current accumulated severity without resetting it.
    pub fn severity(&self) -> ChangeSeverity {
        self.severity
    }

    pub fn take_and_reset_severity(&mut self) -> ChangeSeverity {
        std::mem::take(&mut self.severity)
    }
}
