use gantry_core::ResourceKind;
use serde::Serialize;

use crate::relevance::RelevanceRule;

/// Registration of one kind, for diagnostics.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct KindSummary {
    pub kind: ResourceKind,
    pub persisted: bool,
    pub policy: &'static str,
    pub endpoints: bool,
}

pub(crate) struct KindEntry<O> {
    pub(crate) kind: ResourceKind,
    pub(crate) persisted: bool,
    pub(crate) rule: Box<dyn RelevanceRule<O>>,
}

#[derive(Debug, thiserror::Error, PartialEq, Eq)]
pub enum RegistryError {
    #[error("kind registry is empty")]
    Empty,
    #[error("kind {0} registered more than once")]
    DuplicateKind(ResourceKind),
    #[error("endpoints kind {0} is not registered")]
    UnknownEndpointsKind(ResourceKind),
    #[error("more than one endpoints kind designated: {0} and {1}")]
    MultipleEndpointsKinds(ResourceKind, ResourceKind),
}

/// Static, validated description of every kind the engine tracks.
pub struct KindRegistry<O> {
    pub(crate) entries: Vec<KindEntry<O>>,
    pub(crate) endpoints_kind: Option<ResourceKind>,
}

impl<O> KindRegistry<O> {
    pub fn builder() -> KindRegistryBuilder<O> {
        KindRegistryBuilder { entries: Vec::new(), endpoints: Vec::new() }
    }

    pub fn endpoints_kind(&self) -> Option<&ResourceKind> {
        self.endpoints_kind.as_ref()
    }

    pub fn summaries(&self) -> Vec<KindSummary> {
        self.entries
            .iter()
            .map(|e| KindSummary {
                kind: e.kind.clone(),
                persisted: e.persisted,
                policy: e.rule.policy(),
                endpoints: self.endpoints_kind.as_ref() == Some(&e.kind),
            })
            .collect()
    }
}

pub struct KindRegistryBuilder<O> {
    entries: Vec<KindEntry<O>>,
    endpoints: Vec<ResourceKind>,
}

impl<O> KindRegistryBuilder<O> {
    /// Track the kind and keep the last known object of each instance.
    pub fn persisted(mut self, kind: ResourceKind, rule: impl RelevanceRule<O> + 'static) -> Self {
        self.entries.push(KindEntry { kind, persisted: true, rule: Box::new(rule) });
        self
    }

    /// Track the kind without storing its objects; only the occurrence of an
    /// event matters.
    pub fn tracked(mut self, kind: ResourceKind, rule: impl RelevanceRule<O> + 'static) -> Self {
        self.entries.push(KindEntry { kind, persisted: false, rule: Box::new(rule) });
        self
    }

    /// Relevant changes of this kind raise `EndpointsOnlyChange` instead of
    /// `ClusterStateChange`.
    pub fn endpoints_kind(mut self, kind: ResourceKind) -> Self {
        self.endpoints.push(kind);
        self
    }

    pub fn build(self) -> Result<KindRegistry<O>, RegistryError> {
        if self.entries.is_empty() {
            return Err(RegistryError::Empty);
        }
        for (i, e) in self.entries.iter().enumerate() {
            if self.entries[..i].iter().any(|prev| prev.kind == e.kind) {
                return Err(RegistryError::DuplicateKind(e.kind.clone()));
            }
        }
        let endpoints_kind = match self.endpoints.as_slice() {
            [] => None,
            [kind] => Some(kind.clone()),
            [first, second, ..] => {
                return Err(RegistryError::MultipleEndpointsKinds(first.clone(), second.clone()))
            }
        };
        if let Some(kind) = &endpoints_kind {
            if !self.entries.iter().any(|e| &e.kind == kind) {
                return Err(RegistryError::UnknownEndpointsKind(kind.clone()));
            }
        }
        Ok(KindRegistry { entries: self.entries, endpoints_kind })
    }
}
