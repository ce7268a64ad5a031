//! Gantry core types: resource identity, change severity and raw events.

#![forbid(unsafe_code)]

use std::fmt;

use kube::core::GroupVersionKind;
use serde::{Deserialize, Serialize};

mod object;

pub use object::{dynamic_object_kind, ClusterObject};

#[derive(Debug, thiserror::Error, PartialEq, Eq)]
pub enum CoreError {
    #[error("invalid kind key: {0} (expect v1/Kind or group/v1/Kind)")]
    InvalidKindKey(String),
}

/// Stable identity of a resource type (group + version + kind).
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct ResourceKind {
    pub group: String,
    pub version: String,
    pub kind: String,
}

impl ResourceKind {
    pub fn new(group: &str, version: &str, kind: &str) -> Self {
        Self { group: group.to_string(), version: version.to_string(), kind: kind.to_string() }
    }

    /// Build from an `apiVersion` string (`v1` or `group/v1`) and a kind.
    pub fn from_api_version(api_version: &str, kind: &str) -> Self {
        match api_version.split_once('/') {
            Some((group, version)) => Self::new(group, version, kind),
            None => Self::new("", api_version, kind),
        }
    }

    /// Parse `v1/Kind` or `group/v1/Kind`.
    pub fn parse(key: &str) -> Result<Self, CoreError> {
        let parts: Vec<_> = key.split('/').collect();
        match parts.as_slice() {
            [version, kind] if !version.is_empty() && !kind.is_empty() => Ok(Self::new("", version, kind)),
            [group, version, kind] if !group.is_empty() && !version.is_empty() && !kind.is_empty() => {
                Ok(Self::new(group, version, kind))
            }
            _ => Err(CoreError::InvalidKindKey(key.to_string())),
        }
    }

    pub fn api_version(&self) -> String {
        if self.group.is_empty() {
            self.version.clone()
        } else {
            format!("{}/{}", self.group, self.version)
        }
    }

    pub fn gvk_key(&self) -> String {
        format!("{}/{}", self.api_version(), self.kind)
    }

    pub fn to_gvk(&self) -> GroupVersionKind {
        GroupVersionKind::gvk(&self.group, &self.version, &self.kind)
    }
}

impl fmt::Display for ResourceKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.gvk_key())
    }
}

impl From<&GroupVersionKind> for ResourceKind {
    fn from(gvk: &GroupVersionKind) -> Self {
        Self::new(&gvk.group, &gvk.version, &gvk.kind)
    }
}

/// Identity of one resource instance within a kind.
#[derive(Debug, Clone, Default, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct ResourceKey {
    /// `None` for cluster-scoped resources.
    pub namespace: Option<String>,
    pub name: String,
}

impl ResourceKey {
    pub fn namespaced(namespace: &str, name: &str) -> Self {
        Self { namespace: Some(namespace.to_string()), name: name.to_string() }
    }

    pub fn cluster(name: &str) -> Self {
        Self { namespace: None, name: name.to_string() }
    }
}

impl fmt::Display for ResourceKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match &self.namespace {
            Some(ns) => write!(f, "{}/{}", ns, self.name),
            None => f.write_str(&self.name),
        }
    }
}

/// How expensive the downstream action for the accumulated changes is.
///
/// Variants are ordered: combining two severities keeps the larger one.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub enum ChangeSeverity {
    #[default]
    NoChange,
    /// Only load-balancing endpoint membership changed; the data plane can be
    /// updated without a full reconfiguration.
    EndpointsOnlyChange,
    /// Anything else; requires a full reconfiguration.
    ClusterStateChange,
}

impl ChangeSeverity {
    /// Raise to `other` if it is more severe. Never lowers.
    pub fn raise(&mut self, other: ChangeSeverity) {
        if other > *self {
            *self = other;
        }
    }

    pub fn is_change(self) -> bool {
        self != ChangeSeverity::NoChange
    }

    pub fn as_str(self) -> &'static str {
        match self {
            ChangeSeverity::NoChange => "no_change",
            ChangeSeverity::EndpointsOnlyChange => "endpoints_only",
            ChangeSeverity::ClusterStateChange => "cluster_state",
        }
    }
}

impl fmt::Display for ChangeSeverity {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// A change notification emitted by a watch producer.
#[derive(Debug, Clone, PartialEq)]
pub enum RawEvent<O> {
    /// The object was created or updated.
    Upsert(O),
    /// The object with this key was removed.
    Delete { kind: ResourceKind, key: ResourceKey },
}

pub type EventBatch<O> = Vec<RawEvent<O>>;

pub mod prelude {
    pub use super::{
        dynamic_object_kind, ChangeSeverity, ClusterObject, EventBatch, RawEvent, ResourceKey, ResourceKind,
    };
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parse_kind_keys() {
        assert_eq!(ResourceKind::parse("v1/Service").unwrap(), ResourceKind::new("", "v1", "Service"));
        assert_eq!(
            ResourceKind::parse("gateway.networking.k8s.io/v1/Gateway").unwrap(),
            ResourceKind::new("gateway.networking.k8s.io", "v1", "Gateway")
        );
        assert!(matches!(ResourceKind::parse("Service"), Err(CoreError::InvalidKindKey(_))));
        assert!(ResourceKind::parse("a/b/c/d").is_err());
        assert!(ResourceKind::parse("/v1/Kind").is_err());
    }

    #[test]
    fn kind_key_round_trips_through_display() {
        let k = ResourceKind::from_api_version("discovery.k8s.io/v1", "EndpointSlice");
        assert_eq!(k.to_string(), "discovery.k8s.io/v1/EndpointSlice");
        assert_eq!(ResourceKind::parse(&k.to_string()).unwrap(), k);
        assert_eq!(ResourceKind::from_api_version("v1", "Secret").api_version(), "v1");
    }

    #[test]
    fn severity_raise_is_max() {
        let mut s = ChangeSeverity::NoChange;
        s.raise(ChangeSeverity::EndpointsOnlyChange);
        assert_eq!(s, ChangeSeverity::EndpointsOnlyChange);
        s.raise(ChangeSeverity::ClusterStateChange);
        s.raise(ChangeSeverity::EndpointsOnlyChange);
        s.raise(ChangeSeverity::NoChange);
        assert_eq!(s, ChangeSeverity::ClusterStateChange);
        assert!(s.is_change());
        assert!(!ChangeSeverity::default().is_change());
    }

    #[test]
    fn key_display() {
        assert_eq!(ResourceKey::namespaced("default", "web").to_string(), "default/web");
        assert_eq!(ResourceKey::cluster("nginx").to_string(), "nginx");
    }
}
