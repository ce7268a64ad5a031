//! Kinds the gateway controller watches and how changes to each are judged.

use std::sync::Arc;

use gantry_core::{dynamic_object_kind, ResourceKey, ResourceKind};
use gantry_store::relevance::{AnnotationChanged, FuncPredicate, Unchanged};
use gantry_store::{GraphReader, KindRegistry, RegistryError};
use kube::core::DynamicObject;

use crate::graph::Graph;

pub const GATEWAY_GROUP: &str = "gateway.networking.k8s.io";
pub const BUNDLE_VERSION_ANNOTATION: &str = "gateway.networking.k8s.io/bundle-version";
/// CRD whose bundle-version annotation is tracked.
pub const GATEWAY_CRD: &str = "gateways.gateway.networking.k8s.io";

pub fn gateway_class() -> ResourceKind { ResourceKind::new(GATEWAY_GROUP, "v1", "GatewayClass") }
pub fn gateway() -> ResourceKind { ResourceKind::new(GATEWAY_GROUP, "v1", "Gateway") }
pub fn http_route() -> ResourceKind { ResourceKind::new(GATEWAY_GROUP, "v1", "HTTPRoute") }
pub fn reference_grant() -> ResourceKind { ResourceKind::new(GATEWAY_GROUP, "v1beta1", "ReferenceGrant") }
pub fn namespace() -> ResourceKind { ResourceKind::new("", "v1", "Namespace") }
pub fn service() -> ResourceKind { ResourceKind::new("", "v1", "Service") }
pub fn secret() -> ResourceKind { ResourceKind::new("", "v1", "Secret") }
pub fn endpoint_slice() -> ResourceKind { ResourceKind::new("discovery.k8s.io", "v1", "EndpointSlice") }
pub fn crd() -> ResourceKind { ResourceKind::new("apiextensions.k8s.io", "v1", "CustomResourceDefinition") }

/// A watched kind; singleton kinds only care about one fixed key.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Watched {
    pub kind: ResourceKind,
    pub singleton: Option<ResourceKey>,
}

pub fn watched(gateway_class_name: &str) -> Vec<Watched> {
    let listed = |kind| Watched { kind, singleton: None };
    vec![
        Watched { kind: gateway_class(), singleton: Some(ResourceKey::cluster(gateway_class_name)) },
        listed(gateway()),
        listed(http_route()),
        listed(reference_grant()),
        listed(namespace()),
        listed(service()),
        listed(secret()),
        listed(endpoint_slice()),
        Watched { kind: crd(), singleton: Some(ResourceKey::cluster(GATEWAY_CRD)) },
    ]
}

fn referenced(graph: &GraphReader<Graph>, kind: ResourceKind) -> FuncPredicate<DynamicObject> {
    let graph = graph.clone();
    FuncPredicate::new(Arc::new(move |key: &ResourceKey, obj: Option<&DynamicObject>| {
        graph.latest().map_or(false, |g| g.is_referenced(&kind, key, obj))
    }))
}

/// Registry of the gateway controller. Reference predicates read the graph
/// published through `graph`.
pub fn registry(graph: &GraphReader<Graph>) -> Result<KindRegistry<DynamicObject>, RegistryError> {
    KindRegistry::builder()
        .persisted(gateway_class(), Unchanged::generation())
        .persisted(gateway(), Unchanged::generation())
        .persisted(http_route(), Unchanged::generation())
        .persisted(reference_grant(), Unchanged::generation())
        .persisted(namespace(), referenced(graph, namespace()))
        .persisted(service(), referenced(graph, service()))
        .persisted(secret(), referenced(graph, secret()))
        .tracked(endpoint_slice(), referenced(graph, endpoint_slice()))
        .endpoints_kind(endpoint_slice())
        .persisted(crd(), AnnotationChanged::new(BUNDLE_VERSION_ANNOTATION))
        .build()
}

/// Gateways and routes without a spec cannot be configured; storing them
/// would keep a stale valid version alive.
pub fn validate_upsert(obj: &DynamicObject) -> Result<(), String> {
    let kind = dynamic_object_kind(obj);
    if kind != gateway() && kind != http_route() {
        return Ok(());
    }
    match obj.data.get("spec") {
        Some(spec) if spec.is_object() => Ok(()),
        _ => Err(format!("{} has no spec", kind.kind)),
    }
}

#[cfg(test)]
mod tests {
    use kube::core::ApiResource;
    use serde_json::json;

    use super::*;

    fn obj(kind: &ResourceKind, data: serde_json::Value) -> DynamicObject {
        DynamicObject::new("x", &ApiResource::from_gvk(&kind.to_gvk())).within("default").data(data)
    }

    #[test]
    fn registry_is_valid() {
        let registry = registry(&GraphReader::new()).unwrap();
        assert_eq!(registry.endpoints_kind(), Some(&endpoint_slice()));
        let tracked: Vec<_> = registry.summaries().into_iter().filter(|s| !s.persisted).map(|s| s.kind).collect();
        assert_eq!(tracked, vec![endpoint_slice()]);
        assert_eq!(registry.summaries().len(), watched("gantry").len());
    }

    #[test]
    fn only_configured_class_is_a_singleton() {
        let singletons: Vec<_> = watched("gantry").into_iter().filter_map(|w| w.singleton).collect();
        assert_eq!(singletons, vec![ResourceKey::cluster("gantry"), ResourceKey::cluster(GATEWAY_CRD)]);
    }

    #[test]
    fn validator_requires_spec_on_gateways_and_routes() {
        assert!(validate_upsert(&obj(&gateway(), json!({"spec": {"gatewayClassName": "gantry"}}))).is_ok());
        assert_eq!(validate_upsert(&obj(&gateway(), json!({}))).unwrap_err(), "Gateway has no spec");
        assert!(validate_upsert(&obj(&http_route(), json!({"spec": null}))).is_err());
        assert!(validate_upsert(&obj(&service(), json!({}))).is_ok());
    }
}
