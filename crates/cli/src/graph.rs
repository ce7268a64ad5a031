//! Gateway graph: which cluster objects the configured gateway class
//! actually uses.

use std::collections::{BTreeMap, BTreeSet};

use gantry_core::{ClusterObject, ResourceKey, ResourceKind};
use gantry_store::{ClusterState, GraphBuilder};
use kube::core::DynamicObject;
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use tracing::warn;

use crate::kinds;

/// Label carrying the owning Service of an EndpointSlice.
pub const SERVICE_NAME_LABEL: &str = "kubernetes.io/service-name";

type Labels = BTreeMap<String, String>;

#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct Graph {
    /// Set when the configured class exists and is owned by this controller.
    pub gateway_class: Option<String>,
    pub bundle_version: Option<String>,
    pub gateways: BTreeSet<ResourceKey>,
    pub routes: BTreeSet<ResourceKey>,
    pub services: BTreeSet<ResourceKey>,
    pub secrets: BTreeSet<ResourceKey>,
    /// Namespaces selected by a listener's allowed-routes label selector.
    pub namespaces: BTreeSet<String>,
    #[serde(skip)]
    namespace_selectors: Vec<Labels>,
}

impl Graph {
    fn selects(&self, labels: Option<&Labels>) -> bool {
        self.namespace_selectors.iter().any(|sel| matches_labels(sel, labels))
    }

    /// Whether a change to this object can affect the graph.
    ///
    /// A namespace counts if it was selected when the graph was built, or if
    /// its current labels match a selector (it may have just been relabeled).
    pub fn is_referenced(&self, kind: &ResourceKind, key: &ResourceKey, obj: Option<&DynamicObject>) -> bool {
        match (kind.group.as_str(), kind.kind.as_str()) {
            ("", "Secret") => self.secrets.contains(key),
            ("", "Service") => self.services.contains(key),
            ("", "Namespace") => {
                self.namespaces.contains(&key.name) || obj.map_or(false, |o| self.selects(o.metadata.labels.as_ref()))
            }
            ("discovery.k8s.io", "EndpointSlice") => {
                let service = match obj.and_then(|o| o.label(SERVICE_NAME_LABEL)) {
                    Some(name) => name,
                    // Generated slice names are "<service>-<suffix>".
                    None => match key.name.rsplit_once('-') {
                        Some((prefix, _)) => prefix,
                        None => return false,
                    },
                };
                self.services.contains(&ResourceKey { namespace: key.namespace.clone(), name: service.to_string() })
            }
            _ => false,
        }
    }
}

fn matches_labels(selector: &Labels, labels: Option<&Labels>) -> bool {
    selector.iter().all(|(k, v)| labels.and_then(|l| l.get(k)) == Some(v))
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct GatewayClassSpec {
    controller_name: String,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct GatewaySpec {
    gateway_class_name: String,
    #[serde(default)]
    listeners: Vec<Listener>,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
struct Listener {
    #[serde(default)]
    tls: Option<ListenerTls>,
    #[serde(default)]
    allowed_routes: Option<AllowedRoutes>,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
struct ListenerTls {
    #[serde(default)]
    certificate_refs: Vec<ObjectRef>,
}

#[derive(Debug, Clone, Deserialize)]
struct AllowedRoutes {
    #[serde(default)]
    namespaces: Option<RouteNamespaces>,
}

#[derive(Debug, Clone, Deserialize)]
struct RouteNamespaces {
    #[serde(default)]
    from: Option<String>,
    #[serde(default)]
    selector: Option<LabelSelector>,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
struct LabelSelector {
    #[serde(default)]
    match_labels: Labels,
}

#[derive(Debug, Clone, Deserialize)]
struct ObjectRef {
    #[serde(default)]
    group: Option<String>,
    #[serde(default)]
    kind: Option<String>,
    name: String,
    #[serde(default)]
    namespace: Option<String>,
}

impl ObjectRef {
    /// Core-group reference of `kind`; an unset kind means `default_kind`.
    fn is_core(&self, default_kind: &str) -> bool {
        self.group.as_deref().unwrap_or("").is_empty() && self.kind.as_deref().unwrap_or(default_kind) == default_kind
    }
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct HttpRouteSpec {
    #[serde(default)]
    parent_refs: Vec<ObjectRef>,
    #[serde(default)]
    rules: Vec<RouteRule>,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct RouteRule {
    #[serde(default)]
    backend_refs: Vec<ObjectRef>,
}

#[derive(Debug, Deserialize)]
struct ReferenceGrantSpec {
    #[serde(default)]
    from: Vec<GrantFrom>,
    #[serde(default)]
    to: Vec<GrantTo>,
}

#[derive(Debug, Deserialize)]
struct GrantFrom {
    group: String,
    kind: String,
    namespace: String,
}

#[derive(Debug, Deserialize)]
struct GrantTo {
    #[serde(default)]
    group: String,
    kind: String,
    #[serde(default)]
    name: Option<String>,
}

/// Reference grants by the namespace they live in.
struct Grants(Vec<(String, ReferenceGrantSpec)>);

impl Grants {
    fn permit(&self, from_kind: &str, from_ns: &str, to_kind: &str, to_ns: &str, to_name: &str) -> bool {
        if from_ns == to_ns {
            return true;
        }
        self.0.iter().filter(|(ns, _)| ns == to_ns).any(|(_, g)| {
            g.from.iter().any(|f| f.group == kinds::GATEWAY_GROUP && f.kind == from_kind && f.namespace == from_ns)
                && g.to.iter().any(|t| t.group.is_empty() && t.kind == to_kind && t.name.as_deref().map_or(true, |n| n == to_name))
        })
    }
}

fn spec<T: DeserializeOwned>(obj: &DynamicObject) -> Option<T> {
    let raw = obj.data.get("spec")?;
    match T::deserialize(raw) {
        Ok(s) => Some(s),
        Err(e) => {
            warn!(key = %obj.key(), error = %e, "ignoring object with malformed spec");
            None
        }
    }
}

fn namespace_of(obj: &DynamicObject) -> String {
    obj.metadata.namespace.clone().unwrap_or_default()
}

/// Builds the graph for one gateway class owned by one controller.
pub struct GatewayGraphBuilder {
    controller_name: String,
    gateway_class: String,
}

impl GatewayGraphBuilder {
    pub fn new(controller_name: impl Into<String>, gateway_class: impl Into<String>) -> Self {
        Self { controller_name: controller_name.into(), gateway_class: gateway_class.into() }
    }

    fn admits(&self, listener: &Listener, gateway_ns: &str, route_ns: &str, route_ns_labels: Option<&Labels>) -> bool {
        let namespaces = listener.allowed_routes.as_ref().and_then(|a| a.namespaces.as_ref());
        match namespaces.and_then(|n| n.from.as_deref()) {
            Some("All") => true,
            Some("Selector") => namespaces
                .and_then(|n| n.selector.as_ref())
                .map_or(false, |s| matches_labels(&s.match_labels, route_ns_labels)),
            _ => gateway_ns == route_ns,
        }
    }
}

impl GraphBuilder<DynamicObject, Graph> for GatewayGraphBuilder {
    fn build(&self, state: &ClusterState<DynamicObject>) -> anyhow::Result<Graph> {
        let mut g = Graph {
            bundle_version: state
                .get(&kinds::crd(), &ResourceKey::cluster(kinds::GATEWAY_CRD))
                .and_then(|crd| crd.annotation(kinds::BUNDLE_VERSION_ANNOTATION))
                .map(str::to_string),
            ..Graph::default()
        };

        let Some(class) = state.get(&kinds::gateway_class(), &ResourceKey::cluster(&self.gateway_class)) else {
            return Ok(g);
        };
        match spec::<GatewayClassSpec>(class) {
            Some(s) if s.controller_name == self.controller_name => g.gateway_class = Some(self.gateway_class.clone()),
            _ => return Ok(g),
        }

        let grants = Grants(
            state
                .objects(&kinds::reference_grant())
                .filter_map(|o| spec::<ReferenceGrantSpec>(o).map(|s| (namespace_of(o), s)))
                .collect(),
        );
        let namespace_labels =
            |ns: &str| state.get(&kinds::namespace(), &ResourceKey::cluster(ns)).and_then(|o| o.metadata.labels.as_ref());

        let mut listeners: BTreeMap<ResourceKey, Vec<Listener>> = BTreeMap::new();
        for gw in state.objects(&kinds::gateway()) {
            let Some(spec) = spec::<GatewaySpec>(gw) else { continue };
            if spec.gateway_class_name != self.gateway_class {
                continue;
            }
            let gw_ns = namespace_of(gw);
            for l in &spec.listeners {
                for cert in l.tls.iter().flat_map(|t| &t.certificate_refs) {
                    let ns = cert.namespace.clone().unwrap_or_else(|| gw_ns.clone());
                    if cert.is_core("Secret") && grants.permit("Gateway", &gw_ns, "Secret", &ns, &cert.name) {
                        g.secrets.insert(ResourceKey::namespaced(&ns, &cert.name));
                    }
                }
                let namespaces = l.allowed_routes.as_ref().and_then(|a| a.namespaces.as_ref());
                if let Some(RouteNamespaces { from: Some(from), selector: Some(sel) }) = namespaces {
                    if from == "Selector" {
                        g.namespace_selectors.push(sel.match_labels.clone());
                    }
                }
            }
            g.gateways.insert(gw.key());
            listeners.insert(gw.key(), spec.listeners);
        }

        for ns in state.objects(&kinds::namespace()) {
            if g.selects(ns.metadata.labels.as_ref()) {
                g.namespaces.insert(ns.key().name);
            }
        }

        for route in state.objects(&kinds::http_route()) {
            let Some(spec) = spec::<HttpRouteSpec>(route) else { continue };
            let route_ns = namespace_of(route);
            let attached = spec.parent_refs.iter().filter(|p| p.kind.as_deref().unwrap_or("Gateway") == "Gateway").any(|p| {
                let gw_ns = p.namespace.as_deref().unwrap_or(&route_ns);
                listeners.get(&ResourceKey::namespaced(gw_ns, &p.name)).map_or(false, |ls| {
                    ls.iter().any(|l| self.admits(l, gw_ns, &route_ns, namespace_labels(&route_ns)))
                })
            });
            if !attached {
                continue;
            }
            g.routes.insert(route.key());
            for backend in spec.rules.iter().flat_map(|r| &r.backend_refs) {
                let ns = backend.namespace.clone().unwrap_or_else(|| route_ns.clone());
                if backend.is_core("Service") && grants.permit("HTTPRoute", &route_ns, "Service", &ns, &backend.name) {
                    g.services.insert(ResourceKey::namespaced(&ns, &backend.name));
                }
            }
        }
        Ok(g)
    }
}
