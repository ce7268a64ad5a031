use std::sync::Arc;

use anyhow::{bail, Context, Result};
use async_trait::async_trait;
use gantry_core::{dynamic_object_kind, ClusterObject, RawEvent, ResourceKey, ResourceKind};
use gantry_events::FirstBatchPreparer;
use kube::{api::ListParams, core::DynamicObject, Client};
use rustc_hash::FxHashMap;
use tokio::sync::watch;
use tokio_util::sync::CancellationToken;
use tracing::debug;

use crate::{dynamic_api, resolve_api_resource, stamp};

type KeysByKind = FxHashMap<ResourceKind, Vec<ResourceKey>>;

/// Keys of the upserts in a prepared batch, grouped by kind.
pub fn keys_by_kind(batch: &[RawEvent<DynamicObject>]) -> KeysByKind {
    let mut keys = KeysByKind::default();
    for event in batch {
        if let RawEvent::Upsert(o) = event {
            keys.entry(dynamic_object_kind(o)).or_default().push(o.key());
        }
    }
    keys
}

/// Handle on the keys of the first batch, once it has been prepared.
///
/// Watchers seed their translators from it before their first list, so an
/// object deleted between the first batch and that list is reported.
#[derive(Clone)]
pub struct FirstBatchKeys {
    rx: watch::Receiver<Option<Arc<KeysByKind>>>,
}

pub(crate) fn first_batch_keys() -> (watch::Sender<Option<Arc<KeysByKind>>>, FirstBatchKeys) {
    let (tx, rx) = watch::channel(None);
    (tx, FirstBatchKeys { rx })
}

impl FirstBatchKeys {
    /// Wait for the first batch and return the keys it holds for `kind`.
    /// `None` if the batch was never prepared.
    pub async fn wait_for(&mut self, kind: &ResourceKind) -> Option<Vec<ResourceKey>> {
        let prepared = self.rx.wait_for(Option::is_some).await.ok()?.clone()?;
        Some(prepared.get(kind).cloned().unwrap_or_default())
    }
}

/// Snapshots the cluster as upsert events: every object of each listed kind,
/// plus singleton objects fetched by key. A missing singleton is skipped.
pub struct KubeFirstBatchPreparer {
    client: Client,
    namespace: Option<String>,
    listed: Vec<ResourceKind>,
    singletons: Vec<(ResourceKind, ResourceKey)>,
    prepared: watch::Sender<Option<Arc<KeysByKind>>>,
    keys: FirstBatchKeys,
}

impl KubeFirstBatchPreparer {
    pub fn new(client: Client, namespace: Option<String>) -> Self {
        let (prepared, keys) = first_batch_keys();
        Self { client, namespace, listed: Vec::new(), singletons: Vec::new(), prepared, keys }
    }

    pub fn list(mut self, kind: ResourceKind) -> Self {
        self.listed.push(kind);
        self
    }

    pub fn singleton(mut self, kind: ResourceKind, key: ResourceKey) -> Self {
        self.singletons.push((kind, key));
        self
    }

    /// Keys of the batch returned by `prepare`, for seeding watchers.
    pub fn first_batch_keys(&self) -> FirstBatchKeys {
        self.keys.clone()
    }
}

#[async_trait]
impl FirstBatchPreparer<RawEvent<DynamicObject>> for KubeFirstBatchPreparer {
    async fn prepare(&self, cancel: &CancellationToken) -> Result<Vec<RawEvent<DynamicObject>>> {
        let mut batch = Vec::new();
        for kind in &self.listed {
            if cancel.is_cancelled() {
                bail!("cancelled while preparing the first batch");
            }
            let (ar, namespaced) = resolve_api_resource(self.client.clone(), kind).await?;
            let api = dynamic_api(self.client.clone(), &ar, namespaced, self.namespace.as_deref());
            let list = api.list(&ListParams::default()).await.with_context(|| format!("listing {}", kind))?;
            debug!(kind = %kind, count = list.items.len(), "listed");
            batch.extend(list.items.into_iter().map(|o| RawEvent::Upsert(stamp(o, &ar))));
        }
        for (kind, key) in &self.singletons {
            if cancel.is_cancelled() {
                bail!("cancelled while preparing the first batch");
            }
            let (ar, namespaced) = resolve_api_resource(self.client.clone(), kind).await?;
            let api = dynamic_api(self.client.clone(), &ar, namespaced, key.namespace.as_deref());
            match api.get_opt(&key.name).await.with_context(|| format!("getting {} {}", kind, key))? {
                Some(o) => batch.push(RawEvent::Upsert(stamp(o, &ar))),
                None => debug!(kind = %kind, key = %key, "singleton not found; skipping"),
            }
        }
        self.prepared.send_replace(Some(Arc::new(keys_by_kind(&batch))));
        Ok(batch)
    }
}

#[cfg(test)]
mod tests {
    use kube::core::{ApiResource, GroupVersionKind};

    use super::*;

    fn upsert(kind: &str, ns: &str, name: &str) -> RawEvent<DynamicObject> {
        let ar = ApiResource::from_gvk(&GroupVersionKind::gvk("", "v1", kind));
        RawEvent::Upsert(DynamicObject::new(name, &ar).within(ns))
    }

    #[test]
    fn batch_keys_are_grouped_by_kind() {
        let keys = keys_by_kind(&[upsert("Service", "a", "web"), upsert("Secret", "a", "tls"), upsert("Service", "b", "db")]);
        assert_eq!(
            keys[&ResourceKind::new("", "v1", "Service")],
            vec![ResourceKey::namespaced("a", "web"), ResourceKey::namespaced("b", "db")]
        );
        assert_eq!(keys[&ResourceKind::new("", "v1", "Secret")], vec![ResourceKey::namespaced("a", "tls")]);
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn waiters_get_keys_once_the_batch_is_prepared() {
        let (tx, keys) = first_batch_keys();
        let service = ResourceKind::new("", "v1", "Service");
        let waiter = tokio::spawn({
            let (mut keys, service) = (keys.clone(), service.clone());
            async move { keys.wait_for(&service).await }
        });
        tx.send_replace(Some(Arc::new(keys_by_kind(&[upsert("Service", "a", "web")]))));
        assert_eq!(waiter.await.unwrap(), Some(vec![ResourceKey::namespaced("a", "web")]));

        // Kinds without objects in the batch start from nothing.
        let mut late = keys.clone();
        assert_eq!(late.wait_for(&ResourceKind::new("", "v1", "Secret")).await, Some(Vec::new()));
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn waiters_give_up_when_no_batch_is_prepared() {
        let (tx, mut keys) = first_batch_keys();
        drop(tx);
        assert_eq!(keys.wait_for(&ResourceKind::new("", "v1", "Service")).await, None);
    }
}
