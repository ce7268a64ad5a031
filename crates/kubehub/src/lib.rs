//! Gantry kubehub: discovery, watch producers and first batch preparation
//! backed by kube-rs.

#![forbid(unsafe_code)]

use std::sync::Arc;

use anyhow::{anyhow, Context, Result};
use futures::StreamExt;
use gantry_core::{ClusterObject, RawEvent, ResourceKey, ResourceKind};
use kube::{
    api::Api,
    core::{ApiResource, DynamicObject, TypeMeta},
    discovery::{Discovery, Scope},
    runtime::{
        watcher::{self, Event},
        WatchStreamExt,
    },
    Client,
};
use metrics::counter;
use rustc_hash::FxHashSet;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

mod prepare;

pub use prepare::{keys_by_kind, FirstBatchKeys, KubeFirstBatchPreparer};

/// Decides whether a producer forwards events for a key. `Err` carries the
/// reason the key was dropped.
pub type KeyFilter = Arc<dyn Fn(&ResourceKey) -> Result<(), String> + Send + Sync>;

/// Filter for kinds where only one object, addressed by a fixed key, matters.
pub fn single_resource_filter(expected: ResourceKey) -> KeyFilter {
    Arc::new(move |key: &ResourceKey| {
        if *key == expected {
            Ok(())
        } else {
            Err(format!("only {} is watched", expected))
        }
    })
}

/// Resolve the served API resource for a kind and whether it is namespaced.
pub async fn resolve_api_resource(client: Client, kind: &ResourceKind) -> Result<(ApiResource, bool)> {
    let discovery = Discovery::new(client)
        .filter(&[kind.group.as_str()])
        .run()
        .await
        .with_context(|| format!("discovering api group of {}", kind))?;
    let (ar, caps) = discovery.resolve_gvk(&kind.to_gvk()).ok_or_else(|| anyhow!("kind not served: {}", kind))?;
    Ok((ar, matches!(caps.scope, Scope::Namespaced)))
}

pub(crate) fn dynamic_api(client: Client, ar: &ApiResource, namespaced: bool, namespace: Option<&str>) -> Api<DynamicObject> {
    match namespace {
        Some(ns) if namespaced => Api::namespaced_with(client, ns, ar),
        _ => Api::all_with(client, ar),
    }
}

/// Objects coming from list and watch calls do not reliably carry
/// apiVersion/kind; every emitted object gets them from the resolved resource.
pub(crate) fn stamp(mut obj: DynamicObject, ar: &ApiResource) -> DynamicObject {
    obj.types = Some(TypeMeta { api_version: ar.api_version.clone(), kind: ar.kind.clone() });
    obj.metadata.managed_fields = None;
    obj
}

/// Turns watcher events of one kind into raw events.
///
/// Remembers the keys it has emitted so that a restarted watch reports a
/// delete for every object that vanished while the watch was down, and
/// nothing for objects it never reported.
pub struct WatchTranslator {
    kind: ResourceKind,
    ar: ApiResource,
    filter: Option<KeyFilter>,
    observed: FxHashSet<ResourceKey>,
}

impl WatchTranslator {
    pub fn new(kind: ResourceKind, ar: ApiResource, filter: Option<KeyFilter>) -> Self {
        Self { kind, ar, filter, observed: FxHashSet::default() }
    }

    /// Treat `keys` as already reported, e.g. by the first batch. The next
    /// restart then deletes those that are no longer listed.
    pub fn seed(&mut self, keys: impl IntoIterator<Item = ResourceKey>) {
        self.observed.extend(keys);
    }

    fn admit(&self, key: &ResourceKey) -> bool {
        let Some(filter) = &self.filter else { return true };
        match filter(key) {
            Ok(()) => true,
            Err(reason) => {
                debug!(kind = %self.kind, key = %key, reason = %reason, "skipping event");
                false
            }
        }
    }

    pub fn translate(&mut self, ev: Event<DynamicObject>) -> Vec<RawEvent<DynamicObject>> {
        match ev {
            Event::Applied(o) => {
                let key = o.key();
                if !self.admit(&key) {
                    return Vec::new();
                }
                self.observed.insert(key);
                vec![RawEvent::Upsert(stamp(o, &self.ar))]
            }
            Event::Deleted(o) => {
                let key = o.key();
                if !self.admit(&key) {
                    return Vec::new();
                }
                self.observed.remove(&key);
                vec![RawEvent::Delete { kind: self.kind.clone(), key }]
            }
            Event::Restarted(list) => {
                debug!(kind = %self.kind, count = list.len(), "watch restart");
                let mut fresh = FxHashSet::default();
                let mut out = Vec::with_capacity(list.len());
                for o in list {
                    let key = o.key();
                    if !self.admit(&key) {
                        continue;
                    }
                    fresh.insert(key);
                    out.push(RawEvent::Upsert(stamp(o, &self.ar)));
                }
                let mut gone: Vec<_> = self.observed.difference(&fresh).cloned().collect();
                gone.sort();
                out.extend(gone.into_iter().map(|key| RawEvent::Delete { kind: self.kind.clone(), key }));
                self.observed = fresh;
                out
            }
        }
    }
}

/// List+watch one kind and send raw events into `tx` until `cancel` fires or
/// the receiver goes away. Watch errors are retried with backoff.
///
/// With `first_batch`, the watch starts only after the first batch was
/// prepared, and its first list is diffed against the keys of that batch.
pub async fn start_watcher(
    client: Client,
    kind: ResourceKind,
    namespace: Option<String>,
    filter: Option<KeyFilter>,
    first_batch: Option<FirstBatchKeys>,
    tx: mpsc::Sender<RawEvent<DynamicObject>>,
    cancel: CancellationToken,
) -> Result<()> {
    let (ar, namespaced) = resolve_api_resource(client.clone(), &kind).await?;
    let api = dynamic_api(client, &ar, namespaced, namespace.as_deref());
    let mut translator = WatchTranslator::new(kind.clone(), ar, filter);
    if let Some(mut first_batch) = first_batch {
        let keys = tokio::select! {
            _ = cancel.cancelled() => return Ok(()),
            keys = first_batch.wait_for(&kind) => keys,
        };
        let Some(keys) = keys else {
            debug!(kind = %kind, "first batch was not prepared; stopping watcher");
            return Ok(());
        };
        debug!(kind = %kind, count = keys.len(), "seeded from first batch");
        translator.seed(keys);
    }
    let label = kind.to_string();

    let stream = watcher::watcher(api, watcher::Config::default()).default_backoff();
    futures::pin_mut!(stream);
    info!(kind = %kind, ns = ?namespace, "watcher started");
    loop {
        let next = tokio::select! {
            _ = cancel.cancelled() => break,
            next = stream.next() => next,
        };
        let ev = match next {
            Some(Ok(ev)) => ev,
            Some(Err(e)) => {
                warn!(kind = %kind, error = %e, "watch error; retrying");
                counter!("gantry_watch_errors_total", 1u64, "kind" => label.clone());
                continue;
            }
            None => {
                warn!(kind = %kind, "watcher stream ended");
                break;
            }
        };
        let events = translator.translate(ev);
        counter!("gantry_watch_events_total", events.len() as u64, "kind" => label.clone());
        for event in events {
            tokio::select! {
                _ = cancel.cancelled() => return Ok(()),
                sent = tx.send(event) => {
                    if sent.is_err() {
                        debug!(kind = %kind, "event channel closed; stopping watcher");
                        return Ok(());
                    }
                }
            }
        }
    }
    info!(kind = %kind, "watcher stopped");
    Ok(())
}
