use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::Instant;

use arc_swap::ArcSwapOption;
use gantry_core::{ChangeSeverity, ClusterObject, ResourceKey, ResourceKind};
use metrics::{counter, histogram};

use crate::multi::{ClusterState, KindFn};
use crate::registry::{KindRegistry, RegistryError};
use crate::tracker::ChangeTracker;

/// Computes the downstream graph from a cluster state snapshot.
pub trait GraphBuilder<O, G>: Send + Sync {
    fn build(&self, state: &ClusterState<O>) -> anyhow::Result<G>;
}

impl<O, G, F> GraphBuilder<O, G> for F
where
    F: Fn(&ClusterState<O>) -> anyhow::Result<G> + Send + Sync,
{
    fn build(&self, state: &ClusterState<O>) -> anyhow::Result<G> {
        (self)(state)
    }
}

/// Validates an object before it is stored. A rejected object is treated as
/// a delete of its key.
pub type Validator<O> = Arc<dyn Fn(&O) -> Result<(), String> + Send + Sync>;

/// Shared, lock-free read access to the latest graph.
///
/// Written only by [`ChangeProcessor::process`] while the processor lock is
/// held, so relevance checks running under that lock can consult it.
pub struct GraphReader<G> {
    slot: Arc<ArcSwapOption<G>>,
}

impl<G> Clone for GraphReader<G> {
    fn clone(&self) -> Self {
        Self { slot: Arc::clone(&self.slot) }
    }
}

impl<G> Default for GraphReader<G> {
    fn default() -> Self {
        Self { slot: Arc::new(ArcSwapOption::empty()) }
    }
}

impl<G> GraphReader<G> {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn latest(&self) -> Option<Arc<G>> {
        self.slot.load_full()
    }

    fn publish(&self, graph: Arc<G>) {
        self.slot.store(Some(graph));
    }
}

pub struct ProcessorConfig<O, G> {
    pub extract_kind: KindFn<O>,
    pub builder: Arc<dyn GraphBuilder<O, G>>,
    pub validator: Option<Validator<O>>,
}

/// An upsert turned into a delete by the validator.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Rejection {
    pub kind: ResourceKind,
    pub key: ResourceKey,
    pub reason: String,
}

#[derive(Debug)]
pub struct Processed<G> {
    pub severity: ChangeSeverity,
    /// Present iff `severity` is a change.
    pub graph: Option<Arc<G>>,
    /// Upserts rejected since the previous call.
    pub rejected: Vec<Rejection>,
}

impl<G> Processed<G> {
    pub fn changed(&self) -> bool {
        self.severity.is_change()
    }
}

#[derive(Debug, thiserror::Error)]
pub enum ProcessError {
    #[error("building graph failed")]
    Build(#[source] anyhow::Error),
}

struct Inner<O> {
    tracker: ChangeTracker<O>,
    rejected: Vec<Rejection>,
}

/// Public facade of the reconciliation engine.
///
/// Captures changes, and on [`process`](Self::process) rebuilds the graph only
/// when a relevant change was captured since the previous call. All mutation
/// happens under one mutex; callers never get a mutable handle on the state.
pub struct ChangeProcessor<O, G> {
    inner: Mutex<Inner<O>>,
    builder: Arc<dyn GraphBuilder<O, G>>,
    validator: Option<Validator<O>>,
    graph: GraphReader<G>,
}

impl<O: ClusterObject, G> ChangeProcessor<O, G> {
    /// Create a processor. `registry` receives the reader every built graph
    /// is published to; reference checks must read the graph through it.
    pub fn new<F>(cfg: ProcessorConfig<O, G>, registry: F) -> Result<Self, RegistryError>
    where
        F: FnOnce(&GraphReader<G>) -> Result<KindRegistry<O>, RegistryError>,
    {
        let graph = GraphReader::new();
        let registry = registry(&graph)?;
        Ok(Self {
            inner: Mutex::new(Inner {
                tracker: ChangeTracker::new(registry, cfg.extract_kind),
                rejected: Vec::new(),
            }),
            builder: cfg.builder,
            validator: cfg.validator,
            graph,
        })
    }

    // Registration is checked before any mutation, and `process` takes the
    // severity and rejections only after the builder returned. State behind a
    // poisoned lock is therefore still consistent.
    fn lock(&self) -> MutexGuard<'_, Inner<O>> {
        self.inner.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Capture a create or update.
    ///
    /// # Panics
    ///
    /// Panics if the object's kind is not registered.
    pub fn capture_upsert_change(&self, obj: O) {
        let mut inner = self.lock();
        let kind = inner.tracker.kind_of(&obj);
        inner.tracker.assert_supported(&kind);
        if let Some(validator) = &self.validator {
            if let Err(reason) = validator(&obj) {
                let key = obj.key();
                inner.tracker.delete(&kind, &key);
                inner.rejected.push(Rejection { kind, key, reason });
                counter!("gantry_rejected_upserts_total", 1u64);
                return;
            }
        }
        inner.tracker.upsert(obj);
    }

    /// Capture a removal.
    ///
    /// # Panics
    ///
    /// Panics if the kind is not registered.
    pub fn capture_delete_change(&self, kind: &ResourceKind, key: &ResourceKey) {
        self.lock().tracker.delete(kind, key);
    }

    /// Take the accumulated severity and, if anything relevant changed, build
    /// and publish a new graph. A cycle without relevant changes does not
    /// invoke the graph builder.
    ///
    /// If the builder fails or panics the severity and pending rejections are
    /// kept, so the next call retries.
    pub fn process(&self) -> Result<Processed<G>, ProcessError> {
        let mut inner = self.lock();
        let severity = inner.tracker.severity();
        counter!("gantry_process_total", 1u64, "severity" => severity.as_str());
        if !severity.is_change() {
            inner.tracker.take_and_reset_severity();
            let rejected = std::mem::take(&mut inner.rejected);
            return Ok(Processed { severity, graph: None, rejected });
        }

        let started = Instant::now();
        let graph = match self.builder.build(inner.tracker.state()) {
            Ok(g) => Arc::new(g),
            Err(e) => {
                counter!("gantry_graph_build_errors_total", 1u64);
                return Err(ProcessError::Build(e));
            }
        };
        histogram!("gantry_graph_build_ms", started.elapsed().as_secs_f64() * 1000.0);
        inner.tracker.take_and_reset_severity();
        let rejected = std::mem::take(&mut inner.rejected);
        self.graph.publish(Arc::clone(&graph));
        Ok(Processed { severity, graph: Some(graph), rejected })
    }

    /// Last graph built by [`process`](Self::process), without side effects.
    pub fn latest_graph(&self) -> Option<Arc<G>> {
        self.graph.latest()
    }

    pub fn graph_reader(&self) -> GraphReader<G> {
        self.graph.clone()
    }
}
