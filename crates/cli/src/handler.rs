use std::sync::Arc;

use async_trait::async_trait;
use gantry_core::RawEvent;
use gantry_events::EventHandler;
use gantry_store::ChangeProcessor;
use kube::core::DynamicObject;
use metrics::{counter, gauge};
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use crate::graph::Graph;

/// Applies a batch to the processor and reports the resulting graph.
pub struct BatchHandler {
    processor: Arc<ChangeProcessor<DynamicObject, Graph>>,
}

impl BatchHandler {
    pub fn new(processor: Arc<ChangeProcessor<DynamicObject, Graph>>) -> Self {
        Self { processor }
    }

    fn apply(&self, batch: &[RawEvent<DynamicObject>]) {
        for event in batch {
            match event {
                RawEvent::Upsert(obj) => self.processor.capture_upsert_change(obj.clone()),
                RawEvent::Delete { kind, key } => self.processor.capture_delete_change(kind, key),
            }
        }

        let processed = match self.processor.process() {
            Ok(p) => p,
            Err(e) => {
                error!(error = ?e, "processing batch failed; will retry with the next batch");
                return;
            }
        };
        for r in &processed.rejected {
            warn!(kind = %r.kind, key = %r.key, reason = %r.reason, "invalid object treated as deleted");
        }
        match &processed.graph {
            Some(g) => {
                info!(
                    severity = %processed.severity,
                    class = ?g.gateway_class,
                    gateways = g.gateways.len(),
                    routes = g.routes.len(),
                    services = g.services.len(),
                    "graph rebuilt"
                );
                gauge!("gantry_graph_gateways", g.gateways.len() as f64);
                gauge!("gantry_graph_routes", g.routes.len() as f64);
            }
            None => {
                debug!("no relevant changes");
                counter!("gantry_batches_without_change_total", 1u64);
            }
        }
    }
}

#[async_trait]
impl EventHandler<RawEvent<DynamicObject>> for BatchHandler {
    async fn handle_event_batch(&self, _cancel: &CancellationToken, batch: &[RawEvent<DynamicObject>]) {
        // Capture and graph building hold the processor's mutex.
        tokio::task::block_in_place(|| self.apply(batch));
    }
}
