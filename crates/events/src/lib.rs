//! Gantry event loop: groups events that arrive while a batch is being
//! handled and hands them to the handler together, one batch at a time.

#![forbid(unsafe_code)]

use std::sync::Arc;
use std::time::Instant;

use async_trait::async_trait;
use metrics::{counter, gauge, histogram};
use tokio::sync::mpsc;
use tokio::task::{JoinError, JoinHandle};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, info_span, Instrument};

/// Consumes batches produced by the [`EventLoop`].
#[async_trait]
pub trait EventHandler<E>: Send + Sync {
    /// Handle every event of `batch`. Should return promptly once `cancel`
    /// fires.
    async fn handle_event_batch(&self, cancel: &CancellationToken, batch: &[E]);
}

/// Produces the batch handled before any event from the input channel.
///
/// Expected to enumerate everything currently relevant, so the first handling
/// pass sees a complete view of the cluster.
#[async_trait]
pub trait FirstBatchPreparer<E>: Send + Sync {
    async fn prepare(&self, cancel: &CancellationToken) -> anyhow::Result<Vec<E>>;
}

#[derive(Debug, thiserror::Error)]
pub enum EventLoopError {
    #[error("failed to prepare the first batch")]
    PrepareFirstBatch(#[source] anyhow::Error),
    #[error("event handler task did not complete")]
    HandlerTask(#[source] JoinError),
}

/// Single-flight batching scheduler.
///
/// At most one batch is handled at a time. Events received meanwhile are
/// collected into the next batch, which is dispatched as soon as the current
/// one finishes. Handled buffers come back from the handler task and are
/// reused for accumulation.
pub struct EventLoop<E> {
    events: mpsc::Receiver<E>,
    handler: Arc<dyn EventHandler<E>>,
    preparer: Arc<dyn FirstBatchPreparer<E>>,
    next: Vec<E>,
    spare: Vec<E>,
    batch_id: u64,
}

impl<E: Send + Sync + 'static> EventLoop<E> {
    pub fn new(
        events: mpsc::Receiver<E>,
        handler: Arc<dyn EventHandler<E>>,
        preparer: Arc<dyn FirstBatchPreparer<E>>,
    ) -> Self {
        Self { events, handler, preparer, next: Vec::new(), spare: Vec::new(), batch_id: 0 }
    }

    /// Run until `cancel` fires or the input channel is closed and drained.
    ///
    /// On cancellation a batch in flight is awaited before returning. Only a
    /// first-batch failure is reported as an error.
    pub async fn start(mut self, cancel: CancellationToken) -> Result<(), EventLoopError> {
        let first = self.preparer.prepare(&cancel).await.map_err(EventLoopError::PrepareFirstBatch)?;
        info!(total = first.len(), "first batch prepared");
        let mut in_flight = Some(self.dispatch(first, &cancel));
        let mut input_open = true;

        loop {
            tokio::select! {
                _ = cancel.cancelled() => {
                    if let Some(task) = in_flight.take() {
                        debug!("waiting for the batch in flight before stopping");
                        finished(task.await)?;
                    }
                    info!("event loop stopped");
                    return Ok(());
                }
                maybe = self.events.recv(), if input_open => {
                    match maybe {
                        Some(event) => {
                            self.next.push(event);
                            debug!(total = self.next.len(), "added an event to the next batch");
                        }
                        None => {
                            debug!(pending = self.next.len(), "event channel closed");
                            input_open = false;
                        }
                    }
                }
                res = join(&mut in_flight), if in_flight.is_some() => {
                    in_flight = None;
                    let mut buf = finished(res)?;
                    buf.clear();
                    self.spare = buf;
                }
            }

            if in_flight.is_none() {
                if !self.next.is_empty() {
                    let batch = std::mem::replace(&mut self.next, std::mem::take(&mut self.spare));
                    in_flight = Some(self.dispatch(batch, &cancel));
                } else if !input_open {
                    info!("event channel drained; event loop stopped");
                    return Ok(());
                }
            }
        }
    }

    fn dispatch(&mut self, batch: Vec<E>, cancel: &CancellationToken) -> JoinHandle<Vec<E>> {
        self.batch_id += 1;
        let span = info_span!("event_handler", batch_id = self.batch_id);
        let handler = Arc::clone(&self.handler);
        let cancel = cancel.clone();
        counter!("gantry_event_batches_total", 1u64);
        gauge!("gantry_event_batch_size", batch.len() as f64);
        tokio::spawn(
            async move {
                debug!(total = batch.len(), "handling events from the batch");
                let started = Instant::now();
                handler.handle_event_batch(&cancel, &batch).await;
                histogram!("gantry_event_batch_handle_ms", started.elapsed().as_secs_f64() * 1000.0);
                debug!("finished handling the batch");
                batch
            }
            .instrument(span),
        )
    }
}

async fn join<E>(task: &mut Option<JoinHandle<Vec<E>>>) -> Result<Vec<E>, JoinError> {
    match task {
        Some(t) => t.await,
        None => std::future::pending().await,
    }
}

// A panicking handler takes the loop down with it.
fn finished<E>(res: Result<Vec<E>, JoinError>) -> Result<Vec<E>, EventLoopError> {
    match res {
        Ok(buf) => Ok(buf),
        Err(e) if e.is_panic() => std::panic::resume_unwind(e.into_panic()),
        Err(e) => Err(EventLoopError::HandlerTask(e)),
    }
}
