#![forbid(unsafe_code)]

use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use gantry_events::{EventHandler, EventLoop, EventLoopError, FirstBatchPreparer};
use tokio::sync::{mpsc, Semaphore};
use tokio_util::sync::CancellationToken;

/// Records every batch and then blocks until the test hands out a permit.
struct GatedHandler {
    batches: Mutex<Vec<Vec<u32>>>,
    gate: Semaphore,
}

impl GatedHandler {
    fn new(permits: usize) -> Arc<Self> {
        Arc::new(Self { batches: Mutex::new(Vec::new()), gate: Semaphore::new(permits) })
    }

    fn batches(&self) -> Vec<Vec<u32>> {
        self.batches.lock().unwrap().clone()
    }
}

#[async_trait]
impl EventHandler<u32> for GatedHandler {
    async fn handle_event_batch(&self, _cancel: &CancellationToken, batch: &[u32]) {
        self.batches.lock().unwrap().push(batch.to_vec());
        self.gate.acquire().await.unwrap().forget();
    }
}

struct Fixed(Result<Vec<u32>, &'static str>);

#[async_trait]
impl FirstBatchPreparer<u32> for Fixed {
    async fn prepare(&self, _cancel: &CancellationToken) -> anyhow::Result<Vec<u32>> {
        self.0.clone().map_err(anyhow::Error::msg)
    }
}

async fn eventually(what: &str, cond: impl Fn() -> bool) {
    for _ in 0..500 {
        if cond() {
            return;
        }
        tokio::time::sleep(Duration::from_millis(2)).await;
    }
    panic!("timed out waiting for {}", what);
}

#[tokio::test(flavor = "multi_thread")]
async fn first_batch_is_handled_immediately() {
    let handler = GatedHandler::new(10);
    let (_tx, rx) = mpsc::channel::<u32>(8);
    let cancel = CancellationToken::new();
    let el = EventLoop::new(rx, handler.clone(), Arc::new(Fixed(Ok(vec![7, 8]))));
    let run = tokio::spawn(el.start(cancel.clone()));

    eventually("first batch", || handler.batches().len() == 1).await;
    assert_eq!(handler.batches(), vec![vec![7, 8]]);

    cancel.cancel();
    run.await.unwrap().unwrap();
}

#[tokio::test(flavor = "multi_thread")]
async fn events_arriving_while_busy_form_one_batch() {
    let handler = GatedHandler::new(0);
    let (tx, rx) = mpsc::channel::<u32>(8);
    let cancel = CancellationToken::new();
    let el = EventLoop::new(rx, handler.clone(), Arc::new(Fixed(Ok(vec![0]))));
    let run = tokio::spawn(el.start(cancel.clone()));

    eventually("first batch", || handler.batches().len() == 1).await;
    for e in 1..=3 {
        tx.send(e).await.unwrap();
    }
    // All three must be taken off the channel before the busy batch finishes.
    eventually("events received", || tx.capacity() == tx.max_capacity()).await;
    handler.gate.add_permits(1);

    eventually("second batch", || handler.batches().len() == 2).await;
    handler.gate.add_permits(1);
    tokio::time::sleep(Duration::from_millis(20)).await;
    assert_eq!(handler.batches(), vec![vec![0], vec![1, 2, 3]]);

    cancel.cancel();
    run.await.unwrap().unwrap();
}

#[tokio::test(flavor = "multi_thread")]
async fn cancellation_waits_for_batch_in_flight() {
    let handler = GatedHandler::new(0);
    let (_tx, rx) = mpsc::channel::<u32>(8);
    let cancel = CancellationToken::new();
    let el = EventLoop::new(rx, handler.clone(), Arc::new(Fixed(Ok(vec![1]))));
    let mut run = tokio::spawn(el.start(cancel.clone()));

    eventually("first batch", || handler.batches().len() == 1).await;
    cancel.cancel();
    assert!(tokio::time::timeout(Duration::from_millis(50), &mut run).await.is_err(), "loop returned while a batch was in flight");

    handler.gate.add_permits(1);
    tokio::time::timeout(Duration::from_secs(2), run).await.unwrap().unwrap().unwrap();
}

#[tokio::test(flavor = "multi_thread")]
async fn first_batch_failure_is_terminal() {
    let handler = GatedHandler::new(10);
    let (_tx, rx) = mpsc::channel::<u32>(8);
    let el = EventLoop::new(rx, handler.clone(), Arc::new(Fixed(Err("list gateways: forbidden"))));

    let err = el.start(CancellationToken::new()).await.unwrap_err();
    assert!(matches!(err, EventLoopError::PrepareFirstBatch(_)));
    assert!(handler.batches().is_empty());
}

#[tokio::test(flavor = "multi_thread")]
async fn closed_channel_drains_pending_events() {
    let handler = GatedHandler::new(100);
    let (tx, rx) = mpsc::channel::<u32>(8);
    let el = EventLoop::new(rx, handler.clone(), Arc::new(Fixed(Ok(vec![0]))));
    for e in 1..=4 {
        tx.send(e).await.unwrap();
    }
    drop(tx);

    tokio::time::timeout(Duration::from_secs(2), el.start(CancellationToken::new())).await.unwrap().unwrap();
    let mut seen: Vec<u32> = handler.batches().into_iter().flatten().collect();
    seen.sort_unstable();
    assert_eq!(seen, vec![0, 1, 2, 3, 4]);
    assert_eq!(handler.batches()[0], vec![0]);
}
