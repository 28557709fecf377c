//! Per-job broadcast of decoded agent output to live viewers.
//!
//! One `StreamBroker` exists per job. The pipeline task publishes text
//! deltas into it; any number of subscribers drain independent per-subscriber
//! queues, so a slow viewer never blocks the publisher or other viewers.
//! `close` enqueues a terminal marker for every current and future
//! subscriber, exactly once each.

use std::collections::HashMap;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use tokio::sync::mpsc;
use uuid::Uuid;

/// One update on a job's stream.
#[derive(Debug, Clone, PartialEq)]
pub enum StreamUpdate {
    /// A decoded text delta, in process-output order.
    Delta(String),
    /// Terminal marker. Nothing follows it for this subscriber.
    Done,
}

/// Result of a bounded-wait read on a subscription.
#[derive(Debug, PartialEq)]
pub enum Polled {
    Update(StreamUpdate),
    /// Nothing arrived within the bound. The connection-level keep-alive
    /// fires on this.
    Idle,
}

#[derive(Default)]
struct BrokerInner {
    subscribers: Vec<mpsc::UnboundedSender<StreamUpdate>>,
    closed: bool,
}

/// Per-job publish point. Subscribers attached after events were published
/// only see events from their attach point forward; there is no replay
/// buffer.
#[derive(Default)]
pub struct StreamBroker {
    inner: Mutex<BrokerInner>,
}

impl StreamBroker {
    pub fn new() -> Self {
        Self::default()
    }

    /// Append a delta and hand it to every current subscriber. No-op after
    /// `close`. Never blocks on slow subscribers.
    pub fn publish(&self, text: impl Into<String>) {
        let text = text.into();
        let mut inner = self.inner.lock().unwrap();
        if inner.closed {
            return;
        }
        // Detached subscribers error on send; drop them here.
        inner
            .subscribers
            .retain(|tx| tx.send(StreamUpdate::Delta(text.clone())).is_ok());
    }

    /// Attach a new independent view of the stream. After `close`, the
    /// subscription yields only the terminal marker.
    pub fn subscribe(&self) -> Subscription {
        let (tx, rx) = mpsc::unbounded_channel();
        let mut inner = self.inner.lock().unwrap();
        if inner.closed {
            let _ = tx.send(StreamUpdate::Done);
        } else {
            inner.subscribers.push(tx);
        }
        Subscription { rx }
    }

    /// Mark the stream complete. Idempotent; every existing subscriber gets
    /// the terminal marker exactly once and no event after it.
    pub fn close(&self) {
        let mut inner = self.inner.lock().unwrap();
        if inner.closed {
            return;
        }
        inner.closed = true;
        for tx in inner.subscribers.drain(..) {
            let _ = tx.send(StreamUpdate::Done);
        }
    }
}

/// One subscriber's ordered view of a job stream.
pub struct Subscription {
    rx: mpsc::UnboundedReceiver<StreamUpdate>,
}

impl Subscription {
    /// Wait for the next update. `None` only if the broker was dropped
    /// without `close` (process teardown).
    pub async fn recv(&mut self) -> Option<StreamUpdate> {
        self.rx.recv().await
    }

    /// Bounded-wait read: returns `Polled::Idle` if nothing arrives within
    /// `bound`, so callers can emit keep-alives without blocking forever.
    pub async fn recv_or_idle(&mut self, bound: Duration) -> Polled {
        match tokio::time::timeout(bound, self.rx.recv()).await {
            Ok(Some(update)) => Polled::Update(update),
            Ok(None) => Polled::Update(StreamUpdate::Done),
            Err(_) => Polled::Idle,
        }
    }
}

/// Process-wide map from job id to its broker. Entries are created at
/// submission and live as long as the job registry entry.
#[derive(Default)]
pub struct StreamHub {
    brokers: Mutex<HashMap<Uuid, Arc<StreamBroker>>>,
}

impl StreamHub {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn create(&self, job_id: Uuid) -> Arc<StreamBroker> {
        let broker = Arc::new(StreamBroker::new());
        self.brokers
            .lock()
            .unwrap()
            .insert(job_id, Arc::clone(&broker));
        broker
    }

    pub fn get(&self, job_id: Uuid) -> Option<Arc<StreamBroker>> {
        self.brokers
            .lock()
            .unwrap()
            .get(&job_id)
            .cloned()
    }
}
