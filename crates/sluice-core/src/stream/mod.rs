//! Minimal reactive stream primitives driving data through a flow.
//!
//! A `Publisher` pushes values into a bounded channel; a `Subscription`
//! drains them into a `Subscriber` in emission order. Completion is a
//! terminal signal a publisher emits exactly once. The channel bound is the
//! backpressure mechanism: a full channel parks `publish` until the
//! subscriber catches up.

/// External-injection port
pub mod inter_stream;

use crate::error::FlowError;
use async_trait::async_trait;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use tokio::sync::{mpsc, Mutex};

/// Default bound of a stream channel
pub const DEFAULT_STREAM_CAPACITY: usize = 64;

/// One message on a stream channel
#[derive(Debug)]
pub enum Signal<T> {
    /// The next emitted value
    Next(T),
    /// Terminal completion; nothing follows
    Complete,
}

/// The producing half of a stream
pub struct Publisher<T> {
    tx: mpsc::Sender<Signal<T>>,
    completed: Arc<AtomicBool>,
}

impl<T> Clone for Publisher<T> {
    fn clone(&self) -> Self {
        Self {
            tx: self.tx.clone(),
            completed: self.completed.clone(),
        }
    }
}

impl<T: Send> Publisher<T> {
    /// Emit one value, parking while the channel is full
    pub async fn publish(&self, item: T) -> Result<(), FlowError> {
        if self.completed.load(Ordering::SeqCst) {
            return Err(FlowError::StreamClosed(
                "publish after terminal completion".to_string(),
            ));
        }
        self.tx
            .send(Signal::Next(item))
            .await
            .map_err(|_| FlowError::StreamClosed("subscriber dropped".to_string()))
    }

    /// Emit the terminal completion. Only the first call sends the signal;
    /// repeated calls are no-ops.
    pub async fn complete(&self) -> Result<(), FlowError> {
        if self.completed.swap(true, Ordering::SeqCst) {
            return Ok(());
        }
        self.tx
            .send(Signal::Complete)
            .await
            .map_err(|_| FlowError::StreamClosed("subscriber dropped".to_string()))
    }

    /// Whether the terminal completion was already emitted
    pub fn is_completed(&self) -> bool {
        self.completed.load(Ordering::SeqCst)
    }
}

/// The consuming half of a stream
pub struct Subscription<T> {
    rx: mpsc::Receiver<Signal<T>>,
}

impl<T: Send + 'static> Subscription<T> {
    /// Receive the next signal, or `None` when every publisher is gone
    pub async fn recv(&mut self) -> Option<Signal<T>> {
        self.rx.recv().await
    }

    /// Drain the stream into a subscriber on a spawned task, preserving
    /// emission order. The task ends at the terminal signal.
    pub fn attach(mut self, subscriber: Arc<dyn Subscriber<T>>) -> tokio::task::JoinHandle<()> {
        tokio::spawn(async move {
            while let Some(signal) = self.rx.recv().await {
                match signal {
                    Signal::Next(item) => subscriber.on_next(item).await,
                    Signal::Complete => {
                        subscriber.on_complete().await;
                        break;
                    }
                }
            }
        })
    }
}

/// Receives stream emissions in order
#[async_trait]
pub trait Subscriber<T: Send + 'static>: Send + Sync {
    /// Called for every emitted value, in emission order
    async fn on_next(&self, item: T);

    /// Called once when the stream completes
    async fn on_complete(&self);
}

/// Create a bounded stream channel
pub fn channel<T: Send>(capacity: usize) -> (Publisher<T>, Subscription<T>) {
    let (tx, rx) = mpsc::channel(capacity);
    (
        Publisher {
            tx,
            completed: Arc::new(AtomicBool::new(false)),
        },
        Subscription { rx },
    )
}

/// Aggregated terminal outcome of a stream
#[derive(Debug, Clone, PartialEq)]
pub struct StreamOutcome<T> {
    items: Vec<T>,
}

impl<T> StreamOutcome<T> {
    /// Wrap the collected emissions
    pub fn new(items: Vec<T>) -> Self {
        Self { items }
    }

    /// Every value the stream emitted, in order
    pub fn get_all(&self) -> &[T] {
        &self.items
    }

    /// The latest emitted value
    pub fn get(&self) -> Option<&T> {
        self.items.last()
    }

    /// Take ownership of the collected values
    pub fn into_all(self) -> Vec<T> {
        self.items
    }
}

/// Fired exactly once when a stream reaches its terminal signal
pub trait StreamCallback<T>: Send + Sync {
    /// Receive the aggregated outcome
    fn on_completed(&self, outcome: StreamOutcome<T>);
}

/// Subscriber that collects every emission and fires a callback once on
/// completion
pub struct CollectingSubscriber<T> {
    items: Mutex<Vec<T>>,
    callback: Arc<dyn StreamCallback<T>>,
    fired: AtomicBool,
}

impl<T: Send + 'static> CollectingSubscriber<T> {
    /// Collect emissions for the given callback
    pub fn new(callback: Arc<dyn StreamCallback<T>>) -> Self {
        Self {
            items: Mutex::new(Vec::new()),
            callback,
            fired: AtomicBool::new(false),
        }
    }
}

#[async_trait]
impl<T: Send + 'static> Subscriber<T> for CollectingSubscriber<T> {
    async fn on_next(&self, item: T) {
        self.items.lock().await.push(item);
    }

    async fn on_complete(&self) {
        if self.fired.swap(true, Ordering::SeqCst) {
            return;
        }
        let items = std::mem::take(&mut *self.items.lock().await);
        self.callback.on_completed(StreamOutcome::new(items));
    }
}
