//! Port for pushing data into running flow transactions from outside the
//! engine.
//!
//! Publishes for the same transaction are serialized so their emission order
//! is preserved; publishes for different transactions never wait on each
//! other.

use crate::domain::flow_trans::FlowTransId;
use crate::error::FlowError;
use async_trait::async_trait;
use dashmap::DashMap;
use std::sync::{Arc, RwLock};
use tokio::sync::Mutex;

/// Receives batches injected through an [`InterStream`]
#[async_trait]
pub trait InterStreamHandler<T>: Send + Sync {
    /// Process one batch published for the given transaction
    async fn on_publish(&self, records: Vec<T>, trans_id: FlowTransId) -> Result<(), FlowError>;
}

/// External-injection surface of the engine.
///
/// A single handler is registered by the runtime; `publish` hands records to
/// it under a per-transaction gate.
pub struct InterStream<T> {
    handler: RwLock<Option<Arc<dyn InterStreamHandler<T>>>>,
    gates: DashMap<FlowTransId, Arc<Mutex<()>>>,
}

impl<T: Send + 'static> InterStream<T> {
    pub fn new() -> Self {
        Self {
            handler: RwLock::new(None),
            gates: DashMap::new(),
        }
    }

    /// Install the handler, replacing any previous one
    pub fn register(&self, handler: Arc<dyn InterStreamHandler<T>>) {
        if let Ok(mut slot) = self.handler.write() {
            *slot = Some(handler);
        }
    }

    /// Whether a handler is currently installed
    pub fn is_registered(&self) -> bool {
        self.handler
            .read()
            .map(|slot| slot.is_some())
            .unwrap_or(false)
    }

    /// Publish one record for a transaction
    pub async fn publish(&self, record: T, trans_id: &FlowTransId) -> Result<(), FlowError> {
        self.publish_batch(vec![record], trans_id).await
    }

    /// Publish a batch for a transaction.
    ///
    /// The whole batch is handed to the handler in one call so it lands in
    /// the same processing round.
    pub async fn publish_batch(&self, records: Vec<T>, trans_id: &FlowTransId) -> Result<(), FlowError> {
        let handler = {
            let slot = self.handler.read().map_err(|_| {
                FlowError::FlowExecutionError("inter-stream handler lock poisoned".to_string())
            })?;
            slot.clone().ok_or_else(|| {
                FlowError::FlowExecutionError(
                    "inter-stream publish before a handler was registered".to_string(),
                )
            })?
        };

        let gate = self
            .gates
            .entry(trans_id.clone())
            .or_insert_with(|| Arc::new(Mutex::new(())))
            .clone();
        let _guard = gate.lock().await;
        handler.on_publish(records, trans_id.clone()).await
    }

    /// Drop the serialization gate of a finished transaction
    pub fn forget(&self, trans_id: &FlowTransId) {
        self.gates.remove(trans_id);
    }
}

impl<T: Send + 'static> Default for InterStream<T> {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Mutex as StdMutex;
    use std::time::Duration;
    use tokio::sync::Barrier;
    use tokio::time::timeout;

    struct RecordingHandler {
        seen: StdMutex<Vec<(FlowTransId, Vec<u32>)>>,
        delay_first: Duration,
    }

    impl RecordingHandler {
        fn new(delay_first: Duration) -> Arc<Self> {
            Arc::new(Self {
                seen: StdMutex::new(Vec::new()),
                delay_first,
            })
        }
    }

    #[async_trait]
    impl InterStreamHandler<u32> for RecordingHandler {
        async fn on_publish(&self, records: Vec<u32>, trans_id: FlowTransId) -> Result<(), FlowError> {
            let first = self.seen.lock().unwrap().is_empty();
            if first {
                tokio::time::sleep(self.delay_first).await;
            }
            self.seen.lock().unwrap().push((trans_id, records));
            Ok(())
        }
    }

    struct BarrierHandler {
        barrier: Barrier,
    }

    #[async_trait]
    impl InterStreamHandler<u32> for BarrierHandler {
        async fn on_publish(&self, _records: Vec<u32>, _trans_id: FlowTransId) -> Result<(), FlowError> {
            self.barrier.wait().await;
            Ok(())
        }
    }

    #[tokio::test]
    async fn test_publish_without_handler_fails() {
        let stream: InterStream<u32> = InterStream::new();
        let trans_id = FlowTransId::generate();

        let err = stream.publish(1, &trans_id).await.unwrap_err();
        assert!(matches!(err, FlowError::FlowExecutionError(_)));
    }

    #[tokio::test]
    async fn test_publish_routes_batch_to_handler() {
        let stream: InterStream<u32> = InterStream::new();
        let handler = RecordingHandler::new(Duration::ZERO);
        stream.register(handler.clone());

        let trans_id = FlowTransId::generate();
        stream.publish_batch(vec![1, 2, 3], &trans_id).await.unwrap();

        let seen = handler.seen.lock().unwrap();
        assert_eq!(seen.len(), 1);
        assert_eq!(seen[0].0, trans_id);
        assert_eq!(seen[0].1, vec![1, 2, 3]);
    }

    #[tokio::test]
    async fn test_same_trans_publishes_keep_order() {
        let stream = Arc::new(InterStream::new());
        // The first delivery sleeps; a later publish for the same trans must
        // still land after it.
        let handler = RecordingHandler::new(Duration::from_millis(30));
        stream.register(handler.clone());

        let trans_id = FlowTransId::generate();
        let first = {
            let stream = stream.clone();
            let trans_id = trans_id.clone();
            tokio::spawn(async move { stream.publish(1, &trans_id).await })
        };
        tokio::time::sleep(Duration::from_millis(5)).await;
        let second = {
            let stream = stream.clone();
            let trans_id = trans_id.clone();
            tokio::spawn(async move { stream.publish(2, &trans_id).await })
        };

        first.await.unwrap().unwrap();
        second.await.unwrap().unwrap();

        let seen = handler.seen.lock().unwrap();
        assert_eq!(seen[0].1, vec![1]);
        assert_eq!(seen[1].1, vec![2]);
    }

    #[tokio::test]
    async fn test_different_trans_publishes_run_concurrently() {
        let stream = Arc::new(InterStream::new());
        // Both publishes must be inside the handler at once to pass the
        // barrier; serialization across transactions would deadlock here.
        stream.register(Arc::new(BarrierHandler {
            barrier: Barrier::new(2),
        }));

        let trans_a = FlowTransId::generate();
        let trans_b = FlowTransId::generate();

        let a = {
            let stream = stream.clone();
            tokio::spawn(async move { stream.publish(1, &trans_a).await })
        };
        let b = {
            let stream = stream.clone();
            tokio::spawn(async move { stream.publish(2, &trans_b).await })
        };

        let joined = timeout(Duration::from_secs(1), async {
            a.await.unwrap().unwrap();
            b.await.unwrap().unwrap();
        })
        .await;
        assert!(joined.is_ok(), "cross-trans publishes must not serialize");
    }

    #[tokio::test]
    async fn test_forget_drops_gate() {
        let stream: InterStream<u32> = InterStream::new();
        stream.register(RecordingHandler::new(Duration::ZERO));

        let trans_id = FlowTransId::generate();
        stream.publish(1, &trans_id).await.unwrap();
        assert_eq!(stream.gates.len(), 1);

        stream.forget(&trans_id);
        assert!(stream.gates.is_empty());
    }
}
