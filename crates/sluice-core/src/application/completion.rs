//! Completion callbacks fired when a flow transaction finishes.

use crate::domain::flow_context::{ContextStatus, FlowContext};
use crate::domain::flow_trans::FlowTrans;
use crate::stream::StreamOutcome;
use crate::types::FlowData;
use async_trait::async_trait;
use std::sync::Arc;

/// Aggregated result of one finished flow transaction.
///
/// Carries every context the transaction produced, successes and failures
/// alike, in the order they reached a terminal state.
#[derive(Debug, Clone)]
pub struct FlowTransCompletionInfo {
    trans: FlowTrans,
    outcome: StreamOutcome<FlowContext<FlowData>>,
}

impl FlowTransCompletionInfo {
    pub fn new(trans: FlowTrans, contexts: Vec<FlowContext<FlowData>>) -> Self {
        Self {
            trans,
            outcome: StreamOutcome::new(contexts),
        }
    }

    /// The transaction this completion belongs to
    pub fn trans(&self) -> &FlowTrans {
        &self.trans
    }

    /// Every terminal context, in completion order
    pub fn get_all(&self) -> &[FlowContext<FlowData>] {
        self.outcome.get_all()
    }

    /// The latest terminal context
    pub fn get(&self) -> Option<&FlowContext<FlowData>> {
        self.outcome.get()
    }

    /// Contexts that reached the archive
    pub fn succeeded(&self) -> Vec<&FlowContext<FlowData>> {
        self.get_all()
            .iter()
            .filter(|c| c.status == ContextStatus::Archived)
            .collect()
    }

    /// Contexts that failed along the way
    pub fn failed(&self) -> Vec<&FlowContext<FlowData>> {
        self.get_all()
            .iter()
            .filter(|c| c.status == ContextStatus::Failed)
            .collect()
    }

    /// Whether the transaction finished without a single failed context
    pub fn is_success(&self) -> bool {
        !self.get_all().is_empty() && self.failed().is_empty()
    }

    /// Take ownership of the terminal contexts
    pub fn into_contexts(self) -> Vec<FlowContext<FlowData>> {
        self.outcome.into_all()
    }
}

/// Observer notified when a flow transaction completes
#[async_trait]
pub trait FlowCompletionCallback: Send + Sync {
    /// Called once per finished transaction
    async fn on_flow_trans_completed(&self, info: FlowTransCompletionInfo);
}

/// Callback that ignores completions
pub struct NoopCompletionCallback;

#[async_trait]
impl FlowCompletionCallback for NoopCompletionCallback {
    async fn on_flow_trans_completed(&self, _info: FlowTransCompletionInfo) {}
}

/// Fans a completion out to registered callbacks on spawned tasks so the
/// engine never waits on callback code.
pub struct CompletionDispatcher {
    callbacks: Vec<Arc<dyn FlowCompletionCallback>>,
}

impl CompletionDispatcher {
    pub fn new() -> Self {
        Self {
            callbacks: Vec::new(),
        }
    }

    /// Add a callback to notify on every completion
    pub fn register(&mut self, callback: Arc<dyn FlowCompletionCallback>) {
        self.callbacks.push(callback);
    }

    pub fn is_empty(&self) -> bool {
        self.callbacks.is_empty()
    }

    /// Hand the completion to every callback without awaiting any of them
    pub fn dispatch(&self, info: FlowTransCompletionInfo) {
        for callback in &self.callbacks {
            let callback = callback.clone();
            let info = info.clone();
            tokio::spawn(async move {
                callback.on_flow_trans_completed(info).await;
            });
        }
    }
}

impl Default for CompletionDispatcher {
    fn default() -> Self {
        Self::new()
    }
}
