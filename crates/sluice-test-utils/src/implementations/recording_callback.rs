//! Completion callback implementation that records what it receives.

use async_trait::async_trait;
use parking_lot::Mutex;
use sluice_core::{FlowCompletionCallback, FlowTransCompletionInfo, FlowTransId};
use tokio::sync::Notify;

/// A completion callback that records every completion notification.
///
/// Tests register one with the runtime, drive a flow, then either poll
/// [`get_completions`](Self::get_completions) or await
/// [`wait_for_completions`](Self::wait_for_completions), usually under
/// `tokio::time::timeout`.
pub struct RecordingCompletionCallback {
    completions: Mutex<Vec<FlowTransCompletionInfo>>,
    notify: Notify,
}

impl RecordingCompletionCallback {
    /// Create a new RecordingCompletionCallback
    pub fn new() -> Self {
        Self {
            completions: Mutex::new(Vec::new()),
            notify: Notify::new(),
        }
    }

    /// Get a list of all recorded completions
    pub fn get_completions(&self) -> Vec<FlowTransCompletionInfo> {
        self.completions.lock().clone()
    }

    /// How many completions were recorded
    pub fn completion_count(&self) -> usize {
        self.completions.lock().len()
    }

    /// The recorded completion of one trans, if it finished
    pub fn completion_for(&self, trans_id: &FlowTransId) -> Option<FlowTransCompletionInfo> {
        self.completions
            .lock()
            .iter()
            .find(|info| &info.trans().id == trans_id)
            .cloned()
    }

    /// Clear the list of recorded completions
    pub fn clear_completions(&self) {
        self.completions.lock().clear();
    }

    /// Wait until at least `count` completions have been recorded
    pub async fn wait_for_completions(&self, count: usize) {
        loop {
            let notified = self.notify.notified();
            if self.completions.lock().len() >= count {
                return;
            }
            notified.await;
        }
    }
}

impl Default for RecordingCompletionCallback {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl FlowCompletionCallback for RecordingCompletionCallback {
    async fn on_flow_trans_completed(&self, info: FlowTransCompletionInfo) {
        self.completions.lock().push(info);
        self.notify.notify_waiters();
    }
}
