//! Operator implementations for resolving manual tasks in tests.

use async_trait::async_trait;
use parking_lot::Mutex;
use sluice_core::{FlowContext, FlowData, FlowError, FlowTask, Operator};

/// An operator that approves every batch it is handed, resuming the
/// contexts unchanged
pub struct ApproveAllOperator {
    operated: Mutex<Vec<(String, usize)>>,
}

impl ApproveAllOperator {
    /// Create a new ApproveAllOperator
    pub fn new() -> Self {
        Self {
            operated: Mutex::new(Vec::new()),
        }
    }

    /// Get a list of operated batches as `(task_id, batch_size)` pairs
    pub fn get_operated_batches(&self) -> Vec<(String, usize)> {
        self.operated.lock().clone()
    }
}

impl Default for ApproveAllOperator {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl Operator for ApproveAllOperator {
    async fn operate(
        &self,
        contexts: Vec<FlowContext<FlowData>>,
        task: &FlowTask,
    ) -> Result<Vec<FlowContext<FlowData>>, FlowError> {
        self.operated
            .lock()
            .push((task.task_id.clone(), contexts.len()));
        Ok(contexts)
    }
}

/// An operator that stamps a key into each context payload before
/// approving the batch.
///
/// Payloads that are not JSON objects are left untouched.
pub struct StampingOperator {
    key: String,
    value: serde_json::Value,
}

impl StampingOperator {
    /// Create an operator stamping `key` to `value` on each payload
    pub fn new(key: &str, value: serde_json::Value) -> Self {
        Self {
            key: key.to_string(),
            value,
        }
    }
}

#[async_trait]
impl Operator for StampingOperator {
    async fn operate(
        &self,
        mut contexts: Vec<FlowContext<FlowData>>,
        _task: &FlowTask,
    ) -> Result<Vec<FlowContext<FlowData>>, FlowError> {
        for context in &mut contexts {
            if let Some(payload) = context.data.as_value_mut().as_object_mut() {
                payload.insert(self.key.clone(), self.value.clone());
            }
        }
        Ok(contexts)
    }
}

/// An operator that fails every batch it is handed
pub struct FailingOperator {
    error: FlowError,
    operate_calls: Mutex<usize>,
}

impl FailingOperator {
    /// Create an operator failing with the given error
    pub fn new(error: FlowError) -> Self {
        Self {
            error,
            operate_calls: Mutex::new(0),
        }
    }

    /// How many batches were handed to this operator
    pub fn operate_calls(&self) -> usize {
        *self.operate_calls.lock()
    }
}

#[async_trait]
impl Operator for FailingOperator {
    async fn operate(
        &self,
        _contexts: Vec<FlowContext<FlowData>>,
        _task: &FlowTask,
    ) -> Result<Vec<FlowContext<FlowData>>, FlowError> {
        *self.operate_calls.lock() += 1;
        Err(self.error.clone())
    }
}
