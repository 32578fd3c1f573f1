//! Scripted task handler implementation for testing.

use async_trait::async_trait;
use parking_lot::Mutex;
use sluice_core::{FlowData, FlowError, TaskHandler};
use std::collections::HashMap;

/// One recorded fitable invocation
#[derive(Debug, Clone)]
pub struct TaskInvocation {
    /// The fitable that was invoked
    pub fitable_id: String,

    /// The records the fitable was handed
    pub records: Vec<FlowData>,
}

/// How a scripted fitable fails
struct FailurePlan {
    error: FlowError,
    // None fails every invocation; Some(n) fails the next n then succeeds
    remaining: Option<usize>,
}

/// A task handler whose fitables can be scripted per test.
///
/// Every invocation is recorded, successful or not. By default a fitable
/// passes its records through unchanged; tests can script a fixed output or
/// a failure per fitable ID.
pub struct ScriptedTaskHandler {
    invocations: Mutex<Vec<TaskInvocation>>,
    outputs: Mutex<HashMap<String, serde_json::Value>>,
    failures: Mutex<HashMap<String, FailurePlan>>,
}

impl ScriptedTaskHandler {
    /// Create a new ScriptedTaskHandler with no scripted behavior
    pub fn new() -> Self {
        Self {
            invocations: Mutex::new(Vec::new()),
            outputs: Mutex::new(HashMap::new()),
            failures: Mutex::new(HashMap::new()),
        }
    }

    /// Script a fixed output for a fitable. Each input record is replaced
    /// by a copy of the given value, preserving batch size.
    pub fn set_output(&self, fitable_id: &str, output: serde_json::Value) {
        self.outputs.lock().insert(fitable_id.to_string(), output);
    }

    /// Script a fitable to fail every invocation with the given error
    pub fn fail_always(&self, fitable_id: &str, error: FlowError) {
        self.failures.lock().insert(
            fitable_id.to_string(),
            FailurePlan {
                error,
                remaining: None,
            },
        );
    }

    /// Script a fitable to fail its next `times` invocations with the
    /// given error, then succeed
    pub fn fail_times(&self, fitable_id: &str, times: usize, error: FlowError) {
        self.failures.lock().insert(
            fitable_id.to_string(),
            FailurePlan {
                error,
                remaining: Some(times),
            },
        );
    }

    /// Get a list of all recorded invocations
    pub fn get_invocations(&self) -> Vec<TaskInvocation> {
        self.invocations.lock().clone()
    }

    /// How many times a fitable was invoked
    pub fn invocation_count(&self, fitable_id: &str) -> usize {
        self.invocations
            .lock()
            .iter()
            .filter(|invocation| invocation.fitable_id == fitable_id)
            .count()
    }

    /// Clear the list of recorded invocations
    pub fn clear_invocations(&self) {
        self.invocations.lock().clear();
    }

    fn next_planned_failure(&self, fitable_id: &str) -> Option<FlowError> {
        let mut failures = self.failures.lock();
        let mut plan = failures.remove(fitable_id)?;
        match plan.remaining {
            None => {
                let error = plan.error.clone();
                failures.insert(fitable_id.to_string(), plan);
                Some(error)
            }
            Some(n) if n > 0 => {
                let error = plan.error.clone();
                if n > 1 {
                    plan.remaining = Some(n - 1);
                    failures.insert(fitable_id.to_string(), plan);
                }
                Some(error)
            }
            Some(_) => None,
        }
    }
}

impl Default for ScriptedTaskHandler {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl TaskHandler for ScriptedTaskHandler {
    async fn handle_task(
        &self,
        fitable_id: &str,
        records: Vec<FlowData>,
    ) -> Result<Vec<FlowData>, FlowError> {
        self.invocations.lock().push(TaskInvocation {
            fitable_id: fitable_id.to_string(),
            records: records.clone(),
        });

        if let Some(error) = self.next_planned_failure(fitable_id) {
            return Err(error);
        }

        let outputs = self.outputs.lock();
        if let Some(output) = outputs.get(fitable_id) {
            return Ok(records
                .iter()
                .map(|_| FlowData::new(output.clone()))
                .collect());
        }
        Ok(records)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[tokio::test]
    async fn test_passes_records_through_by_default() {
        let handler = ScriptedTaskHandler::new();
        let records = vec![FlowData::new(json!({"k": 1}))];

        let outputs = handler.handle_task("fit.a", records.clone()).await.unwrap();
        assert_eq!(outputs, records);
        assert_eq!(handler.invocation_count("fit.a"), 1);
    }

    #[tokio::test]
    async fn test_scripted_output_replaces_each_record() {
        let handler = ScriptedTaskHandler::new();
        handler.set_output("fit.a", json!({"tagged": true}));

        let records = vec![FlowData::new(json!(1)), FlowData::new(json!(2))];
        let outputs = handler.handle_task("fit.a", records).await.unwrap();

        assert_eq!(outputs.len(), 2);
        for output in outputs {
            assert_eq!(output.as_value(), &json!({"tagged": true}));
        }
    }

    #[tokio::test]
    async fn test_fail_times_then_succeed() {
        let handler = ScriptedTaskHandler::new();
        handler.fail_times(
            "fit.a",
            2,
            FlowError::ExternalDependencyError("down".to_string()),
        );

        let records = vec![FlowData::null()];
        assert!(handler.handle_task("fit.a", records.clone()).await.is_err());
        assert!(handler.handle_task("fit.a", records.clone()).await.is_err());
        assert!(handler.handle_task("fit.a", records).await.is_ok());
        assert_eq!(handler.invocation_count("fit.a"), 3);
    }

    #[tokio::test]
    async fn test_fail_always_never_recovers() {
        let handler = ScriptedTaskHandler::new();
        handler.fail_always("fit.a", FlowError::FitableError("broken".to_string()));

        let records = vec![FlowData::null()];
        for _ in 0..3 {
            assert!(handler.handle_task("fit.a", records.clone()).await.is_err());
        }

        // Other fitables are unaffected.
        assert!(handler.handle_task("fit.b", records).await.is_ok());
    }
}
