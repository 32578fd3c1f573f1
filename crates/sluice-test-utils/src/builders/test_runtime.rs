//! TestRuntime builder and handles for integration testing.

use crate::implementations::{RecordingCompletionCallback, ScriptedTaskHandler};
use sluice_core::{
    ConditionEvaluator, FlowError, FlowId, FlowRuntime, JmespathConditionEvaluator, LockConfig,
    RetryConfig, RuntimeConfig, TaskHandler,
};
use sluice_dsl::{parse_and_validate_flow_graph, GraphError};
use std::fmt;
use std::sync::Arc;
use thiserror::Error;

/// Error type for test runtime assembly
#[derive(Debug, Error)]
pub enum TestRuntimeError {
    #[error("Graph error: {0}")]
    Graph(#[from] GraphError),
    #[error("Flow error: {0}")]
    Flow(#[from] FlowError),
}

/// Builder for a flow runtime wired against in-memory state stores.
///
/// By default the runtime gets a [`ScriptedTaskHandler`], a JMESPath
/// condition evaluator, and a pre-registered
/// [`RecordingCompletionCallback`]; graphs queued with
/// [`with_graph`](Self::with_graph) are parsed, validated, and deployed
/// during [`build`](Self::build).
#[derive(Default)]
pub struct TestRuntimeBuilder {
    task_handler: Option<Arc<dyn TaskHandler>>,
    condition_evaluator: Option<Arc<dyn ConditionEvaluator>>,
    config: Option<RuntimeConfig>,
    graphs: Vec<String>,
}

impl fmt::Debug for TestRuntimeBuilder {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("TestRuntimeBuilder")
            .field("graphs", &self.graphs.len())
            .finish_non_exhaustive()
    }
}

impl TestRuntimeBuilder {
    /// Creates a new TestRuntimeBuilder with default configuration.
    pub fn new() -> Self {
        Self::default()
    }

    /// Sets the task handler implementation to use.
    pub fn with_task_handler(mut self, handler: Arc<dyn TaskHandler>) -> Self {
        self.task_handler = Some(handler);
        self
    }

    /// Sets the condition evaluator implementation to use.
    pub fn with_condition_evaluator(mut self, evaluator: Arc<dyn ConditionEvaluator>) -> Self {
        self.condition_evaluator = Some(evaluator);
        self
    }

    /// Overrides the whole runtime configuration.
    pub fn with_config(mut self, config: RuntimeConfig) -> Self {
        self.config = Some(config);
        self
    }

    /// Overrides the lock configuration.
    pub fn with_lock_config(mut self, lock: LockConfig) -> Self {
        let mut config = self.config.take().unwrap_or_default();
        config.lock = lock;
        self.config = Some(config);
        self
    }

    /// Overrides the retry configuration.
    pub fn with_retry_config(mut self, retry: RetryConfig) -> Self {
        let mut config = self.config.take().unwrap_or_default();
        config.retry = retry;
        self.config = Some(config);
        self
    }

    /// Queues a raw graph document for deployment at build time.
    pub fn with_graph(mut self, raw_graph: &str) -> Self {
        self.graphs.push(raw_graph.to_string());
        self
    }

    /// Builds the runtime and returns handles to interact with it.
    pub fn build(self) -> Result<TestRuntime, TestRuntimeError> {
        let (task_handler, scripted_handler): (
            Arc<dyn TaskHandler>,
            Option<Arc<ScriptedTaskHandler>>,
        ) = match self.task_handler {
            Some(handler) => (handler, None),
            None => {
                let scripted = Arc::new(ScriptedTaskHandler::new());
                (scripted.clone(), Some(scripted))
            }
        };

        let condition_evaluator = self
            .condition_evaluator
            .unwrap_or_else(|| Arc::new(JmespathConditionEvaluator::new()));

        let provider = sluice_state_inmemory::InMemoryStateStoreProvider::new();
        let (lock_repo, retry_repo) = provider.create_repositories();

        let runtime = FlowRuntime::new(
            task_handler,
            condition_evaluator,
            lock_repo,
            retry_repo,
            self.config.unwrap_or_default(),
        );

        let completion_callback = Arc::new(RecordingCompletionCallback::new());
        runtime.register_completion_callback(completion_callback.clone());

        let mut deployed_flows = Vec::with_capacity(self.graphs.len());
        for raw_graph in &self.graphs {
            let definition = parse_and_validate_flow_graph(raw_graph)?;
            deployed_flows.push(definition.id.clone());
            runtime.deploy(definition)?;
        }

        Ok(TestRuntime {
            runtime,
            scripted_handler,
            completion_callback,
            deployed_flows,
        })
    }
}

/// Handles for interacting with a built test runtime
pub struct TestRuntime {
    /// The runtime under test.
    pub runtime: Arc<FlowRuntime>,

    /// The scripted handler wired into the runtime, present unless a
    /// custom task handler was supplied.
    pub scripted_handler: Option<Arc<ScriptedTaskHandler>>,

    /// Recording callback registered with the runtime before any flow ran.
    pub completion_callback: Arc<RecordingCompletionCallback>,

    /// IDs of the graphs deployed at build time, in queue order.
    pub deployed_flows: Vec<FlowId>,
}

impl fmt::Debug for TestRuntime {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("TestRuntime")
            .field("deployed_flows", &self.deployed_flows)
            .finish_non_exhaustive()
    }
}

impl TestRuntime {
    /// The scripted handler, panicking when a custom handler was supplied.
    ///
    /// Test-only convenience; use the `scripted_handler` field directly
    /// when a custom handler may be present.
    pub fn scripted(&self) -> &Arc<ScriptedTaskHandler> {
        self.scripted_handler
            .as_ref()
            .expect("runtime was built with a custom task handler")
    }
}
