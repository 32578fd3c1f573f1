use thiserror::Error;

/// Core error type for the Sluice engine
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum FlowError {
    /// Flow definition not found
    #[error("Flow definition not found: {0}")]
    DefinitionNotFound(String),

    /// Flow trans not found
    #[error("Flow trans not found: {0}")]
    TransNotFound(String),

    /// Node not found in the flow graph
    #[error("Node not found: {0}")]
    NodeNotFound(String),

    /// Invalid flow parameter (structural rule violated)
    #[error("Invalid flow parameter: {0}")]
    InvalidFlowParam(String),

    /// Fitable invocation error
    #[error("Fitable invocation error: {0}")]
    FitableError(String),

    /// External dependency error (retryable)
    #[error("External dependency error: {0}")]
    ExternalDependencyError(String),

    /// Condition evaluation error
    #[error("Condition evaluation error: {0}")]
    ConditionEvaluationError(String),

    /// Context lifecycle error
    #[error("Context state error: {0}")]
    ContextStateError(String),

    /// Manual task error
    #[error("Manual task error: {0}")]
    TaskError(String),

    /// Lock is held by another client
    #[error("Lock is held by another client: {0}")]
    Locked(String),

    /// Lock was reclaimed while held
    #[error("Lock invalidated: {0}")]
    LockInvalidated(String),

    /// State store error
    #[error("State store error: {0}")]
    StateStoreError(String),

    /// Optimistic-concurrency conflict on a persisted record
    #[error("Version conflict: {0}")]
    VersionConflict(String),

    /// Retry budget exhausted
    #[error("Retry exhausted: {0}")]
    RetryExhausted(String),

    /// Stream channel closed
    #[error("Stream closed: {0}")]
    StreamClosed(String),

    /// Serialization error
    #[error("Serialization error: {0}")]
    SerializationError(String),

    /// Flow execution error
    #[error("Flow execution error: {0}")]
    FlowExecutionError(String),

    /// Generic error
    #[error("{0}")]
    Other(String),
}

impl FlowError {
    /// Whether a failed execution should go through the retry scheduler.
    /// Only dependency-style failures qualify; everything else is terminal
    /// for the affected contexts.
    pub fn is_retryable(&self) -> bool {
        matches!(self, FlowError::ExternalDependencyError(_))
    }
}

impl From<serde_json::Error> for FlowError {
    fn from(err: serde_json::Error) -> Self {
        FlowError::SerializationError(err.to_string())
    }
}

impl From<String> for FlowError {
    fn from(err: String) -> Self {
        FlowError::Other(err)
    }
}

impl From<&str> for FlowError {
    fn from(err: &str) -> Self {
        FlowError::Other(err.to_string())
    }
}
