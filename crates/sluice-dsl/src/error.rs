use crate::validation::ValidationError;
use thiserror::Error;

/// All possible errors that can occur while processing a flow graph
#[derive(Error, Debug)]
pub enum GraphError {
    /// Errors that occur during JSON parsing
    #[error("JSON parsing error: {0}")]
    JsonError(#[from] serde_json::Error),

    /// A validation rule was violated
    #[error("Validation error: {0}")]
    ValidationError(#[from] ValidationError),

    /// A shape carried a type tag the parser has no handler for
    #[error("Unknown shape type: {0}")]
    UnknownShapeType(String),

    /// An event named a shape the graph never declares
    #[error("Event '{event}' references undeclared shape: {shape}")]
    UndeclaredShapeReference {
        /// The event shape carrying the reference
        event: String,
        /// The missing shape id
        shape: String,
    },

    /// Missing required field
    #[error("Missing required field: {0}")]
    MissingRequiredField(String),

    /// Internal error
    #[error("Internal error: {0}")]
    InternalError(String),
}

impl GraphError {
    /// Get the error code for this error
    pub fn error_code(&self) -> &'static str {
        match self {
            GraphError::JsonError(_) => "ERR_GRAPH_JSON_PARSE",
            GraphError::ValidationError(err) => err.code,
            GraphError::UnknownShapeType(_) => "ERR_GRAPH_UNKNOWN_SHAPE",
            GraphError::UndeclaredShapeReference { .. } => "ERR_GRAPH_UNDECLARED_SHAPE",
            GraphError::MissingRequiredField(_) => "ERR_GRAPH_MISSING_FIELD",
            GraphError::InternalError(_) => "ERR_GRAPH_INTERNAL",
        }
    }
}
