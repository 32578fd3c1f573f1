//!
//! Sluice Core - Core runtime for the Sluice flow engine
//!
//! This crate defines the flow graph model, the reactive stream runtime,
//! and the services that drive offered data through deployed flows. It is
//! the foundation for all other crates in the engine.

#![forbid(unsafe_code)]
#![warn(missing_docs)]

/// Domain layer - flow graphs, transactions, contexts, and rules
pub mod domain;

/// Application services - execution, locking, retry, completion
pub mod application;

/// Reactive stream primitives
pub mod stream;

/// Core data types
pub mod types;

/// Error types
pub mod error;

// Re-export key types
pub use error::FlowError;
pub use types::FlowData;

// Graph model
pub use domain::flow_graph::{
    EventId, FilterKind, FlowDefinition, FlowEvent, FlowFilter, FlowId, FlowJober, FlowNode,
    FlowTask, JoberKind, NodeId, NodeKind, TaskKind,
};
pub use domain::flow_trans::{FlowTrans, FlowTransId};
pub use domain::flow_context::{ContextErrorInfo, ContextStatus, FlowContext};
pub use domain::condition::{ConditionEvaluator, JmespathConditionEvaluator};

// Repository seams
pub use domain::lock::{FlowLockRecord, FlowLockRepository};
pub use domain::retry::{FlowRetryRecord, FlowRetryRepository, RetryPolicy, RETRY_ENTITY_JOBER_BATCH};

// Main engine API
pub use application::completion::{FlowCompletionCallback, FlowTransCompletionInfo};
pub use application::flow_runtime::{FlowOffer, FlowRuntime, Operator, PendingTask, RuntimeConfig};
pub use application::lock_service::{FlowLockService, LockConfig};
pub use application::node_executor::{EchoTaskHandler, TaskHandler, TaskHandlerRegistry};
pub use application::retry_scheduler::{RetryConfig, RetryScheduler};
pub use stream::inter_stream::{InterStream, InterStreamHandler};
pub use stream::{Publisher, StreamOutcome, Subscriber, Subscription};
