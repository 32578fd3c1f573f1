/// Flow graph domain models
pub mod flow_graph;

/// Trans identity
pub mod flow_trans;

/// Per-datum context tracking
pub mod flow_context;

/// Condition-rule evaluation
pub mod condition;

/// Distributed-lock records and repository seam
pub mod lock;

/// Retry records, repository seam, and retry policy
pub mod retry;
