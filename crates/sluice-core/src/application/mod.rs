/// Completion callbacks and the dispatcher that fans results out
pub mod completion;

/// Per-node batch execution: filters, jobers, manual tasks, event routing
pub mod node_executor;

/// Distributed lock acquisition, expiry sweeps, and invalidation
pub mod lock_service;

/// Durable retry records and the redrive sweep
pub mod retry_scheduler;

/// The engine facade and per-trans drive loops
pub mod flow_runtime;
