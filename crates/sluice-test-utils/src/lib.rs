//! Testing utilities for the Sluice flow engine.
//!
//! This crate provides standardized testing utilities for Sluice, including
//! test implementations (fakes) of the engine's extension traits, graph
//! document generators, assertion utilities, and a builder that wires a
//! runtime against in-memory state stores.

pub mod assertions;
pub mod builders;
pub mod data_generators;
pub mod implementations;

/// Re-export commonly used types for convenience
pub use builders::{TestRuntime, TestRuntimeBuilder};
pub use implementations::{RecordingCompletionCallback, ScriptedTaskHandler};
