//! Environment setup builders for testing the Sluice engine.
//!
//! This module provides builder patterns for setting up test environments,
//! such as a flow runtime wired against in-memory state stores.

mod test_runtime;

// Re-export all builders for easy access
pub use test_runtime::*;
