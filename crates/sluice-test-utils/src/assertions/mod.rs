//! Assertion utilities for validating Sluice engine data structures.
//!
//! This module provides helper functions for validating and asserting
//! properties of completed flow transactions, making tests more concise
//! and readable.

mod completion;

// Re-export all assertion helpers for easy access
pub use completion::*;
