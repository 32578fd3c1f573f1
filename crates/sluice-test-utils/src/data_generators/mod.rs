//! Test data generators for the Sluice flow engine.
//!
//! This module provides functions for generating test data specific to the
//! Sluice engine, such as raw graph documents in the designer's JSON format.

mod graph;

// Re-export all data generators for easy access
pub use graph::*;
