//! Test implementations (fakes) of key Sluice engine interfaces.
//!
//! This module provides concrete test implementations of the engine's
//! extension traits. These implementations record what they are handed for
//! later assertions and operate entirely in-memory.

pub mod operators;
pub mod recording_callback;
pub mod scripted_task_handler;

// Re-export all implementations for easy access
pub use operators::*;
pub use recording_callback::*;
pub use scripted_task_handler::*;
