//! In-memory state store implementation for the Sluice flow engine
//!
//! This crate provides in-memory implementations of the repository
//! interfaces defined in the sluice-core crate. It is primarily useful for
//! development, testing, and single-process deployments where persistence
//! is not required.

use std::collections::HashMap;
use std::sync::Arc;
use tokio::sync::RwLock;

pub mod repositories;
pub use repositories::{InMemoryFlowLockRepository, InMemoryFlowRetryRepository};

use sluice_core::domain::lock::{FlowLockRecord, FlowLockRepository};
use sluice_core::domain::retry::{FlowRetryRecord, FlowRetryRepository};

/// Provider for in-memory state store repositories
pub struct InMemoryStateStoreProvider {
    // Shared storage for lock records, keyed by lock key
    locks: Arc<RwLock<HashMap<String, FlowLockRecord>>>,

    // Shared storage for retry records, keyed by entity id
    retries: Arc<RwLock<HashMap<String, FlowRetryRecord>>>,
}

impl InMemoryStateStoreProvider {
    /// Create a new in-memory state store provider
    pub fn new() -> Self {
        Self {
            locks: Arc::new(RwLock::new(HashMap::new())),
            retries: Arc::new(RwLock::new(HashMap::new())),
        }
    }

    /// Create repositories for wiring into a FlowRuntime
    pub fn create_repositories(
        &self,
    ) -> (Arc<dyn FlowLockRepository>, Arc<dyn FlowRetryRepository>) {
        let lock_repo = Arc::new(InMemoryFlowLockRepository::new(self.locks.clone()));
        let retry_repo = Arc::new(InMemoryFlowRetryRepository::new(self.retries.clone()));
        (lock_repo, retry_repo)
    }
}

impl Default for InMemoryStateStoreProvider {
    fn default() -> Self {
        Self::new()
    }
}
