use std::collections::HashMap;
use std::sync::Arc;
use tokio::sync::RwLock;
use tracing::debug;
use async_trait::async_trait;
use chrono::{DateTime, Utc};

use sluice_core::domain::lock::{FlowLockRecord, FlowLockRepository};
use sluice_core::domain::retry::{FlowRetryRecord, FlowRetryRepository};
use sluice_core::FlowError;

/// In-memory implementation of the FlowLockRepository
///
/// The whole conditional acquire runs under one write guard, so two clients
/// racing for the same key see a consistent winner.
pub struct InMemoryFlowLockRepository {
    locks: Arc<RwLock<HashMap<String, FlowLockRecord>>>,
}

impl InMemoryFlowLockRepository {
    /// Create a new in-memory lock repository over shared storage
    pub fn new(locks: Arc<RwLock<HashMap<String, FlowLockRecord>>>) -> Self {
        Self { locks }
    }
}

#[async_trait]
impl FlowLockRepository for InMemoryFlowLockRepository {
    async fn try_lock(&self, record: &FlowLockRecord) -> Result<bool, FlowError> {
        let mut locks = self.locks.write().await;
        let now = Utc::now();

        match locks.get(&record.lock_key) {
            Some(existing)
                if !existing.is_expired_at(now)
                    && existing.locked_client != record.locked_client =>
            {
                Ok(false)
            }
            Some(existing) if existing.is_expired_at(now) => {
                debug!(
                    lock_key = %record.lock_key,
                    previous_client = %existing.locked_client,
                    "taking over expired lock"
                );
                locks.insert(record.lock_key.clone(), record.clone());
                Ok(true)
            }
            _ => {
                locks.insert(record.lock_key.clone(), record.clone());
                Ok(true)
            }
        }
    }

    async fn refresh(
        &self,
        lock_key: &str,
        client: &str,
        expire_at: DateTime<Utc>,
    ) -> Result<bool, FlowError> {
        let mut locks = self.locks.write().await;
        match locks.get_mut(lock_key) {
            Some(record) if record.locked_client == client => {
                record.expire_at = expire_at;
                Ok(true)
            }
            _ => Ok(false),
        }
    }

    async fn unlock(&self, lock_key: &str, client: &str) -> Result<bool, FlowError> {
        let mut locks = self.locks.write().await;
        match locks.get(lock_key) {
            Some(record) if record.locked_client == client => {
                locks.remove(lock_key);
                Ok(true)
            }
            _ => Ok(false),
        }
    }

    async fn find_by_key(&self, lock_key: &str) -> Result<Option<FlowLockRecord>, FlowError> {
        let locks = self.locks.read().await;
        Ok(locks.get(lock_key).cloned())
    }

    async fn delete_expired(
        &self,
        cutoff: DateTime<Utc>,
    ) -> Result<Vec<FlowLockRecord>, FlowError> {
        let mut locks = self.locks.write().await;
        let stale_keys: Vec<String> = locks
            .iter()
            .filter(|(_, record)| record.expire_at <= cutoff)
            .map(|(key, _)| key.clone())
            .collect();

        let mut reclaimed = Vec::with_capacity(stale_keys.len());
        for key in stale_keys {
            if let Some(record) = locks.remove(&key) {
                reclaimed.push(record);
            }
        }
        Ok(reclaimed)
    }
}

/// In-memory implementation of the FlowRetryRepository
pub struct InMemoryFlowRetryRepository {
    retries: Arc<RwLock<HashMap<String, FlowRetryRecord>>>,
}

impl InMemoryFlowRetryRepository {
    /// Create a new in-memory retry repository over shared storage
    pub fn new(retries: Arc<RwLock<HashMap<String, FlowRetryRecord>>>) -> Self {
        Self { retries }
    }
}

#[async_trait]
impl FlowRetryRepository for InMemoryFlowRetryRepository {
    async fn save(&self, record: &FlowRetryRecord) -> Result<(), FlowError> {
        let mut retries = self.retries.write().await;
        retries.insert(record.entity_id.clone(), record.clone());
        Ok(())
    }

    async fn find_by_entity_id(
        &self,
        entity_id: &str,
    ) -> Result<Option<FlowRetryRecord>, FlowError> {
        let retries = self.retries.read().await;
        Ok(retries.get(entity_id).cloned())
    }

    async fn find_due(
        &self,
        now: DateTime<Utc>,
        limit: usize,
    ) -> Result<Vec<FlowRetryRecord>, FlowError> {
        let retries = self.retries.read().await;
        let mut due: Vec<FlowRetryRecord> = retries
            .values()
            .filter(|record| record.is_due_at(now))
            .cloned()
            .collect();
        due.sort_by_key(|record| record.next_retry_time);
        due.truncate(limit);
        Ok(due)
    }

    async fn update_versioned(
        &self,
        record: &FlowRetryRecord,
        expected_version: i32,
    ) -> Result<bool, FlowError> {
        let mut retries = self.retries.write().await;
        match retries.get(&record.entity_id) {
            Some(existing) if existing.version == expected_version => {
                retries.insert(record.entity_id.clone(), record.clone());
                Ok(true)
            }
            _ => Ok(false),
        }
    }

    async fn delete(&self, entity_id: &str) -> Result<(), FlowError> {
        let mut retries = self.retries.write().await;
        retries.remove(entity_id);
        Ok(())
    }
}
