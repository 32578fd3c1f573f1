//! Persisted distributed-lock records and the repository seam backing them.
//!
//! Acquisition is a conditional insert/update against the persisted key, not
//! a language-level mutex, so independent worker processes can coordinate
//! through a shared table.

use crate::error::FlowError;
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// A persisted distributed-lock record
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FlowLockRecord {
    /// The lock key, scoped to one flow instance (trans)
    pub lock_key: String,

    /// When the lock expires and may be reclaimed
    pub expire_at: DateTime<Utc>,

    /// The client currently owning the lock
    pub locked_client: String,
}

impl FlowLockRecord {
    /// Build a lock record expiring at the given time
    pub fn new(lock_key: impl Into<String>, client: impl Into<String>, expire_at: DateTime<Utc>) -> Self {
        Self {
            lock_key: lock_key.into(),
            expire_at,
            locked_client: client.into(),
        }
    }

    /// Whether the record is expired at the given instant
    pub fn is_expired_at(&self, now: DateTime<Utc>) -> bool {
        self.expire_at <= now
    }
}

/// Persistence seam for distributed-lock records
#[async_trait]
pub trait FlowLockRepository: Send + Sync {
    /// Conditionally take the lock key for a client. Succeeds when the key
    /// is free, expired, or already owned by the same client; returns
    /// whether the lock is now held.
    async fn try_lock(&self, record: &FlowLockRecord) -> Result<bool, FlowError>;

    /// Extend the expiration of a held lock. Returns false when the key is
    /// no longer owned by the client.
    async fn refresh(
        &self,
        lock_key: &str,
        client: &str,
        expire_at: DateTime<Utc>,
    ) -> Result<bool, FlowError>;

    /// Release a held lock. Releasing a key owned by another client leaves
    /// it untouched and returns false.
    async fn unlock(&self, lock_key: &str, client: &str) -> Result<bool, FlowError>;

    /// Look up a lock record by key
    async fn find_by_key(&self, lock_key: &str) -> Result<Option<FlowLockRecord>, FlowError>;

    /// Delete every lock whose expiration is at or before the cutoff,
    /// returning the reclaimed records
    async fn delete_expired(&self, cutoff: DateTime<Utc>) -> Result<Vec<FlowLockRecord>, FlowError>;
}
