//! Persisted retry records, the repository seam backing them, and the
//! policy computing retry delays.

use crate::error::FlowError;
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::time::Duration;

/// Entity type tag for a parked jober batch awaiting re-execution
pub const RETRY_ENTITY_JOBER_BATCH: &str = "jober_batch";

/// A persisted retry record for one failed execution
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FlowRetryRecord {
    /// Identity of the failed entity (a parked batch id)
    pub entity_id: String,

    /// What kind of entity the id names
    pub entity_type: String,

    /// When the next retry attempt is due
    pub next_retry_time: DateTime<Utc>,

    /// When the last retry attempt ran, if any
    pub last_retry_time: Option<DateTime<Utc>>,

    /// How many retry attempts have run
    pub retry_count: i32,

    /// Optimistic-concurrency version
    pub version: i32,
}

impl FlowRetryRecord {
    /// Create a fresh record with zero attempts
    pub fn new(
        entity_id: impl Into<String>,
        entity_type: impl Into<String>,
        next_retry_time: DateTime<Utc>,
    ) -> Self {
        Self {
            entity_id: entity_id.into(),
            entity_type: entity_type.into(),
            next_retry_time,
            last_retry_time: None,
            retry_count: 0,
            version: 0,
        }
    }

    /// Whether the record is due at the given instant
    pub fn is_due_at(&self, now: DateTime<Utc>) -> bool {
        self.next_retry_time <= now
    }
}

/// Persistence seam for retry records
#[async_trait]
pub trait FlowRetryRepository: Send + Sync {
    /// Insert a new record (or replace one left over for the same entity)
    async fn save(&self, record: &FlowRetryRecord) -> Result<(), FlowError>;

    /// Look up a record by entity id
    async fn find_by_entity_id(&self, entity_id: &str)
        -> Result<Option<FlowRetryRecord>, FlowError>;

    /// Records whose next retry time is at or before `now`, oldest first
    async fn find_due(
        &self,
        now: DateTime<Utc>,
        limit: usize,
    ) -> Result<Vec<FlowRetryRecord>, FlowError>;

    /// Persist an update only if the stored version still equals
    /// `expected_version`; returns false when the version race was lost
    async fn update_versioned(
        &self,
        record: &FlowRetryRecord,
        expected_version: i32,
    ) -> Result<bool, FlowError>;

    /// Remove a record
    async fn delete(&self, entity_id: &str) -> Result<(), FlowError>;
}

/// How failed executions are re-attempted
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RetryPolicy {
    /// Retry attempts allowed before the failure turns terminal
    pub max_attempts: u32,

    /// Delay before the first retry
    pub initial_delay: Duration,

    /// Multiplier applied to the delay on every subsequent attempt;
    /// 1.0 keeps the delay fixed
    pub backoff_multiplier: f64,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_attempts: 3,
            initial_delay: Duration::from_millis(100),
            backoff_multiplier: 1.0,
        }
    }
}

impl RetryPolicy {
    /// A fixed-delay policy
    pub fn fixed(max_attempts: u32, delay: Duration) -> Self {
        Self {
            max_attempts,
            initial_delay: delay,
            backoff_multiplier: 1.0,
        }
    }

    /// An exponential-backoff policy
    pub fn backoff(max_attempts: u32, initial_delay: Duration, multiplier: f64) -> Self {
        Self {
            max_attempts,
            initial_delay,
            backoff_multiplier: multiplier,
        }
    }

    /// Delay before the attempt following `retry_count` completed attempts
    pub fn delay_for(&self, retry_count: u32) -> Duration {
        if self.backoff_multiplier == 1.0 {
            return self.initial_delay;
        }
        self.initial_delay
            .mul_f64(self.backoff_multiplier.powi(retry_count as i32))
    }

    /// Whether a record with this many completed attempts is out of budget
    pub fn is_exhausted(&self, retry_count: i32) -> bool {
        retry_count >= self.max_attempts as i32
    }
}
