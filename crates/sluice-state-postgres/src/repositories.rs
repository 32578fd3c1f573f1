use async_trait::async_trait;
use chrono::{DateTime, Utc};
use sluice_core::domain::lock::{FlowLockRecord, FlowLockRepository};
use sluice_core::domain::retry::{FlowRetryRecord, FlowRetryRepository};
use sluice_core::FlowError;
use sqlx::postgres::PgRow;
use sqlx::Row;

use crate::PostgresConnection;

fn lock_record_from_row(row: &PgRow) -> Result<FlowLockRecord, FlowError> {
    Ok(FlowLockRecord {
        lock_key: row
            .try_get("lock_key")
            .map_err(|e| FlowError::SerializationError(format!("Error getting lock_key: {}", e)))?,
        locked_client: row.try_get("locked_client").map_err(|e| {
            FlowError::SerializationError(format!("Error getting locked_client: {}", e))
        })?,
        expire_at: row
            .try_get("expire_at")
            .map_err(|e| FlowError::SerializationError(format!("Error getting expire_at: {}", e)))?,
    })
}

fn retry_record_from_row(row: &PgRow) -> Result<FlowRetryRecord, FlowError> {
    Ok(FlowRetryRecord {
        entity_id: row
            .try_get("entity_id")
            .map_err(|e| FlowError::SerializationError(format!("Error getting entity_id: {}", e)))?,
        entity_type: row.try_get("entity_type").map_err(|e| {
            FlowError::SerializationError(format!("Error getting entity_type: {}", e))
        })?,
        next_retry_time: row.try_get("next_retry_time").map_err(|e| {
            FlowError::SerializationError(format!("Error getting next_retry_time: {}", e))
        })?,
        last_retry_time: row.try_get("last_retry_time").map_err(|e| {
            FlowError::SerializationError(format!("Error getting last_retry_time: {}", e))
        })?,
        retry_count: row.try_get("retry_count").map_err(|e| {
            FlowError::SerializationError(format!("Error getting retry_count: {}", e))
        })?,
        version: row
            .try_get("version")
            .map_err(|e| FlowError::SerializationError(format!("Error getting version: {}", e)))?,
    })
}

/// Postgres implementation of the FlowLockRepository
///
/// Acquisition is one conditional upsert, so competing clients resolve to a
/// single winner inside the database.
#[derive(Clone)]
pub struct PostgresFlowLockRepository {
    conn: PostgresConnection,
}

impl PostgresFlowLockRepository {
    /// Create a new Postgres lock repository
    pub fn new(conn: PostgresConnection) -> Self {
        Self { conn }
    }
}

#[async_trait]
impl FlowLockRepository for PostgresFlowLockRepository {
    async fn try_lock(&self, record: &FlowLockRecord) -> Result<bool, FlowError> {
        if self.conn.is_test_mode() {
            tracing::debug!("Test mode PostgreSQL: try_lock called for {}", record.lock_key);
            return Ok(true);
        }

        // The update fires only when the row is ours already or expired;
        // otherwise zero rows change and the lock stays with its owner.
        let query = "
            INSERT INTO flow_locks (lock_key, locked_client, expire_at)
            VALUES ($1, $2, $3)
            ON CONFLICT (lock_key) DO UPDATE SET
                locked_client = EXCLUDED.locked_client,
                expire_at = EXCLUDED.expire_at,
                updated_at = NOW()
            WHERE flow_locks.locked_client = EXCLUDED.locked_client
               OR flow_locks.expire_at <= NOW()
        ";

        let result = sqlx::query(query)
            .bind(&record.lock_key)
            .bind(&record.locked_client)
            .bind(record.expire_at)
            .execute(self.conn.pool()?)
            .await
            .map_err(|e| FlowError::StateStoreError(format!("Failed to acquire lock: {}", e)))?;

        Ok(result.rows_affected() == 1)
    }

    async fn refresh(
        &self,
        lock_key: &str,
        client: &str,
        expire_at: DateTime<Utc>,
    ) -> Result<bool, FlowError> {
        if self.conn.is_test_mode() {
            tracing::debug!("Test mode PostgreSQL: refresh called for {}", lock_key);
            return Ok(true);
        }

        let query = "
            UPDATE flow_locks
            SET expire_at = $3, updated_at = NOW()
            WHERE lock_key = $1 AND locked_client = $2
        ";

        let result = sqlx::query(query)
            .bind(lock_key)
            .bind(client)
            .bind(expire_at)
            .execute(self.conn.pool()?)
            .await
            .map_err(|e| FlowError::StateStoreError(format!("Failed to refresh lock: {}", e)))?;

        Ok(result.rows_affected() == 1)
    }

    async fn unlock(&self, lock_key: &str, client: &str) -> Result<bool, FlowError> {
        if self.conn.is_test_mode() {
            tracing::debug!("Test mode PostgreSQL: unlock called for {}", lock_key);
            return Ok(true);
        }

        let query = "
            DELETE FROM flow_locks
            WHERE lock_key = $1 AND locked_client = $2
        ";

        let result = sqlx::query(query)
            .bind(lock_key)
            .bind(client)
            .execute(self.conn.pool()?)
            .await
            .map_err(|e| FlowError::StateStoreError(format!("Failed to release lock: {}", e)))?;

        Ok(result.rows_affected() == 1)
    }

    async fn find_by_key(&self, lock_key: &str) -> Result<Option<FlowLockRecord>, FlowError> {
        if self.conn.is_test_mode() {
            tracing::debug!("Test mode PostgreSQL: find_by_key called for {}", lock_key);
            return Ok(None);
        }

        let query = "
            SELECT lock_key, locked_client, expire_at
            FROM flow_locks
            WHERE lock_key = $1
        ";

        let row = sqlx::query(query)
            .bind(lock_key)
            .fetch_optional(self.conn.pool()?)
            .await
            .map_err(|e| FlowError::StateStoreError(format!("Database error: {}", e)))?;

        row.as_ref().map(lock_record_from_row).transpose()
    }

    async fn delete_expired(
        &self,
        cutoff: DateTime<Utc>,
    ) -> Result<Vec<FlowLockRecord>, FlowError> {
        if self.conn.is_test_mode() {
            tracing::debug!("Test mode PostgreSQL: delete_expired called");
            return Ok(vec![]);
        }

        let query = "
            DELETE FROM flow_locks
            WHERE expire_at <= $1
            RETURNING lock_key, locked_client, expire_at
        ";

        let rows = sqlx::query(query)
            .bind(cutoff)
            .fetch_all(self.conn.pool()?)
            .await
            .map_err(|e| {
                FlowError::StateStoreError(format!("Failed to delete expired locks: {}", e))
            })?;

        rows.iter().map(lock_record_from_row).collect()
    }
}

/// Postgres implementation of the FlowRetryRepository
#[derive(Clone)]
pub struct PostgresFlowRetryRepository {
    conn: PostgresConnection,
}

impl PostgresFlowRetryRepository {
    /// Create a new Postgres retry repository
    pub fn new(conn: PostgresConnection) -> Self {
        Self { conn }
    }
}

#[async_trait]
impl FlowRetryRepository for PostgresFlowRetryRepository {
    async fn save(&self, record: &FlowRetryRecord) -> Result<(), FlowError> {
        if self.conn.is_test_mode() {
            tracing::debug!("Test mode PostgreSQL: save called for {}", record.entity_id);
            return Ok(());
        }

        let query = "
            INSERT INTO flow_retries
                (entity_id, entity_type, next_retry_time, last_retry_time, retry_count, version)
            VALUES ($1, $2, $3, $4, $5, $6)
            ON CONFLICT (entity_id) DO UPDATE SET
                entity_type = $2,
                next_retry_time = $3,
                last_retry_time = $4,
                retry_count = $5,
                version = $6,
                updated_at = NOW()
        ";

        sqlx::query(query)
            .bind(&record.entity_id)
            .bind(&record.entity_type)
            .bind(record.next_retry_time)
            .bind(record.last_retry_time)
            .bind(record.retry_count)
            .bind(record.version)
            .execute(self.conn.pool()?)
            .await
            .map_err(|e| {
                FlowError::StateStoreError(format!("Failed to save retry record: {}", e))
            })?;

        Ok(())
    }

    async fn find_by_entity_id(
        &self,
        entity_id: &str,
    ) -> Result<Option<FlowRetryRecord>, FlowError> {
        if self.conn.is_test_mode() {
            tracing::debug!("Test mode PostgreSQL: find_by_entity_id called for {}", entity_id);
            return Ok(None);
        }

        let query = "
            SELECT entity_id, entity_type, next_retry_time, last_retry_time, retry_count, version
            FROM flow_retries
            WHERE entity_id = $1
        ";

        let row = sqlx::query(query)
            .bind(entity_id)
            .fetch_optional(self.conn.pool()?)
            .await
            .map_err(|e| FlowError::StateStoreError(format!("Database error: {}", e)))?;

        row.as_ref().map(retry_record_from_row).transpose()
    }

    async fn find_due(
        &self,
        now: DateTime<Utc>,
        limit: usize,
    ) -> Result<Vec<FlowRetryRecord>, FlowError> {
        if self.conn.is_test_mode() {
            tracing::debug!("Test mode PostgreSQL: find_due called");
            return Ok(vec![]);
        }

        let query = "
            SELECT entity_id, entity_type, next_retry_time, last_retry_time, retry_count, version
            FROM flow_retries
            WHERE next_retry_time <= $1
            ORDER BY next_retry_time ASC
            LIMIT $2
        ";

        let rows = sqlx::query(query)
            .bind(now)
            .bind(limit as i64)
            .fetch_all(self.conn.pool()?)
            .await
            .map_err(|e| FlowError::StateStoreError(format!("Database error: {}", e)))?;

        rows.iter().map(retry_record_from_row).collect()
    }

    async fn update_versioned(
        &self,
        record: &FlowRetryRecord,
        expected_version: i32,
    ) -> Result<bool, FlowError> {
        if self.conn.is_test_mode() {
            tracing::debug!(
                "Test mode PostgreSQL: update_versioned called for {}",
                record.entity_id
            );
            return Ok(true);
        }

        let query = "
            UPDATE flow_retries
            SET entity_type = $2,
                next_retry_time = $3,
                last_retry_time = $4,
                retry_count = $5,
                version = $6,
                updated_at = NOW()
            WHERE entity_id = $1 AND version = $7
        ";

        let result = sqlx::query(query)
            .bind(&record.entity_id)
            .bind(&record.entity_type)
            .bind(record.next_retry_time)
            .bind(record.last_retry_time)
            .bind(record.retry_count)
            .bind(record.version)
            .bind(expected_version)
            .execute(self.conn.pool()?)
            .await
            .map_err(|e| {
                FlowError::StateStoreError(format!("Failed to update retry record: {}", e))
            })?;

        Ok(result.rows_affected() == 1)
    }

    async fn delete(&self, entity_id: &str) -> Result<(), FlowError> {
        if self.conn.is_test_mode() {
            tracing::debug!("Test mode PostgreSQL: delete called for {}", entity_id);
            return Ok(());
        }

        let query = "
            DELETE FROM flow_retries
            WHERE entity_id = $1
        ";

        sqlx::query(query)
            .bind(entity_id)
            .execute(self.conn.pool()?)
            .await
            .map_err(|e| {
                FlowError::StateStoreError(format!("Failed to delete retry record: {}", e))
            })?;

        Ok(())
    }
}
