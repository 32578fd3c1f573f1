//! Schedules and redrives failed jober batches.
//!
//! A retry record is the durable claim that an entity wants another
//! attempt. The sweep claims due records by bumping their version; when
//! several sweepers race, the one whose compare-and-swap fails walks away
//! and leaves the entity to the winner.

use crate::domain::retry::{FlowRetryRecord, FlowRetryRepository, RetryPolicy};
use crate::error::FlowError;
use chrono::{DateTime, Utc};
use std::sync::Arc;
use std::time::Duration;
use tokio::time::MissedTickBehavior;

/// Retry sweep tuning
#[derive(Debug, Clone)]
pub struct RetryConfig {
    /// Attempt schedule
    pub policy: RetryPolicy,

    /// Period of the due-record sweeper
    pub sweep_interval: Duration,

    /// Most records claimed per sweep
    pub batch_limit: usize,
}

impl Default for RetryConfig {
    fn default() -> Self {
        Self {
            policy: RetryPolicy::default(),
            sweep_interval: Duration::from_millis(500),
            batch_limit: 32,
        }
    }
}

/// Redrives entities whose retry timers fire
#[async_trait::async_trait]
pub trait RetryExecutor: Send + Sync {
    /// Run one attempt for the entity. A retryable error keeps the
    /// schedule alive; anything else settles it.
    async fn redrive(&self, entity_id: &str, entity_type: &str) -> Result<(), FlowError>;

    /// Called when the entity has no attempts left
    async fn abandon(&self, entity_id: &str, entity_type: &str);
}

/// Drives the retry lifecycle of failed entities
pub struct RetryScheduler {
    repo: Arc<dyn FlowRetryRepository>,
    executor: Arc<dyn RetryExecutor>,
    config: RetryConfig,
}

impl RetryScheduler {
    pub fn new(
        repo: Arc<dyn FlowRetryRepository>,
        executor: Arc<dyn RetryExecutor>,
        config: RetryConfig,
    ) -> Self {
        Self {
            repo,
            executor,
            config,
        }
    }

    pub fn policy(&self) -> &RetryPolicy {
        &self.config.policy
    }

    /// Create the retry record for an entity. Scheduling an already
    /// scheduled entity returns the existing record untouched.
    pub async fn schedule_retry(
        &self,
        entity_id: &str,
        entity_type: &str,
    ) -> Result<FlowRetryRecord, FlowError> {
        if let Some(existing) = self.repo.find_by_entity_id(entity_id).await? {
            return Ok(existing);
        }
        let next_retry_time = Utc::now()
            + chrono::Duration::from_std(self.config.policy.delay_for(0))
                .unwrap_or_else(|_| chrono::Duration::days(36_500));
        let record = FlowRetryRecord::new(entity_id, entity_type, next_retry_time);
        self.repo.save(&record).await?;
        tracing::debug!(
            entity_id = %entity_id,
            entity_type = %entity_type,
            next_retry_time = %record.next_retry_time,
            "retry scheduled"
        );
        Ok(record)
    }

    /// Drop the schedule for an entity
    pub async fn cancel(&self, entity_id: &str) -> Result<(), FlowError> {
        self.repo.delete(entity_id).await
    }

    /// Process every record due at `now` once. Returns how many redrives
    /// ran.
    ///
    /// Each record is claimed with a version bump first; losing that race
    /// means another sweeper owns the attempt, so the loser abandons the
    /// record silently.
    pub async fn run_sweep_once(&self, now: DateTime<Utc>) -> Result<usize, FlowError> {
        let due = self.repo.find_due(now, self.config.batch_limit).await?;
        let mut driven = 0;

        for record in due {
            if self.config.policy.is_exhausted(record.retry_count) {
                self.repo.delete(&record.entity_id).await?;
                tracing::info!(
                    entity_id = %record.entity_id,
                    retry_count = record.retry_count,
                    "retries exhausted, abandoning entity"
                );
                self.executor
                    .abandon(&record.entity_id, &record.entity_type)
                    .await;
                continue;
            }

            let mut claimed = record.clone();
            claimed.retry_count += 1;
            claimed.last_retry_time = Some(now);
            claimed.next_retry_time = now
                + chrono::Duration::from_std(
                    self.config.policy.delay_for(claimed.retry_count as u32),
                )
                .unwrap_or_else(|_| chrono::Duration::days(36_500));
            claimed.version += 1;
            if !self.repo.update_versioned(&claimed, record.version).await? {
                tracing::debug!(entity_id = %record.entity_id, "lost retry claim race");
                continue;
            }

            driven += 1;
            match self
                .executor
                .redrive(&record.entity_id, &record.entity_type)
                .await
            {
                Ok(()) => {
                    // The entity moved on; its schedule is spent.
                    self.repo.delete(&record.entity_id).await?;
                }
                Err(error) if error.is_retryable() => {
                    tracing::debug!(
                        entity_id = %record.entity_id,
                        retry_count = claimed.retry_count,
                        error = %error,
                        "redrive failed, keeping schedule"
                    );
                }
                Err(error) => {
                    tracing::warn!(
                        entity_id = %record.entity_id,
                        error = %error,
                        "redrive failed terminally"
                    );
                    self.repo.delete(&record.entity_id).await?;
                    self.executor
                        .abandon(&record.entity_id, &record.entity_type)
                        .await;
                }
            }
        }
        Ok(driven)
    }

    /// Sweep due records on an interval until the returned task is aborted
    pub fn spawn_sweeper(self: &Arc<Self>) -> tokio::task::JoinHandle<()> {
        let scheduler = self.clone();
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(scheduler.config.sweep_interval);
            ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
            loop {
                ticker.tick().await;
                if let Err(error) = scheduler.run_sweep_once(Utc::now()).await {
                    tracing::warn!(error = %error, "retry sweep failed");
                }
            }
        })
    }
}
