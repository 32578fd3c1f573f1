//! Distributed locks guarding flow transactions.
//!
//! A lock is a persisted record with an expiration horizon. Acquiring
//! pushes the horizon `ttl` past now; a crashed holder frees the lock by
//! letting it expire. Reclaiming stale locks goes through
//! [`FlowLockService::delete_expired_locks`], which tells affected holders
//! through the invalidation notifier.

use crate::domain::flow_trans::FlowTransId;
use crate::domain::lock::{FlowLockRecord, FlowLockRepository};
use crate::error::FlowError;
use chrono::Utc;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::broadcast;
use tokio::time::{Instant, MissedTickBehavior};
use uuid::Uuid;

/// Lock service tuning
#[derive(Debug, Clone)]
pub struct LockConfig {
    /// Client id written into lock records; minted when absent
    pub client_id: Option<String>,

    /// How far past each use a lock's expiration is pushed
    pub ttl: Duration,

    /// How long `acquire` keeps contending before giving up
    pub acquire_timeout: Duration,

    /// Pause between contention attempts
    pub retry_interval: Duration,

    /// Period of the expired-lock sweeper
    pub sweep_interval: Duration,
}

impl Default for LockConfig {
    fn default() -> Self {
        Self {
            client_id: None,
            ttl: Duration::from_secs(30),
            acquire_timeout: Duration::from_secs(10),
            retry_interval: Duration::from_millis(50),
            sweep_interval: Duration::from_secs(60),
        }
    }
}

/// Acquires and releases persisted locks on behalf of one engine instance
pub struct FlowLockService {
    repo: Arc<dyn FlowLockRepository>,
    client_id: String,
    ttl: chrono::Duration,
    config: LockConfig,
    invalidations: broadcast::Sender<String>,
}

impl FlowLockService {
    pub fn new(repo: Arc<dyn FlowLockRepository>, config: LockConfig) -> Self {
        let client_id = config
            .client_id
            .clone()
            .unwrap_or_else(|| Uuid::new_v4().to_string());
        // Clamp unrepresentable ttls to a horizon date math cannot overflow.
        let ttl = chrono::Duration::from_std(config.ttl)
            .unwrap_or_else(|_| chrono::Duration::days(36_500));
        let (invalidations, _) = broadcast::channel(64);
        Self {
            repo,
            client_id,
            ttl,
            config,
            invalidations,
        }
    }

    /// Id this instance writes into lock records
    pub fn client_id(&self) -> &str {
        &self.client_id
    }

    /// Key guarding one flow transaction
    pub fn trans_lock_key(&self, trans_id: &FlowTransId) -> String {
        format!("flow-trans-{}", trans_id.0)
    }

    /// Take the lock, contending until it frees or the acquire timeout
    /// elapses
    pub async fn acquire(&self, lock_key: &str) -> Result<(), FlowError> {
        let deadline = Instant::now() + self.config.acquire_timeout;
        loop {
            if self.try_acquire(lock_key).await? {
                return Ok(());
            }
            if Instant::now() >= deadline {
                return Err(FlowError::Locked(format!(
                    "timed out acquiring lock: {}",
                    lock_key
                )));
            }
            tokio::time::sleep(self.config.retry_interval).await;
        }
    }

    /// One attempt at the lock. Succeeds when the lock is free, expired, or
    /// already held by this client.
    pub async fn try_acquire(&self, lock_key: &str) -> Result<bool, FlowError> {
        let record = FlowLockRecord::new(lock_key, &self.client_id, Utc::now() + self.ttl);
        let acquired = self.repo.try_lock(&record).await?;
        if acquired {
            tracing::debug!(lock_key = %lock_key, client_id = %self.client_id, "lock acquired");
        }
        Ok(acquired)
    }

    /// Push a held lock's expiration another ttl out
    pub async fn refresh(&self, lock_key: &str) -> Result<bool, FlowError> {
        self.repo
            .refresh(lock_key, &self.client_id, Utc::now() + self.ttl)
            .await
    }

    /// Give the lock back. Returns false when this client no longer holds
    /// it.
    pub async fn release(&self, lock_key: &str) -> Result<bool, FlowError> {
        let released = self.repo.unlock(lock_key, &self.client_id).await?;
        if released {
            tracing::debug!(lock_key = %lock_key, client_id = %self.client_id, "lock released");
        }
        Ok(released)
    }

    /// Whether any client currently holds an unexpired lock on the key
    pub async fn is_held(&self, lock_key: &str) -> Result<bool, FlowError> {
        let now = Utc::now();
        Ok(self
            .repo
            .find_by_key(lock_key)
            .await?
            .map(|record| !record.is_expired_at(now))
            .unwrap_or(false))
    }

    /// Delete locks whose last use is further back than the given timeout.
    ///
    /// A lock's expiration sits ttl past its last use, so the sweep cutoff
    /// is `now - timeout + ttl`. A timeout shorter than the ttl reclaims
    /// locks that have not yet expired; their holders learn of it through
    /// the invalidation notifier. Returns the reclaimed keys.
    pub async fn delete_expired_locks(
        &self,
        timeout_since_last_use: Duration,
    ) -> Result<Vec<String>, FlowError> {
        let timeout = chrono::Duration::from_std(timeout_since_last_use).map_err(|_| {
            FlowError::InvalidFlowParam("lock timeout out of range".to_string())
        })?;
        let cutoff = Utc::now()
            .checked_sub_signed(timeout)
            .and_then(|t| t.checked_add_signed(self.ttl))
            .ok_or_else(|| {
                FlowError::InvalidFlowParam("lock timeout out of range".to_string())
            })?;

        let reclaimed = self.repo.delete_expired(cutoff).await?;
        let mut keys = Vec::with_capacity(reclaimed.len());
        for record in reclaimed {
            tracing::info!(
                lock_key = %record.lock_key,
                locked_client = %record.locked_client,
                "reclaimed stale lock"
            );
            let _ = self.invalidations.send(record.lock_key.clone());
            keys.push(record.lock_key);
        }
        Ok(keys)
    }

    /// Subscribe to reclaim notifications. Each message is the key of a
    /// lock taken away from its holder.
    pub fn subscribe_invalidations(&self) -> broadcast::Receiver<String> {
        self.invalidations.subscribe()
    }

    /// Reclaim stale locks on an interval until the returned task is
    /// aborted
    pub fn spawn_sweeper(
        self: &Arc<Self>,
        timeout_since_last_use: Duration,
    ) -> tokio::task::JoinHandle<()> {
        let service = self.clone();
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(service.config.sweep_interval);
            ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
            loop {
                ticker.tick().await;
                if let Err(error) = service.delete_expired_locks(timeout_since_last_use).await {
                    tracing::warn!(error = %error, "lock sweep failed");
                }
            }
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use async_trait::async_trait;
    use std::collections::HashMap;
    use std::sync::Mutex as StdMutex;
    use chrono::{DateTime, Utc};

    struct MemoryLockRepo {
        records: StdMutex<HashMap<String, FlowLockRecord>>,
    }

    impl MemoryLockRepo {
        fn new() -> Arc<Self> {
            Arc::new(Self {
                records: StdMutex::new(HashMap::new()),
            })
        }
    }

    #[async_trait]
    impl FlowLockRepository for MemoryLockRepo {
        async fn try_lock(&self, record: &FlowLockRecord) -> Result<bool, FlowError> {
            let mut records = self.records.lock().unwrap();
            let now = Utc::now();
            match records.get(&record.lock_key) {
                Some(existing)
                    if !existing.is_expired_at(now)
                        && existing.locked_client != record.locked_client =>
                {
                    Ok(false)
                }
                _ => {
                    records.insert(record.lock_key.clone(), record.clone());
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
            let mut records = self.records.lock().unwrap();
            match records.get_mut(lock_key) {
                Some(record) if record.locked_client == client => {
                    record.expire_at = expire_at;
                    Ok(true)
                }
                _ => Ok(false),
            }
        }

        async fn unlock(&self, lock_key: &str, client: &str) -> Result<bool, FlowError> {
            let mut records = self.records.lock().unwrap();
            match records.get(lock_key) {
                Some(record) if record.locked_client == client => {
                    records.remove(lock_key);
                    Ok(true)
                }
                _ => Ok(false),
            }
        }

        async fn find_by_key(&self, lock_key: &str) -> Result<Option<FlowLockRecord>, FlowError> {
            Ok(self.records.lock().unwrap().get(lock_key).cloned())
        }

        async fn delete_expired(
            &self,
            cutoff: DateTime<Utc>,
        ) -> Result<Vec<FlowLockRecord>, FlowError> {
            let mut records = self.records.lock().unwrap();
            let stale: Vec<String> = records
                .iter()
                .filter(|(_, r)| r.expire_at <= cutoff)
                .map(|(k, _)| k.clone())
                .collect();
            let mut reclaimed = Vec::with_capacity(stale.len());
            for key in stale {
                if let Some(record) = records.remove(&key) {
                    reclaimed.push(record);
                }
            }
            Ok(reclaimed)
        }
    }

    fn service(repo: Arc<MemoryLockRepo>, client_id: &str, config: LockConfig) -> FlowLockService {
        let config = LockConfig {
            client_id: Some(client_id.to_string()),
            ..config
        };
        FlowLockService::new(repo, config)
    }

    fn quick_config() -> LockConfig {
        LockConfig {
            acquire_timeout: Duration::from_millis(200),
            retry_interval: Duration::from_millis(10),
            ..LockConfig::default()
        }
    }

    #[tokio::test]
    async fn test_acquire_then_release() {
        let repo = MemoryLockRepo::new();
        let service = service(repo, "client-a", quick_config());

        service.acquire("lock-1").await.unwrap();
        assert!(service.is_held("lock-1").await.unwrap());

        assert!(service.release("lock-1").await.unwrap());
        assert!(!service.is_held("lock-1").await.unwrap());
    }

    #[tokio::test]
    async fn test_held_lock_rejects_other_clients() {
        let repo = MemoryLockRepo::new();
        let holder = service(repo.clone(), "client-a", quick_config());
        let contender = service(repo, "client-b", quick_config());

        holder.acquire("lock-1").await.unwrap();
        assert!(!contender.try_acquire("lock-1").await.unwrap());

        // The same client may take its own lock again.
        assert!(holder.try_acquire("lock-1").await.unwrap());
    }

    #[tokio::test]
    async fn test_acquire_waits_for_release() {
        let repo = MemoryLockRepo::new();
        let holder = Arc::new(service(repo.clone(), "client-a", quick_config()));
        let contender = service(repo, "client-b", quick_config());

        holder.acquire("lock-1").await.unwrap();
        {
            let holder = holder.clone();
            tokio::spawn(async move {
                tokio::time::sleep(Duration::from_millis(40)).await;
                holder.release("lock-1").await.unwrap();
            });
        }

        contender.acquire("lock-1").await.unwrap();
        assert!(contender.is_held("lock-1").await.unwrap());
    }

    #[tokio::test]
    async fn test_acquire_times_out_when_contended() {
        let repo = MemoryLockRepo::new();
        let holder = service(repo.clone(), "client-a", quick_config());
        let contender = service(repo, "client-b", quick_config());

        holder.acquire("lock-1").await.unwrap();
        let err = contender.acquire("lock-1").await.unwrap_err();
        assert!(matches!(err, FlowError::Locked(_)));
    }

    #[tokio::test]
    async fn test_expired_lock_can_be_taken() {
        let repo = MemoryLockRepo::new();
        let short_ttl = LockConfig {
            ttl: Duration::from_millis(20),
            ..quick_config()
        };
        let holder = service(repo.clone(), "client-a", short_ttl);
        let contender = service(repo, "client-b", quick_config());

        holder.acquire("lock-1").await.unwrap();
        tokio::time::sleep(Duration::from_millis(40)).await;

        assert!(contender.try_acquire("lock-1").await.unwrap());
    }

    #[tokio::test]
    async fn test_delete_expired_locks_notifies_holders() {
        let repo = MemoryLockRepo::new();
        let service = service(repo, "client-a", quick_config());
        let mut invalidations = service.subscribe_invalidations();

        service.acquire("lock-1").await.unwrap();

        // A zero timeout reclaims every lock, held or not.
        let reclaimed = service
            .delete_expired_locks(Duration::ZERO)
            .await
            .unwrap();
        assert_eq!(reclaimed, vec!["lock-1".to_string()]);
        assert_eq!(invalidations.recv().await.unwrap(), "lock-1");
        assert!(!service.is_held("lock-1").await.unwrap());
    }

    #[tokio::test]
    async fn test_delete_expired_locks_spares_recently_used() {
        let repo = MemoryLockRepo::new();
        let service = service(repo, "client-a", quick_config());

        service.acquire("lock-1").await.unwrap();

        let reclaimed = service
            .delete_expired_locks(Duration::from_secs(3600))
            .await
            .unwrap();
        assert!(reclaimed.is_empty());
        assert!(service.is_held("lock-1").await.unwrap());
    }

    #[tokio::test]
    async fn test_trans_lock_keys_are_scoped_per_trans() {
        let repo = MemoryLockRepo::new();
        let service = service(repo, "client-a", quick_config());

        let trans_x = FlowTransId::generate();
        let trans_y = FlowTransId::generate();
        let key_x = service.trans_lock_key(&trans_x);
        let key_y = service.trans_lock_key(&trans_y);
        assert_ne!(key_x, key_y);

        // Holding x has no bearing on y.
        service.acquire(&key_x).await.unwrap();
        assert!(service.try_acquire(&key_y).await.unwrap());
    }
}
