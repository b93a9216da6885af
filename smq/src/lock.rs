use std::time::Duration;

use uuid::Uuid;

use crate::{error::SmqError, lifecycle::Lifecycle, store::RedisStore};

/// Single holder lock on one redis key. The token identifies this holder so a lock that
/// expired and was taken by someone else is never released or extended by us.
pub struct RedisLock {
    store: RedisStore,
    key: String,
    token: String,
    ttl: Duration,
}

impl RedisLock {
    pub fn new(store: RedisStore, key: impl Into<String>, ttl: Duration) -> Self {
        Self {
            store,
            key: key.into(),
            token: Uuid::new_v4().to_string(),
            ttl,
        }
    }

    pub fn key(&self) -> &str {
        &self.key
    }

    /// One SET NX PX attempt.
    pub async fn acquire(&self) -> Result<bool, SmqError> {
        let acquired: Option<String> = redis::cmd("SET")
            .arg(&self.key)
            .arg(&self.token)
            .arg("NX")
            .arg("PX")
            .arg(self.ttl.as_millis() as u64)
            .query_async(&mut self.store.conn())
            .await?;
        Ok(acquired.is_some())
    }

    /// Retry up to `attempts` times, `delay` apart. Gives up with `Aborted` as soon as
    /// `owner` stops running.
    pub async fn acquire_with_retry(
        &self,
        attempts: u32,
        delay: Duration,
        owner: &Lifecycle,
    ) -> Result<(), SmqError> {
        for attempt in 1..=attempts.max(1) {
            owner.ensure_active()?;
            if self.acquire().await? {
                tracing::trace!(lock = self.key, attempt, "Lock acquired");
                return Ok(());
            }
            if attempt < attempts {
                tokio::time::sleep(delay).await;
            }
        }
        Err(SmqError::LockNotAcquired(self.key.clone()))
    }

    pub async fn release(&self) -> Result<bool, SmqError> {
        let released: i64 = self
            .store
            .scripts()
            .release_lock
            .key(&self.key)
            .arg(&self.token)
            .invoke_async(&mut self.store.conn())
            .await?;
        Ok(released == 1)
    }

    /// Push the expiry one full TTL into the future. Returns false if the lock was lost.
    pub async fn extend(&self) -> Result<bool, SmqError> {
        let extended: i64 = self
            .store
            .scripts()
            .extend_lock
            .key(&self.key)
            .arg(&self.token)
            .arg(self.ttl.as_millis() as u64)
            .invoke_async(&mut self.store.conn())
            .await?;
        Ok(extended == 1)
    }
}
