use serde::{Deserialize, Serialize};

use crate::{error::SmqError, keys::QueueKeys, store::RedisStore};

/// Smallest accepted rate limit window, in milliseconds.
pub const MIN_RATE_LIMIT_INTERVAL_MS: u64 = 1000;

/// At most `limit` messages per `interval` milliseconds, shared by every consumer of the queue.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct QueueRateLimit {
    pub limit: u64,
    pub interval: u64,
}

impl QueueRateLimit {
    pub fn new(limit: u64, interval: u64) -> Self {
        Self { limit, interval }
    }

    pub fn validate(&self) -> Result<(), SmqError> {
        if self.limit == 0 {
            return Err(SmqError::InvalidRateLimit(
                "limit must be greater than zero".into(),
            ));
        }
        if self.interval < MIN_RATE_LIMIT_INTERVAL_MS {
            return Err(SmqError::InvalidRateLimit(format!(
                "interval must be at least {MIN_RATE_LIMIT_INTERVAL_MS}ms"
            )));
        }
        Ok(())
    }

    /// Index of the fixed window `now` falls into.
    pub fn bucket(&self, now: u64) -> u64 {
        now / self.interval.max(1)
    }
}

/// Fixed window counter kept in redis, one key per window.
#[derive(Clone)]
pub struct RateLimiter {
    store: RedisStore,
}

impl RateLimiter {
    pub fn new(store: RedisStore) -> Self {
        Self { store }
    }

    /// Count one delivery against the window and report whether the limit is now exceeded.
    pub async fn has_exceeded(
        &self,
        keys: &QueueKeys,
        rate_limit: &QueueRateLimit,
        now: u64,
    ) -> Result<bool, SmqError> {
        let counter = keys.rate_limit_counter(rate_limit.bucket(now));
        let exceeded: i64 = self
            .store
            .scripts()
            .check_rate_limit
            .key(counter)
            .arg(rate_limit.limit)
            .arg(rate_limit.interval)
            .invoke_async(&mut self.store.conn())
            .await?;
        Ok(exceeded == 1)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn limits_are_validated() {
        assert!(QueueRateLimit::new(5, 1000).validate().is_ok());
        assert!(matches!(
            QueueRateLimit::new(0, 1000).validate(),
            Err(SmqError::InvalidRateLimit(_))
        ));
        assert!(QueueRateLimit::new(5, 999).validate().is_err());
    }

    #[test]
    fn windows_are_fixed() {
        let limit = QueueRateLimit::new(5, 2000);
        assert_eq!(limit.bucket(0), 0);
        assert_eq!(limit.bucket(1999), 0);
        assert_eq!(limit.bucket(2000), 1);
        assert_eq!(limit.bucket(10_500), 5);
    }

    #[test]
    fn serializes_as_stored_in_properties() {
        let json = serde_json::to_string(&QueueRateLimit::new(10, 2000)).unwrap();
        assert_eq!(json, r#"{"limit":10,"interval":2000}"#);
    }
}
