use std::collections::HashMap;

use redis::AsyncCommands;

use crate::{
    error::SmqError,
    keys::{self, ConsumerQueueKeys, QueueKeys},
    message::Message,
    queue::{
        ConsumerQueue, DeliveryModel, QueueCounters, QueueParams, QueueProperties, QueueType,
        fields,
    },
    rate_limit::QueueRateLimit,
    store::RedisStore,
};

/// Creates queues and manages their properties, consumer groups and archives.
#[derive(Clone)]
pub struct QueueManager {
    store: RedisStore,
}

impl QueueManager {
    pub fn new(store: RedisStore) -> Self {
        Self { store }
    }

    /// Create the queue. Returns `false` if an identical queue already exists.
    #[tracing::instrument(level = "debug", skip(self), fields(queue = %queue))]
    pub async fn save(
        &self,
        queue: &QueueParams,
        queue_type: QueueType,
        delivery_model: DeliveryModel,
    ) -> Result<bool, SmqError> {
        queue.validate()?;
        let keys = QueueKeys::new(queue);
        let created: i64 = self
            .store
            .scripts()
            .create_queue
            .key(keys.properties())
            .key(keys::queues_set())
            .arg(queue_type.as_str())
            .arg(delivery_model.as_str())
            .arg(serde_json::to_string(queue)?)
            .arg(crate::now_ms())
            .invoke_async(&mut self.store.conn())
            .await?;

        match created {
            1 => {
                tracing::info!(
                    queue_type = queue_type.as_str(),
                    delivery_model = delivery_model.as_str(),
                    "Queue created"
                );
                Ok(true)
            }
            0 => Ok(false),
            _ => Err(SmqError::QueueAlreadyExists(queue.to_string())),
        }
    }

    pub async fn exists(&self, queue: &QueueParams) -> Result<bool, SmqError> {
        let exists: bool = self
            .store
            .conn()
            .exists(QueueKeys::new(queue).properties())
            .await?;
        Ok(exists)
    }

    pub async fn try_get_properties(
        &self,
        queue: &QueueParams,
    ) -> Result<Option<QueueProperties>, SmqError> {
        let map: HashMap<String, String> = self
            .store
            .conn()
            .hgetall(QueueKeys::new(queue).properties())
            .await?;
        QueueProperties::from_hash(&map)
    }

    pub async fn get_properties(&self, queue: &QueueParams) -> Result<QueueProperties, SmqError> {
        self.try_get_properties(queue)
            .await?
            .ok_or_else(|| SmqError::QueueNotFound(queue.to_string()))
    }

    pub async fn counters(&self, queue: &QueueParams) -> Result<QueueCounters, SmqError> {
        Ok(self.get_properties(queue).await?.counters)
    }

    /// Every queue ever registered.
    pub async fn list(&self) -> Result<Vec<QueueParams>, SmqError> {
        let members = self.store.sscan_all(&keys::queues_set()).await?;
        members
            .iter()
            .map(|json| serde_json::from_str(json).map_err(SmqError::from))
            .collect()
    }

    #[tracing::instrument(level = "debug", skip(self), fields(queue = %queue))]
    pub async fn set_rate_limit(
        &self,
        queue: &QueueParams,
        rate_limit: QueueRateLimit,
    ) -> Result<(), SmqError> {
        rate_limit.validate()?;
        self.ensure_exists(queue).await?;
        let _: () = self
            .store
            .conn()
            .hset(
                QueueKeys::new(queue).properties(),
                fields::RATE_LIMIT,
                serde_json::to_string(&rate_limit)?,
            )
            .await?;
        tracing::info!(
            limit = rate_limit.limit,
            interval = rate_limit.interval,
            "Rate limit set"
        );
        Ok(())
    }

    pub async fn clear_rate_limit(&self, queue: &QueueParams) -> Result<(), SmqError> {
        self.ensure_exists(queue).await?;
        let _: () = self
            .store
            .conn()
            .hdel(QueueKeys::new(queue).properties(), fields::RATE_LIMIT)
            .await?;
        Ok(())
    }

    pub async fn get_rate_limit(
        &self,
        queue: &QueueParams,
    ) -> Result<Option<QueueRateLimit>, SmqError> {
        Ok(self.get_properties(queue).await?.rate_limit)
    }

    /// Register a consumer group on a pub/sub queue. Returns `false` if it already existed.
    pub async fn save_consumer_group(
        &self,
        queue: &QueueParams,
        group_id: &str,
    ) -> Result<bool, SmqError> {
        crate::queue::validate_name(group_id, "consumer group id")?;
        let properties = self.get_properties(queue).await?;
        if properties.delivery_model != DeliveryModel::PubSub {
            return Err(SmqError::ConsumerGroupIdNotSupported(queue.to_string()));
        }
        let added: i64 = self
            .store
            .conn()
            .sadd(QueueKeys::new(queue).consumer_groups(), group_id)
            .await?;
        if added == 1 {
            tracing::debug!(queue = %queue, group_id, "Consumer group registered");
        }
        Ok(added == 1)
    }

    pub async fn get_consumer_groups(&self, queue: &QueueParams) -> Result<Vec<String>, SmqError> {
        let mut groups: Vec<String> = self
            .store
            .conn()
            .smembers(QueueKeys::new(queue).consumer_groups())
            .await?;
        groups.sort();
        Ok(groups)
    }

    pub async fn consumer_group_exists(
        &self,
        queue: &QueueParams,
        group_id: &str,
    ) -> Result<bool, SmqError> {
        let exists: bool = self
            .store
            .conn()
            .sismember(QueueKeys::new(queue).consumer_groups(), group_id)
            .await?;
        Ok(exists)
    }

    /// Consumer id → registration payload of every consumer reading the queue.
    pub async fn get_consumers(
        &self,
        queue: &QueueParams,
    ) -> Result<HashMap<String, serde_json::Value>, SmqError> {
        let entries = self
            .store
            .hscan_all(&QueueKeys::new(queue).consumers())
            .await?;
        entries
            .into_iter()
            .map(|(id, json)| Ok((id, serde_json::from_str(&json)?)))
            .collect()
    }

    /// Processing list key → owning consumer id.
    pub async fn get_processing_queues(
        &self,
        queue: &QueueParams,
    ) -> Result<Vec<(String, String)>, SmqError> {
        self.store
            .hscan_all(&QueueKeys::new(queue).processing_queues())
            .await
    }

    /// Messages waiting for delivery to one target, across the pending list and priority set.
    pub async fn count_pending(&self, target: &ConsumerQueue) -> Result<u64, SmqError> {
        let keys = ConsumerQueueKeys::new(target);
        let (listed, prioritized): (u64, u64) = redis::pipe()
            .llen(keys.pending())
            .zcard(keys.priority())
            .query_async(&mut self.store.conn())
            .await?;
        Ok(listed + prioritized)
    }

    /// Most recent first, at most `limit` ids.
    pub async fn get_dead_lettered_ids(
        &self,
        queue: &QueueParams,
        limit: usize,
    ) -> Result<Vec<String>, SmqError> {
        self.archived_ids(&QueueKeys::new(queue).dead_lettered(), limit)
            .await
    }

    /// Most recent first, at most `limit` ids.
    pub async fn get_acknowledged_ids(
        &self,
        queue: &QueueParams,
        limit: usize,
    ) -> Result<Vec<String>, SmqError> {
        self.archived_ids(&QueueKeys::new(queue).acknowledged(), limit)
            .await
    }

    async fn archived_ids(&self, key: &str, limit: usize) -> Result<Vec<String>, SmqError> {
        // LRANGE 0 -1 would return the whole archive
        if limit == 0 {
            return Ok(Vec::new());
        }
        let stop = isize::try_from(limit - 1).unwrap_or(isize::MAX);
        let ids: Vec<String> = self.store.conn().lrange(key, 0, stop).await?;
        Ok(ids)
    }

    pub async fn get_message(
        &self,
        namespace: &str,
        message_id: &str,
    ) -> Result<Option<Message>, SmqError> {
        let map: HashMap<String, String> = self
            .store
            .conn()
            .hgetall(keys::message_key(namespace, message_id))
            .await?;
        if map.is_empty() {
            return Ok(None);
        }
        Message::from_hash(&map).map(Some)
    }

    async fn ensure_exists(&self, queue: &QueueParams) -> Result<(), SmqError> {
        if !self.exists(queue).await? {
            return Err(SmqError::QueueNotFound(queue.to_string()));
        }
        Ok(())
    }
}
