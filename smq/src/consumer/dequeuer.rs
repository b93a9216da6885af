use std::{
    sync::atomic::{AtomicU32, Ordering},
    time::Duration,
};

use redis::aio::MultiplexedConnection;
use tokio::sync::Mutex;

use crate::{
    error::SmqError,
    keys::{self, ConsumerQueueKeys},
    lifecycle::{Lifecycle, Runnable},
    queue::{ConsumerQueue, DeliveryModel, QueueManager, QueueProperties, QueueType},
    rate_limit::RateLimiter,
    store::{ListDirection, RedisStore},
};

#[derive(Clone, Debug)]
pub struct DequeuerOptions {
    /// Use BLMOVE/BRPOPLPUSH on a dedicated connection instead of polling
    pub blocking: bool,
    /// Server side wait of one blocking dequeue, zero blocks indefinitely
    pub blocking_timeout: Duration,
    /// Consecutive empty dequeues before backing off
    pub idle_threshold: u32,
    pub idle_backoff: Duration,
    /// Pause after the queue rate limit was hit
    pub rate_limit_backoff: Duration,
}

impl Default for DequeuerOptions {
    fn default() -> Self {
        Self {
            blocking: true,
            blocking_timeout: Duration::ZERO,
            idle_threshold: 5,
            idle_backoff: Duration::from_secs(1),
            rate_limit_backoff: Duration::from_secs(1),
        }
    }
}

/// Counts consecutive empty dequeues.
#[derive(Debug)]
pub struct IdleCounter {
    threshold: u32,
    count: AtomicU32,
}

impl IdleCounter {
    pub fn new(threshold: u32) -> Self {
        Self {
            threshold: threshold.max(1),
            count: AtomicU32::new(0),
        }
    }

    /// Record an empty cycle. Returns true, and starts over, once the threshold is reached.
    pub fn record_empty(&self) -> bool {
        let count = self.count.fetch_add(1, Ordering::SeqCst) + 1;
        if count >= self.threshold {
            self.reset();
            return true;
        }
        false
    }

    pub fn reset(&self) {
        self.count.store(0, Ordering::SeqCst);
    }

    pub fn count(&self) -> u32 {
        self.count.load(Ordering::SeqCst)
    }
}

/// Check a consumer target against the queue delivery model.
pub fn validate_delivery_model(
    target: &ConsumerQueue,
    delivery_model: DeliveryModel,
) -> Result<(), SmqError> {
    match (delivery_model, &target.group_id) {
        (DeliveryModel::PointToPoint, Some(_)) => Err(SmqError::ConsumerGroupIdNotSupported(
            target.queue.to_string(),
        )),
        (DeliveryModel::PubSub, None) => {
            Err(SmqError::ConsumerGroupIdRequired(target.queue.to_string()))
        }
        _ => Ok(()),
    }
}

/// Moves message ids from one delivery target into a consumer's processing list.
pub struct Dequeuer {
    lifecycle: Lifecycle,
    store: RedisStore,
    consumer_id: String,
    consumer_info: String,
    target: ConsumerQueue,
    keys: ConsumerQueueKeys,
    options: DequeuerOptions,
    queues: QueueManager,
    rate_limiter: RateLimiter,
    properties: Mutex<Option<QueueProperties>>,
    blocking_conn: Mutex<Option<BlockingConnection>>,
    idle: IdleCounter,
}

/// The dedicated connection of blocking dequeues, with its server side client id.
#[derive(Clone)]
struct BlockingConnection {
    conn: MultiplexedConnection,
    client_id: i64,
}

impl Dequeuer {
    pub fn new(
        store: RedisStore,
        consumer_id: impl Into<String>,
        consumer_info: impl Into<String>,
        target: ConsumerQueue,
        options: DequeuerOptions,
    ) -> Self {
        let keys = ConsumerQueueKeys::new(&target);
        Self {
            lifecycle: Lifecycle::new(format!("dequeuer:{target}")),
            queues: QueueManager::new(store.clone()),
            rate_limiter: RateLimiter::new(store.clone()),
            store,
            consumer_id: consumer_id.into(),
            consumer_info: consumer_info.into(),
            target,
            keys,
            idle: IdleCounter::new(options.idle_threshold),
            options,
            properties: Mutex::new(None),
            blocking_conn: Mutex::new(None),
        }
    }

    pub fn target(&self) -> &ConsumerQueue {
        &self.target
    }

    pub fn processing_key(&self) -> String {
        self.keys.processing(&self.consumer_id)
    }

    pub fn idle_count(&self) -> u32 {
        self.idle.count()
    }

    /// Move the next message into processing. `None` when the queue was empty or rate limited.
    pub async fn dequeue(&self) -> Result<Option<String>, SmqError> {
        self.lifecycle.ensure_active()?;

        let properties = self
            .properties
            .lock()
            .await
            .clone()
            .ok_or_else(|| SmqError::runtime("dequeuer has no queue properties"))?;

        if let Some(rate_limit) = &properties.rate_limit {
            if self
                .rate_limiter
                .has_exceeded(&self.keys.queue, rate_limit, crate::now_ms())
                .await?
            {
                tracing::trace!(queue = %self.target, "Rate limit exceeded, deferring");
                tokio::time::sleep(self.options.rate_limit_backoff).await;
                return Ok(None);
            }
        }

        let processing = self.processing_key();
        let message_id = if properties.queue_type == QueueType::Priority {
            let moved: Option<String> = self
                .store
                .scripts()
                .dequeue_priority
                .key(self.keys.priority())
                .key(&processing)
                .invoke_async(&mut self.store.conn())
                .await?;
            moved
        } else if self.options.blocking {
            let BlockingConnection { mut conn, .. } = self.blocking_connection().await?;
            self.store
                .blocking_move(
                    &mut conn,
                    &self.keys.pending(),
                    &processing,
                    self.options.blocking_timeout.as_secs_f64(),
                )
                .await?
        } else {
            self.store
                .lmove(&self.keys.pending(), &processing, ListDirection::RightToLeft)
                .await?
        };

        match message_id {
            Some(id) => {
                self.idle.reset();
                Ok(Some(id))
            }
            None => {
                if self.idle.record_empty() {
                    tracing::trace!(queue = %self.target, "Queue idle, backing off");
                    tokio::time::sleep(self.options.idle_backoff).await;
                }
                Ok(None)
            }
        }
    }

    /// Make a blocked dequeue return empty-handed. The move either happened before
    /// the unblock or not at all, so nothing is lost in between.
    pub async fn interrupt_blocking(&self) -> Result<(), SmqError> {
        let client_id = match self.blocking_conn.lock().await.as_ref() {
            Some(blocking) => blocking.client_id,
            None => return Ok(()),
        };
        let unblocked: i64 = redis::cmd("CLIENT")
            .arg("UNBLOCK")
            .arg(client_id)
            .query_async(&mut self.store.conn())
            .await?;
        if unblocked == 1 {
            tracing::debug!(queue = %self.target, "Blocked dequeue interrupted");
        }
        Ok(())
    }

    /// Only call once no dequeue is in flight.
    pub async fn close_blocking_connection(&self) {
        self.blocking_conn.lock().await.take();
    }

    async fn blocking_connection(&self) -> Result<BlockingConnection, SmqError> {
        let mut slot = self.blocking_conn.lock().await;
        if let Some(blocking) = slot.as_ref() {
            return Ok(blocking.clone());
        }
        let mut conn = self.store.dedicated_connection().await?;
        let client_id: i64 = redis::cmd("CLIENT").arg("ID").query_async(&mut conn).await?;
        let blocking = BlockingConnection { conn, client_id };
        *slot = Some(blocking.clone());
        Ok(blocking)
    }

    async fn register(&self) -> Result<(), SmqError> {
        let keys = &self.keys.queue;
        let registered: i64 = self
            .store
            .scripts()
            .init_consumer_queue
            .key(keys.properties())
            .key(keys.consumers())
            .key(keys.processing_queues())
            .key(keys::queues_set())
            .key(keys::consumer_queues_set(&self.consumer_id))
            .key(keys.consumer_groups())
            .arg(&self.consumer_id)
            .arg(&self.consumer_info)
            .arg(self.processing_key())
            .arg(serde_json::to_string(&self.target.queue)?)
            .arg(serde_json::to_string(&self.target)?)
            .arg(self.target.group_id.as_deref().unwrap_or(""))
            .invoke_async(&mut self.store.conn())
            .await?;

        if registered == 0 {
            return Err(SmqError::QueueNotFound(self.target.queue.to_string()));
        }
        Ok(())
    }

    async fn unregister(&self, force: bool) -> Result<(), SmqError> {
        let keys = &self.keys.queue;
        let _: i64 = self
            .store
            .scripts()
            .unregister_consumer_queue
            .key(keys.consumers())
            .key(keys.processing_queues())
            .key(keys::consumer_queues_set(&self.consumer_id))
            .arg(&self.consumer_id)
            .arg(self.processing_key())
            .arg(serde_json::to_string(&self.target)?)
            .arg(if force { "1" } else { "0" })
            .invoke_async(&mut self.store.conn())
            .await?;
        Ok(())
    }
}

impl Runnable for Dequeuer {
    fn lifecycle(&self) -> &Lifecycle {
        &self.lifecycle
    }

    async fn on_going_up(&self) -> Result<(), SmqError> {
        self.target.validate()?;
        let properties = self.queues.get_properties(&self.target.queue).await?;
        validate_delivery_model(&self.target, properties.delivery_model)?;

        if let Some(group_id) = &self.target.group_id {
            self.queues
                .save_consumer_group(&self.target.queue, group_id)
                .await?;
        }

        self.register().await?;
        *self.properties.lock().await = Some(properties);
        self.idle.reset();

        tracing::debug!(
            consumer_id = self.consumer_id,
            queue = %self.target,
            "Dequeuer registered"
        );
        Ok(())
    }

    async fn on_going_down(&self) -> Result<(), SmqError> {
        self.close_blocking_connection().await;
        self.properties.lock().await.take();
        self.unregister(false).await
    }
}
