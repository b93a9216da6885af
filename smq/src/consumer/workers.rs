use std::{collections::HashMap, sync::Arc, time::Duration};

use tokio::sync::Mutex;
use tracing::Instrument;

use crate::{
    consumer::{runner::MessageHandlerRunner, heartbeat, unack::UnacknowledgementEngine},
    error::SmqError,
    keys::{self, ConsumerQueueKeys, QueueKeys},
    lifecycle::{Lifecycle, Runnable},
    lock::RedisLock,
    message::{Message, UnackReason},
    queue::{ConsumerQueue, QueueManager, QueueParams, QueueType},
    shutdown::WorkerHandle,
    store::RedisStore,
};

#[derive(Clone, Debug)]
pub struct MaintenanceOptions {
    pub interval: Duration,
    /// Messages moved per queue and structure in one pass
    pub batch_size: usize,
    pub reaper_lock_ttl: Duration,
    pub reaper_lock_attempts: u32,
    pub reaper_lock_retry_delay: Duration,
}

impl Default for MaintenanceOptions {
    fn default() -> Self {
        Self {
            interval: Duration::from_secs(1),
            batch_size: 100,
            reaper_lock_ttl: Duration::from_secs(30),
            reaper_lock_attempts: 2,
            reaper_lock_retry_delay: Duration::from_millis(100),
        }
    }
}

/// How a message id is pushed into a queue of the given type.
pub(crate) fn enqueue_mode(queue_type: QueueType, message: &Message) -> (&'static str, u8) {
    match queue_type {
        QueueType::Priority => ("ZADD", message.priority.map(|p| p.score()).unwrap_or(0)),
        QueueType::Lifo => ("RPUSH", 0),
        QueueType::Fifo => ("LPUSH", 0),
    }
}

/// Per consumer background upkeep of the queues it consumes: fires scheduled messages,
/// releases delayed and requeued messages, and reaps dead consumers.
pub struct MaintenanceWorker {
    inner: Arc<MaintenanceInner>,
    worker: Mutex<Option<WorkerHandle>>,
}

struct MaintenanceInner {
    lifecycle: Lifecycle,
    store: RedisStore,
    consumer_id: String,
    options: MaintenanceOptions,
    queues: QueueManager,
    unack: UnacknowledgementEngine,
    runner: Arc<MessageHandlerRunner>,
}

impl MaintenanceWorker {
    pub fn new(
        store: RedisStore,
        consumer_id: impl Into<String>,
        options: MaintenanceOptions,
        unack: UnacknowledgementEngine,
        runner: Arc<MessageHandlerRunner>,
    ) -> Self {
        let consumer_id = consumer_id.into();
        Self {
            inner: Arc::new(MaintenanceInner {
                lifecycle: Lifecycle::new(format!("maintenance:{consumer_id}")),
                queues: QueueManager::new(store.clone()),
                store,
                consumer_id,
                options,
                unack,
                runner,
            }),
            worker: Mutex::new(None),
        }
    }

    /// One full pass over every consumed queue.
    pub async fn run_once(&self) -> Result<(), SmqError> {
        self.inner.tick().await
    }

    pub async fn fire_scheduled(&self, queue: &QueueParams) -> Result<usize, SmqError> {
        self.inner.fire_scheduled(queue).await
    }

    pub async fn release(&self, target: &ConsumerQueue) -> Result<(usize, usize), SmqError> {
        self.inner.release(target).await
    }

    pub async fn reap(&self, queue: &QueueParams) -> Result<usize, SmqError> {
        self.inner.reap(queue).await
    }
}

impl Runnable for MaintenanceWorker {
    fn lifecycle(&self) -> &Lifecycle {
        &self.inner.lifecycle
    }

    async fn on_going_up(&self) -> Result<(), SmqError> {
        let inner = self.inner.clone();
        let span = tracing::debug_span!("smq_maintenance", consumer_id = inner.consumer_id);
        let worker = WorkerHandle::spawn(format!("maintenance:{}", inner.consumer_id), |mut shutdown_rx| {
            async move {
                let mut interval = tokio::time::interval(inner.options.interval);
                interval.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
                loop {
                    tokio::select! {
                        _ = &mut shutdown_rx => break,
                        _ = interval.tick() => {
                            if let Err(e) = inner.tick().await {
                                tracing::warn!(error = ?e, "Maintenance pass failed");
                            }
                        }
                    }
                }
                Ok(())
            }
            .instrument(span)
        });
        *self.worker.lock().await = Some(worker);
        Ok(())
    }

    async fn on_going_down(&self) -> Result<(), SmqError> {
        if let Some(worker) = self.worker.lock().await.take() {
            worker.shutdown().await?;
        }
        Ok(())
    }
}

impl MaintenanceInner {
    async fn tick(&self) -> Result<(), SmqError> {
        let targets = self.runner.get_queues().await;
        let mut queues: Vec<QueueParams> = targets.iter().map(|t| t.queue.clone()).collect();
        queues.sort_by(|a, b| (&a.namespace, &a.name).cmp(&(&b.namespace, &b.name)));
        queues.dedup();

        for queue in &queues {
            self.lifecycle.ensure_active()?;
            self.fire_scheduled(queue).await?;
            self.reap(queue).await?;
        }
        for target in &targets {
            self.lifecycle.ensure_active()?;
            self.release(target).await?;
        }
        Ok(())
    }

    /// Move due scheduled messages to their pending structure. Repeating messages mint a
    /// fresh message per firing and stay scheduled until their repeats are used up.
    async fn fire_scheduled(&self, queue: &QueueParams) -> Result<usize, SmqError> {
        let Some(properties) = self.queues.try_get_properties(queue).await? else {
            return Ok(0);
        };
        let queue_keys = QueueKeys::new(queue);
        let now = crate::now_ms();

        let due: Vec<String> = redis::cmd("ZRANGEBYSCORE")
            .arg(queue_keys.scheduled())
            .arg(0)
            .arg(now)
            .arg("LIMIT")
            .arg(0)
            .arg(self.options.batch_size)
            .query_async(&mut self.store.conn())
            .await?;

        let mut fired = 0;
        for id in due {
            let origin_key = keys::message_key(&queue.namespace, &id);
            let record: HashMap<String, String> = redis::cmd("HGETALL")
                .arg(&origin_key)
                .query_async(&mut self.store.conn())
                .await?;
            if record.is_empty() {
                tracing::warn!(message_id = id, "Scheduled message has no record, unscheduling");
                let _: i64 = redis::cmd("ZREM")
                    .arg(queue_keys.scheduled())
                    .arg(&id)
                    .query_async(&mut self.store.conn())
                    .await?;
                continue;
            }
            let message = Message::from_hash(&record)?;
            let target = ConsumerQueueKeys::new(&message.destination);
            let (mode, score) = enqueue_mode(properties.queue_type, &message);
            let destination = if mode == "ZADD" {
                target.priority()
            } else {
                target.pending()
            };

            let moved: i64 = if message.is_periodic() {
                let child = message.spawn_child(now);
                let next_fire = message.next_fire_at(now).unwrap_or(0);
                let script = &self.store.scripts().fire_periodic_message;
                let mut invocation = script.prepare_invoke();
                invocation
                    .key(queue_keys.scheduled())
                    .key(&destination)
                    .key(queue_keys.properties())
                    .key(&origin_key)
                    .key(keys::message_key(&queue.namespace, &child.id))
                    .arg(&message.id)
                    .arg(&child.id)
                    .arg(mode)
                    .arg(score)
                    .arg(now)
                    .arg(next_fire);
                for (field, value) in child.to_fields() {
                    invocation.arg(field).arg(value);
                }
                invocation.invoke_async(&mut self.store.conn()).await?
            } else {
                self.store
                    .scripts()
                    .fire_scheduled_message
                    .key(queue_keys.scheduled())
                    .key(&destination)
                    .key(queue_keys.properties())
                    .key(&origin_key)
                    .arg(&message.id)
                    .arg(mode)
                    .arg(score)
                    .arg(now)
                    .invoke_async(&mut self.store.conn())
                    .await?
            };

            if moved == 1 {
                tracing::debug!(queue = %queue, message_id = message.id, "Scheduled message fired");
                fired += 1;
            }
        }
        Ok(fired)
    }

    /// Returns the number of (delayed, requeued) messages put back in line.
    async fn release(&self, target: &ConsumerQueue) -> Result<(usize, usize), SmqError> {
        let keys = ConsumerQueueKeys::new(target);
        let (delayed, requeued): (usize, usize) = self
            .store
            .scripts()
            .release_delayed_and_requeued
            .key(keys.delayed())
            .key(keys.requeued())
            .key(keys.pending())
            .key(keys.priority())
            .key(keys.queue.properties())
            .arg(crate::now_ms())
            .arg(keys::message_key_prefix(&target.queue.namespace))
            .arg(self.options.batch_size)
            .invoke_async(&mut self.store.conn())
            .await?;

        if delayed + requeued > 0 {
            tracing::debug!(queue = %target, delayed, requeued, "Released messages");
        }
        Ok((delayed, requeued))
    }

    /// Hand back the messages of consumers whose heartbeat expired and drop their
    /// registrations. Returns the number of consumers reaped.
    async fn reap(&self, queue: &QueueParams) -> Result<usize, SmqError> {
        let lock = RedisLock::new(
            self.store.clone(),
            QueueKeys::new(queue).reaper_lock(),
            self.options.reaper_lock_ttl,
        );
        match lock
            .acquire_with_retry(
                self.options.reaper_lock_attempts,
                self.options.reaper_lock_retry_delay,
                &self.lifecycle,
            )
            .await
        {
            Ok(()) => {}
            // Someone else is reaping this queue
            Err(SmqError::LockNotAcquired(_)) => return Ok(0),
            Err(e) => return Err(e),
        }

        let result = self.reap_locked(queue).await;
        if let Err(e) = lock.release().await {
            tracing::warn!(lock = lock.key(), error = ?e, "Failed to release reaper lock");
        }
        result
    }

    async fn reap_locked(&self, queue: &QueueParams) -> Result<usize, SmqError> {
        let consumers: Vec<String> = self
            .queues
            .get_consumers(queue)
            .await?
            .into_keys()
            .filter(|id| id != &self.consumer_id)
            .collect();
        let alive = heartbeat::is_consumer_list_alive(&self.store, &consumers).await?;

        let mut reaped = 0;
        for (consumer_id, is_alive) in alive {
            if is_alive {
                continue;
            }
            let status = self
                .unack
                .unacknowledge_messages_in_process(
                    &consumer_id,
                    None,
                    UnackReason::OfflineConsumer,
                    true,
                )
                .await?;
            let _: i64 = redis::cmd("DEL")
                .arg(keys::consumer_queues_set(&consumer_id))
                .query_async(&mut self.store.conn())
                .await?;
            tracing::info!(
                queue = %queue,
                dead_consumer_id = consumer_id,
                messages = status.len(),
                "Reaped offline consumer"
            );
            reaped += 1;
        }
        Ok(reaped)
    }
}

#[cfg(test)]
mod tests {
    use std::time::Duration;

    use super::*;
    use crate::message::{MessagePriority, ProducibleMessage};

    #[test]
    fn enqueue_mode_follows_queue_type() {
        let queue = QueueParams::new("ns", "q");
        let message = ProducibleMessage::new(queue.clone(), serde_json::Value::Null)
            .with_priority(MessagePriority::Low)
            .with_ttl(Duration::ZERO)
            .into_message(queue.into(), 0);

        assert_eq!(enqueue_mode(QueueType::Priority, &message), ("ZADD", 6));
        assert_eq!(enqueue_mode(QueueType::Lifo, &message), ("RPUSH", 0));
        assert_eq!(enqueue_mode(QueueType::Fifo, &message), ("LPUSH", 0));
    }
}
