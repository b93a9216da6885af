use crate::{
    consumer::workers::enqueue_mode,
    error::SmqError,
    keys::{self, ConsumerQueueKeys, QueueKeys},
    message::{Message, ProducibleMessage},
    queue::{ConsumerQueue, DeliveryModel, QueueManager, QueueProperties, QueueType, fields},
    store::RedisStore,
};

/// Publishes messages. Cheap to clone; every clone shares the store.
#[derive(Clone)]
pub struct Producer {
    store: RedisStore,
    queues: QueueManager,
}

impl Producer {
    pub fn new(store: RedisStore) -> Self {
        Self {
            queues: QueueManager::new(store.clone()),
            store,
        }
    }

    pub async fn connect(redis_url: &str) -> Result<Self, SmqError> {
        Ok(Self::new(RedisStore::connect(redis_url).await?))
    }

    /// Publish a message and return the ids of the stored records: one for a
    /// point-to-point queue, one per targeted consumer group for a pub/sub queue.
    #[tracing::instrument(level = "debug", skip_all, fields(queue = %message.queue))]
    pub async fn produce(&self, message: ProducibleMessage) -> Result<Vec<String>, SmqError> {
        message.validate()?;
        let properties = self.queues.get_properties(&message.queue).await?;
        check_priority(&message, &properties)?;

        let destinations = self.destinations(&message, &properties).await?;
        let now = crate::now_ms();

        let mut ids = Vec::with_capacity(destinations.len());
        for destination in destinations {
            let record = message.into_message(destination, now);
            self.publish(&record, properties.queue_type).await?;
            ids.push(record.id);
        }

        tracing::debug!(count = ids.len(), "Message published");
        Ok(ids)
    }

    async fn destinations(
        &self,
        message: &ProducibleMessage,
        properties: &QueueProperties,
    ) -> Result<Vec<ConsumerQueue>, SmqError> {
        let queue = &message.queue;
        match (properties.delivery_model, &message.group_id) {
            (DeliveryModel::PointToPoint, None) => Ok(vec![queue.clone().into()]),
            (DeliveryModel::PointToPoint, Some(_)) => {
                Err(SmqError::ConsumerGroupIdNotSupported(queue.to_string()))
            }
            (DeliveryModel::PubSub, Some(group_id)) => {
                if !self.queues.consumer_group_exists(queue, group_id).await? {
                    return Err(SmqError::ConsumerGroupNotFound {
                        queue: queue.to_string(),
                        group_id: group_id.clone(),
                    });
                }
                Ok(vec![ConsumerQueue::new(queue.clone(), Some(group_id.clone()))])
            }
            (DeliveryModel::PubSub, None) => {
                let groups = self.queues.get_consumer_groups(queue).await?;
                if groups.is_empty() {
                    return Err(SmqError::QueueHasNoConsumerGroups(queue.to_string()));
                }
                Ok(groups
                    .into_iter()
                    .map(|group_id| ConsumerQueue::new(queue.clone(), Some(group_id)))
                    .collect())
            }
        }
    }

    async fn publish(&self, message: &Message, queue_type: QueueType) -> Result<(), SmqError> {
        let queue = &message.destination.queue;
        let queue_keys = QueueKeys::new(queue);

        let (target, mode, score, counter) = if message.is_scheduled() {
            let fire_at = message.state.scheduled_at.unwrap_or(message.state.published_at);
            (
                queue_keys.scheduled(),
                "ZADD",
                fire_at,
                fields::SCHEDULED_COUNT,
            )
        } else {
            let target_keys = ConsumerQueueKeys::new(&message.destination);
            let (mode, score) = enqueue_mode(queue_type, message);
            let target = if mode == "ZADD" {
                target_keys.priority()
            } else {
                target_keys.pending()
            };
            (target, mode, u64::from(score), fields::PENDING_COUNT)
        };

        let script = &self.store.scripts().publish_message;
        let mut invocation = script.prepare_invoke();
        invocation
            .key(queue_keys.properties())
            .key(&target)
            .key(keys::message_key(&queue.namespace, &message.id))
            .arg(mode)
            .arg(score)
            .arg(&message.id)
            .arg(counter);
        for (field, value) in message.to_fields() {
            invocation.arg(field).arg(value);
        }
        let reply: String = invocation.invoke_async(&mut self.store.conn()).await?;

        match reply.as_str() {
            "OK" => Ok(()),
            "QUEUE_NOT_FOUND" => Err(SmqError::QueueNotFound(queue.to_string())),
            other => Err(SmqError::UnexpectedScriptReply(format!(
                "publish of message {} returned {other}",
                message.id
            ))),
        }
    }
}

fn check_priority(message: &ProducibleMessage, properties: &QueueProperties) -> Result<(), SmqError> {
    let queue = message.queue.to_string();
    match (properties.queue_type, message.priority) {
        (QueueType::Priority, None) => Err(SmqError::PriorityRequired(queue)),
        (QueueType::Fifo | QueueType::Lifo, Some(_)) => Err(SmqError::PriorityNotSupported(queue)),
        _ => Ok(()),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{
        message::MessagePriority,
        queue::{QueueCounters, QueueParams, QueueState},
    };

    fn properties(queue_type: QueueType) -> QueueProperties {
        QueueProperties {
            queue_type,
            delivery_model: DeliveryModel::PointToPoint,
            state: QueueState::Active,
            state_changed_at: 0,
            rate_limit: None,
            counters: QueueCounters::default(),
        }
    }

    #[test]
    fn priority_is_required_exactly_on_priority_queues() {
        let plain = ProducibleMessage::new(QueueParams::new("ns", "q"), serde_json::Value::Null);
        let prioritized = plain.clone().with_priority(MessagePriority::High);

        assert!(check_priority(&prioritized, &properties(QueueType::Priority)).is_ok());
        assert!(check_priority(&plain, &properties(QueueType::Fifo)).is_ok());
        assert!(matches!(
            check_priority(&plain, &properties(QueueType::Priority)),
            Err(SmqError::PriorityRequired(_))
        ));
        assert!(matches!(
            check_priority(&prioritized, &properties(QueueType::Lifo)),
            Err(SmqError::PriorityNotSupported(_))
        ));
    }
}
