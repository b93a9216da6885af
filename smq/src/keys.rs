use crate::queue::{ConsumerQueue, QueueParams};

const PREFIX: &str = "smq";

/// Keys scoped to one queue, shared by all of its consumer groups.
#[derive(Debug, Clone)]
pub struct QueueKeys {
    base: String,
}

impl QueueKeys {
    pub fn new(queue: &QueueParams) -> Self {
        Self {
            base: format!("{PREFIX}:{}:q:{}", queue.namespace, queue.name),
        }
    }

    pub fn properties(&self) -> String {
        format!("{}:properties", self.base)
    }

    pub fn consumers(&self) -> String {
        format!("{}:consumers", self.base)
    }

    pub fn processing_queues(&self) -> String {
        format!("{}:processing_queues", self.base)
    }

    pub fn consumer_groups(&self) -> String {
        format!("{}:groups", self.base)
    }

    pub fn scheduled(&self) -> String {
        format!("{}:scheduled", self.base)
    }

    pub fn dead_lettered(&self) -> String {
        format!("{}:dead_lettered", self.base)
    }

    pub fn acknowledged(&self) -> String {
        format!("{}:acknowledged", self.base)
    }

    pub fn state_history(&self) -> String {
        format!("{}:state_history", self.base)
    }

    pub fn rate_limit_counter(&self, bucket: u64) -> String {
        format!("{}:rate_limit:{}", self.base, bucket)
    }

    pub fn reaper_lock(&self) -> String {
        format!("{}:lock:reaper", self.base)
    }
}

/// Keys scoped to one (queue, consumer group) delivery target.
#[derive(Debug, Clone)]
pub struct ConsumerQueueKeys {
    base: String,
    pub queue: QueueKeys,
}

impl ConsumerQueueKeys {
    pub fn new(target: &ConsumerQueue) -> Self {
        let queue = QueueKeys::new(&target.queue);
        let base = match &target.group_id {
            Some(group_id) => format!("{}:g:{}", queue.base, group_id),
            None => queue.base.clone(),
        };
        Self { base, queue }
    }

    pub fn pending(&self) -> String {
        format!("{}:pending", self.base)
    }

    pub fn priority(&self) -> String {
        format!("{}:priority", self.base)
    }

    pub fn delayed(&self) -> String {
        format!("{}:delayed", self.base)
    }

    pub fn requeued(&self) -> String {
        format!("{}:requeued", self.base)
    }

    pub fn processing(&self, consumer_id: &str) -> String {
        format!("{}:consumer:{}:processing", self.base, consumer_id)
    }
}

pub fn message_key_prefix(namespace: &str) -> String {
    format!("{PREFIX}:{namespace}:msg:")
}

pub fn message_key(namespace: &str, message_id: &str) -> String {
    format!("{}{}", message_key_prefix(namespace), message_id)
}

pub fn queues_set() -> String {
    format!("{PREFIX}:global:queues")
}

pub fn consumer_queues_set(consumer_id: &str) -> String {
    format!("{PREFIX}:global:consumer:{consumer_id}:queues")
}

pub fn heartbeat_key(consumer_id: &str) -> String {
    format!("{PREFIX}:global:consumer:{consumer_id}:heartbeat")
}

pub fn queue_state_channel() -> String {
    format!("{PREFIX}:global:events:queue_state")
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn group_keys_nest_under_queue() {
        let target = ConsumerQueue::new(QueueParams::new("ns1", "orders"), Some("billing".into()));
        let keys = ConsumerQueueKeys::new(&target);
        assert_eq!(keys.pending(), "smq:ns1:q:orders:g:billing:pending");
        assert_eq!(
            keys.processing("c1"),
            "smq:ns1:q:orders:g:billing:consumer:c1:processing"
        );
        // Queue level structures are shared across groups
        assert_eq!(keys.queue.dead_lettered(), "smq:ns1:q:orders:dead_lettered");
    }

    #[test]
    fn point_to_point_keys_have_no_group_segment() {
        let target = ConsumerQueue::new(QueueParams::new("ns1", "orders"), None);
        let keys = ConsumerQueueKeys::new(&target);
        assert_eq!(keys.requeued(), "smq:ns1:q:orders:requeued");
        assert_eq!(message_key("ns1", "abc"), "smq:ns1:msg:abc");
    }
}
