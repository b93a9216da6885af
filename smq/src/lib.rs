pub mod config;
pub mod consumer;
pub mod error;
pub mod events;
pub mod keys;
pub mod lifecycle;
pub mod lock;
pub mod message;
pub mod producer;
pub mod queue;
pub mod rate_limit;
pub mod scripts;
pub mod shutdown;
pub mod store;

use std::time::{SystemTime, UNIX_EPOCH};

pub use config::SmqConfig;
pub use consumer::{Consumer, ConsumerBuilder, ConsumerOptions, MessageConsumer};
pub use error::SmqError;
pub use events::ConsumerEvent;
pub use lifecycle::Runnable;
pub use message::{Message, MessagePriority, MessageStatus, ProducibleMessage};
pub use producer::Producer;
pub use queue::{
    ConsumerQueue, DeliveryModel, QueueManager, QueueParams, QueueState, QueueStateManager,
    QueueType,
};
pub use redis;
pub use store::RedisStore;

pub const DEFAULT_NAMESPACE: &str = "default";

/// Unix time in milliseconds.
pub(crate) fn now_ms() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_millis() as u64)
        .unwrap_or(0)
}
