use futures::{StreamExt, stream::BoxStream};
use serde::{Deserialize, Serialize};
use tokio::sync::broadcast;

use crate::{
    consumer::unack::UnackAction,
    error::SmqError,
    keys,
    message::{DeadLetterReason, UnackReason},
    queue::{ConsumerQueue, QueueParams, QueueStateTransition},
    store::RedisStore,
};

pub const CONSUMER_EVENTS_CAPACITY: usize = 1024;

/// Published on the queue state channel by every state transition.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct QueueStateChangedEvent {
    pub queue: QueueParams,
    pub transition: QueueStateTransition,
}

/// Subscribe to queue state changes of every queue.
///
/// Malformed payloads are logged and skipped. The stream ends when the connection drops.
pub async fn subscribe_queue_state(
    store: &RedisStore,
) -> Result<BoxStream<'static, QueueStateChangedEvent>, SmqError> {
    let mut pubsub = store.pubsub().await?;
    pubsub.subscribe(keys::queue_state_channel()).await?;

    let stream = pubsub.into_on_message().filter_map(|msg| async move {
        let payload: String = match msg.get_payload() {
            Ok(payload) => payload,
            Err(e) => {
                tracing::warn!(error = ?e, "Unreadable queue state event payload");
                return None;
            }
        };
        match serde_json::from_str::<QueueStateChangedEvent>(&payload) {
            Ok(event) => Some(event),
            Err(e) => {
                tracing::warn!(error = ?e, payload, "Malformed queue state event");
                None
            }
        }
    });
    Ok(stream.boxed())
}

/// In-process notifications emitted by a consumer and its handlers.
#[derive(Debug, Clone, PartialEq)]
pub enum ConsumerEvent {
    Up {
        consumer_id: String,
    },
    Down {
        consumer_id: String,
    },
    HeartbeatError {
        consumer_id: String,
        error: String,
    },
    MessageHandlerStarted {
        consumer_id: String,
        queue: ConsumerQueue,
    },
    MessageHandlerStopped {
        consumer_id: String,
        queue: ConsumerQueue,
    },
    MessageHandlerError {
        consumer_id: String,
        queue: ConsumerQueue,
        error: String,
    },
    MessageReceived {
        consumer_id: String,
        queue: ConsumerQueue,
        message_id: String,
    },
    MessageAcknowledged {
        consumer_id: String,
        queue: ConsumerQueue,
        message_id: String,
    },
    MessageUnacknowledged {
        consumer_id: String,
        queue: ConsumerQueue,
        message_id: String,
        reason: UnackReason,
        action: UnackAction,
        dead_letter_reason: Option<DeadLetterReason>,
    },
}

/// Broadcast sender shared by one consumer's components.
#[derive(Debug, Clone)]
pub struct EventBus {
    tx: broadcast::Sender<ConsumerEvent>,
}

impl EventBus {
    pub fn new() -> Self {
        let (tx, _) = broadcast::channel(CONSUMER_EVENTS_CAPACITY);
        Self { tx }
    }

    pub fn subscribe(&self) -> broadcast::Receiver<ConsumerEvent> {
        self.tx.subscribe()
    }

    /// Having no subscribers is fine.
    pub fn emit(&self, event: ConsumerEvent) {
        let _ = self.tx.send(event);
    }
}

impl Default for EventBus {
    fn default() -> Self {
        Self::new()
    }
}
