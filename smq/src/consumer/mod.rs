pub mod builder;
pub mod dequeuer;
pub mod handler;
pub mod heartbeat;
pub mod runner;
pub mod unack;
pub mod workers;

use std::sync::Arc;

use serde::{Deserialize, Serialize};
use tokio::sync::broadcast;
use uuid::Uuid;

use crate::{
    config::MessagesConfig,
    error::SmqError,
    events::{ConsumerEvent, EventBus},
    lifecycle::{Lifecycle, Runnable},
    queue::ConsumerQueue,
    store::RedisStore,
};

pub use builder::ConsumerBuilder;
pub use dequeuer::DequeuerOptions;
pub use handler::{ConsumeError, ConsumeResult, MessageConsumer, MessageHandlerConfig};
pub use heartbeat::HeartbeatOptions;
pub use runner::{MessageHandlerRunner, RunnerOptions};
pub use workers::MaintenanceOptions;

use handler::HandlerContext;
use heartbeat::Heartbeat;
use unack::UnacknowledgementEngine;
use workers::MaintenanceWorker;

#[derive(Clone, Debug, Default)]
pub struct ConsumerOptions {
    pub heartbeat: HeartbeatOptions,
    pub dequeuer: DequeuerOptions,
    pub runner: RunnerOptions,
    pub maintenance: MaintenanceOptions,
    pub messages: MessagesConfig,
}

/// Registration payload stored in the consumers hash of every consumed queue.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ConsumerInfo {
    pub hostname: String,
    pub pid: u32,
    pub created_at: u64,
}

impl ConsumerInfo {
    fn current() -> Self {
        Self {
            hostname: sysinfo::System::host_name().unwrap_or_default(),
            pid: std::process::id(),
            created_at: crate::now_ms(),
        }
    }
}

/// Consumes messages from any number of queues. Owns a heartbeat, the handler
/// runner and the maintenance worker, and starts and stops them together.
pub struct Consumer {
    id: String,
    lifecycle: Lifecycle,
    store: RedisStore,
    events: EventBus,
    heartbeat: Heartbeat,
    runner: Arc<MessageHandlerRunner>,
    maintenance: MaintenanceWorker,
}

impl Consumer {
    pub fn builder() -> ConsumerBuilder<builder::NoRedis> {
        ConsumerBuilder::new()
    }

    pub fn new(store: RedisStore, options: ConsumerOptions) -> Result<Self, SmqError> {
        let id = Uuid::new_v4().to_string();
        let events = EventBus::new();
        let info = serde_json::to_string(&ConsumerInfo::current())?;
        let unack = UnacknowledgementEngine::new(store.clone(), options.messages.store.dead_lettered);

        let ctx = HandlerContext {
            store: store.clone(),
            consumer_id: id.clone(),
            consumer_info: info,
            events: events.clone(),
            unack: unack.clone(),
            acknowledged: options.messages.store.acknowledged,
            dequeuer: options.dequeuer,
        };
        let runner = Arc::new(MessageHandlerRunner::new(ctx, options.runner));

        Ok(Self {
            lifecycle: Lifecycle::new(format!("consumer:{id}")),
            heartbeat: Heartbeat::new(store.clone(), id.clone(), options.heartbeat, events.clone()),
            maintenance: MaintenanceWorker::new(
                store.clone(),
                id.clone(),
                options.maintenance,
                unack,
                runner.clone(),
            ),
            runner,
            store,
            events,
            id,
        })
    }

    pub fn id(&self) -> &str {
        &self.id
    }

    pub fn store(&self) -> &RedisStore {
        &self.store
    }

    pub fn subscribe_events(&self) -> broadcast::Receiver<ConsumerEvent> {
        self.events.subscribe()
    }

    /// Register a handler for `target`. If the consumer is running it starts right away.
    pub async fn consume(
        &self,
        target: impl Into<ConsumerQueue>,
        consumer: impl MessageConsumer,
    ) -> Result<(), SmqError> {
        let target = target.into();
        target.validate()?;
        self.runner
            .add_message_handler(MessageHandlerConfig::new(target, consumer))
            .await
    }

    /// Stop consuming `target`. Does nothing if it was not consumed.
    pub async fn cancel(&self, target: impl Into<ConsumerQueue>) -> Result<(), SmqError> {
        self.runner.remove_message_handler(&target.into()).await
    }

    pub async fn get_queues(&self) -> Vec<ConsumerQueue> {
        self.runner.get_queues().await
    }

    pub fn runner(&self) -> &MessageHandlerRunner {
        &self.runner
    }

    pub fn maintenance(&self) -> &MaintenanceWorker {
        &self.maintenance
    }
}

impl Runnable for Consumer {
    fn lifecycle(&self) -> &Lifecycle {
        &self.lifecycle
    }

    async fn on_going_up(&self) -> Result<(), SmqError> {
        self.heartbeat.run().await?;
        self.runner.run().await?;
        self.maintenance.run().await?;

        tracing::info!(consumer_id = self.id, "Consumer is up");
        self.events.emit(ConsumerEvent::Up {
            consumer_id: self.id.clone(),
        });
        Ok(())
    }

    async fn on_going_down(&self) -> Result<(), SmqError> {
        let mut first_error = None;
        if let Err(e) = self.maintenance.shutdown().await {
            first_error.get_or_insert(e);
        }
        if let Err(e) = self.runner.shutdown().await {
            first_error.get_or_insert(e);
        }
        // Last, so the consumer is never reaped while it still holds messages
        if let Err(e) = self.heartbeat.shutdown().await {
            first_error.get_or_insert(e);
        }

        tracing::info!(consumer_id = self.id, "Consumer is down");
        self.events.emit(ConsumerEvent::Down {
            consumer_id: self.id.clone(),
        });
        match first_error {
            Some(e) => Err(e),
            None => Ok(()),
        }
    }
}
