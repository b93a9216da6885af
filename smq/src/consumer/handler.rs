use std::{
    collections::HashMap,
    fmt,
    future::Future,
    sync::{
        Arc,
        atomic::{AtomicU64, Ordering},
    },
    time::Duration,
};

use futures::future::BoxFuture;
use tokio::sync::{Mutex, mpsc, oneshot};
use tracing::Instrument;

use crate::{
    config::StoreConfig,
    consumer::{
        dequeuer::{Dequeuer, DequeuerOptions},
        unack::UnacknowledgementEngine,
    },
    error::SmqError,
    events::{ConsumerEvent, EventBus},
    keys::{self, ConsumerQueueKeys},
    lifecycle::{Lifecycle, Runnable},
    message::{Message, UnackReason},
    queue::ConsumerQueue,
    shutdown::WorkerHandle,
    store::RedisStore,
};

pub type ConsumeError = Box<dyn std::error::Error + Send + Sync>;
pub type ConsumeResult = Result<(), ConsumeError>;

/// User code invoked for every delivered message. `Ok` acknowledges the message,
/// an error or a panic hands it back for retry or dead-lettering.
pub trait MessageConsumer: Send + Sync + 'static {
    fn consume(&self, message: Message) -> BoxFuture<'static, ConsumeResult>;
}

impl<F, Fut> MessageConsumer for F
where
    F: Fn(Message) -> Fut + Send + Sync + 'static,
    Fut: Future<Output = ConsumeResult> + Send + 'static,
{
    fn consume(&self, message: Message) -> BoxFuture<'static, ConsumeResult> {
        Box::pin(self(message))
    }
}

/// A delivery target together with the code consuming it.
#[derive(Clone)]
pub struct MessageHandlerConfig {
    pub target: ConsumerQueue,
    pub consumer: Arc<dyn MessageConsumer>,
}

impl MessageHandlerConfig {
    pub fn new(target: ConsumerQueue, consumer: impl MessageConsumer) -> Self {
        Self {
            target,
            consumer: Arc::new(consumer),
        }
    }
}

impl fmt::Debug for MessageHandlerConfig {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("MessageHandlerConfig")
            .field("target", &self.target)
            .finish_non_exhaustive()
    }
}

/// A handler that stopped on its own because of an error.
#[derive(Debug)]
pub(crate) struct HandlerFailure {
    pub target: ConsumerQueue,
    pub instance: u64,
    pub error: String,
}

static NEXT_INSTANCE: AtomicU64 = AtomicU64::new(1);

/// How often a shutting down handler unblocks its dequeue until the loop has exited
const INTERRUPT_INTERVAL: Duration = Duration::from_millis(100);

/// Everything a handler borrows from its consumer.
#[derive(Clone)]
pub(crate) struct HandlerContext {
    pub store: RedisStore,
    pub consumer_id: String,
    pub consumer_info: String,
    pub events: EventBus,
    pub unack: UnacknowledgementEngine,
    pub acknowledged: StoreConfig,
    pub dequeuer: DequeuerOptions,
}

enum Outcome {
    Consumed,
    Failed(UnackReason),
}

struct HandlerInner {
    lifecycle: Lifecycle,
    instance: u64,
    ctx: HandlerContext,
    target: ConsumerQueue,
    keys: ConsumerQueueKeys,
    dequeuer: Dequeuer,
    consumer: Arc<dyn MessageConsumer>,
    failures: mpsc::UnboundedSender<HandlerFailure>,
}

/// One running instance of a message handler: a dequeuer plus the processing loop.
pub struct MessageHandler {
    inner: Arc<HandlerInner>,
    worker: Mutex<Option<WorkerHandle>>,
}

impl MessageHandler {
    pub(crate) fn new(
        ctx: HandlerContext,
        config: &MessageHandlerConfig,
        failures: mpsc::UnboundedSender<HandlerFailure>,
    ) -> Self {
        let target = config.target.clone();
        let dequeuer = Dequeuer::new(
            ctx.store.clone(),
            ctx.consumer_id.clone(),
            ctx.consumer_info.clone(),
            target.clone(),
            ctx.dequeuer.clone(),
        );
        Self {
            inner: Arc::new(HandlerInner {
                lifecycle: Lifecycle::new(format!("message-handler:{target}")),
                instance: NEXT_INSTANCE.fetch_add(1, Ordering::Relaxed),
                keys: ConsumerQueueKeys::new(&target),
                target,
                dequeuer,
                consumer: config.consumer.clone(),
                failures,
                ctx,
            }),
            worker: Mutex::new(None),
        }
    }

    pub fn target(&self) -> &ConsumerQueue {
        &self.inner.target
    }

    /// Unique per instance, so a restarted handler is told apart from the one it replaced.
    pub fn instance(&self) -> u64 {
        self.inner.instance
    }
}

impl Runnable for MessageHandler {
    fn lifecycle(&self) -> &Lifecycle {
        &self.inner.lifecycle
    }

    async fn on_going_up(&self) -> Result<(), SmqError> {
        self.inner.dequeuer.run().await?;

        let inner = self.inner.clone();
        let span = tracing::info_span!(
            "smq_handler",
            consumer_id = inner.ctx.consumer_id,
            queue = %inner.target
        );
        let worker = WorkerHandle::spawn(format!("message-handler:{}", inner.target), |rx| {
            inner.run_loop(rx).instrument(span)
        });
        *self.worker.lock().await = Some(worker);

        self.inner.ctx.events.emit(ConsumerEvent::MessageHandlerStarted {
            consumer_id: self.inner.ctx.consumer_id.clone(),
            queue: self.inner.target.clone(),
        });
        Ok(())
    }

    /// Stop dequeuing, let the in-flight message finish, hand back whatever is left in
    /// processing, then unregister.
    async fn on_going_down(&self) -> Result<(), SmqError> {
        let inner = &self.inner;
        let mut first_error = None;

        if let Some(worker) = self.worker.lock().await.take() {
            let stopped = worker.shutdown();
            tokio::pin!(stopped);
            // A blocked dequeue only returns when the server lets go of it
            loop {
                if let Err(e) = inner.dequeuer.interrupt_blocking().await {
                    tracing::warn!(queue = %inner.target, error = ?e, "Failed to interrupt blocked dequeue");
                }
                tokio::select! {
                    result = &mut stopped => {
                        if let Err(e) = result {
                            first_error.get_or_insert(e);
                        }
                        break;
                    }
                    _ = tokio::time::sleep(INTERRUPT_INTERVAL) => {}
                }
            }
        }

        // The loop has exited, no move into processing can land after this point
        inner.dequeuer.close_blocking_connection().await;

        if let Err(e) = inner
            .ctx
            .unack
            .unacknowledge_messages_in_process(
                &inner.ctx.consumer_id,
                Some(std::slice::from_ref(&inner.target)),
                UnackReason::OfflineMessageHandler,
                false,
            )
            .await
        {
            tracing::error!(queue = %inner.target, error = ?e, "Failed to hand back in-process messages");
            first_error.get_or_insert(e);
        }

        if let Err(e) = inner.dequeuer.shutdown().await {
            first_error.get_or_insert(e);
        }

        inner.ctx.events.emit(ConsumerEvent::MessageHandlerStopped {
            consumer_id: inner.ctx.consumer_id.clone(),
            queue: inner.target.clone(),
        });

        match first_error {
            Some(e) => Err(e),
            None => Ok(()),
        }
    }
}

fn shutdown_requested(shutdown_rx: &mut oneshot::Receiver<()>) -> bool {
    !matches!(
        shutdown_rx.try_recv(),
        Err(oneshot::error::TryRecvError::Empty)
    )
}

impl HandlerInner {
    /// Dequeues are never cancelled half way: a move the server already made must
    /// be visible in processing when the handler hands messages back.
    async fn run_loop(self: Arc<Self>, mut shutdown_rx: oneshot::Receiver<()>) -> Result<(), SmqError> {
        tracing::info!("Message handler started");
        loop {
            if shutdown_requested(&mut shutdown_rx) {
                tracing::debug!("Shutdown signal received");
                break;
            }
            match self.dequeuer.dequeue().await {
                Ok(Some(message_id)) => {
                    if shutdown_requested(&mut shutdown_rx) {
                        tracing::debug!(message_id, "Shutdown signal received, leaving message for hand back");
                        break;
                    }
                    let span = tracing::debug_span!("smq_message", message_id);
                    if let Err(e) = self.handle_message(&message_id).instrument(span).await {
                        self.report_failure(e);
                        break;
                    }
                }
                Ok(None) => {}
                Err(SmqError::Aborted(_)) => break,
                Err(e) => {
                    self.report_failure(e);
                    break;
                }
            }
        }
        Ok(())
    }

    fn report_failure(&self, error: SmqError) {
        tracing::error!(error = ?error, "Message handler failed");
        self.ctx.events.emit(ConsumerEvent::MessageHandlerError {
            consumer_id: self.ctx.consumer_id.clone(),
            queue: self.target.clone(),
            error: error.to_string(),
        });
        // The runner may already be gone during shutdown
        let _ = self.failures.send(HandlerFailure {
            target: self.target.clone(),
            instance: self.instance,
            error: error.to_string(),
        });
    }

    async fn handle_message(&self, message_id: &str) -> Result<(), SmqError> {
        let now = crate::now_ms();
        let namespace = &self.target.queue.namespace;
        let store = &self.ctx.store;

        let record: HashMap<String, String> = store
            .scripts()
            .fetch_for_processing
            .key(keys::message_key(namespace, message_id))
            .key(self.keys.queue.properties())
            .key(self.dequeuer.processing_key())
            .arg(now)
            .arg(message_id)
            .invoke_async(&mut store.conn())
            .await?;

        // The script already dropped the id from processing
        if record.is_empty() {
            tracing::warn!("Dequeued message has no record, dropped it");
            return Ok(());
        }

        let message = Message::from_hash(&record)?;
        self.ctx.events.emit(ConsumerEvent::MessageReceived {
            consumer_id: self.ctx.consumer_id.clone(),
            queue: self.target.clone(),
            message_id: message.id.clone(),
        });

        if message.has_expired(now) {
            tracing::debug!("Message expired before delivery");
            return self.unacknowledge(&message, UnackReason::TtlExpired).await;
        }

        match self.consume(message.clone()).await {
            Outcome::Consumed => self.acknowledge(&message).await,
            Outcome::Failed(reason) => self.unacknowledge(&message, reason).await,
        }
    }

    /// Run user code in its own task so a panic only fails this message.
    async fn consume(&self, message: Message) -> Outcome {
        let consumer = self.consumer.clone();
        let timeout = message.consume_timeout;
        let mut task = tokio::spawn(async move { consumer.consume(message).await });

        let joined = if timeout > 0 {
            match tokio::time::timeout(Duration::from_millis(timeout), &mut task).await {
                Ok(joined) => joined,
                Err(_) => {
                    task.abort();
                    tracing::warn!(timeout_ms = timeout, "Message consumption timed out");
                    return Outcome::Failed(UnackReason::Timeout);
                }
            }
        } else {
            task.await
        };

        match joined {
            Ok(Ok(())) => Outcome::Consumed,
            Ok(Err(e)) => {
                tracing::warn!(error = %e, "Message consumption failed");
                Outcome::Failed(UnackReason::ConsumeError)
            }
            Err(e) => {
                tracing::error!(error = ?e, "Message consumer panicked");
                Outcome::Failed(UnackReason::ConsumeError)
            }
        }
    }

    async fn acknowledge(&self, message: &Message) -> Result<(), SmqError> {
        let store = &self.ctx.store;
        let namespace = &self.target.queue.namespace;
        let acknowledged = &self.ctx.acknowledged;

        let moved: i64 = store
            .scripts()
            .acknowledge_message
            .key(self.dequeuer.processing_key())
            .key(self.keys.queue.acknowledged())
            .key(self.keys.queue.properties())
            .key(keys::message_key(namespace, &message.id))
            .arg(&message.id)
            .arg(acknowledged.flag())
            .arg(acknowledged.queue_size)
            .arg(acknowledged.expire_ms)
            .arg(keys::message_key_prefix(namespace))
            .arg(crate::now_ms())
            .invoke_async(&mut store.conn())
            .await?;

        if moved == 0 {
            tracing::warn!("Acknowledged message was no longer in processing");
            return Ok(());
        }

        tracing::debug!("Message acknowledged");
        self.ctx.events.emit(ConsumerEvent::MessageAcknowledged {
            consumer_id: self.ctx.consumer_id.clone(),
            queue: self.target.clone(),
            message_id: message.id.clone(),
        });
        Ok(())
    }

    async fn unacknowledge(&self, message: &Message, reason: UnackReason) -> Result<(), SmqError> {
        let status = self
            .ctx
            .unack
            .unacknowledge_message(&self.ctx.consumer_id, message, reason)
            .await?;

        if let Some(decision) = status.get(&message.id) {
            self.ctx.events.emit(ConsumerEvent::MessageUnacknowledged {
                consumer_id: self.ctx.consumer_id.clone(),
                queue: self.target.clone(),
                message_id: message.id.clone(),
                reason,
                action: decision.action,
                dead_letter_reason: decision.dead_letter_reason,
            });
        }
        Ok(())
    }
}
