use std::{
    collections::{HashMap, HashSet},
    sync::Arc,
    time::Duration,
};

use futures::{StreamExt, stream::BoxStream};
use tokio::sync::{Mutex, mpsc};
use tracing::Instrument;

use crate::{
    consumer::handler::{HandlerContext, HandlerFailure, MessageHandler, MessageHandlerConfig},
    error::SmqError,
    events::{self, QueueStateChangedEvent},
    lifecycle::{Lifecycle, Runnable},
    queue::{ConsumerQueue, QueueParams, QueueState, QueueStateManager},
    shutdown::{ShutdownHandle, WorkerHandle},
};

#[derive(Clone, Debug)]
pub struct RunnerOptions {
    pub reconcile_interval: Duration,
}

impl Default for RunnerOptions {
    fn default() -> Self {
        Self {
            reconcile_interval: Duration::from_secs(5),
        }
    }
}

const RESUBSCRIBE_MIN_DELAY: Duration = Duration::from_millis(100);

/// Queues known to be out of service, one set per state.
#[derive(Debug, Default)]
pub struct QueueStateSets {
    paused: HashSet<QueueParams>,
    stopped: HashSet<QueueParams>,
    locked: HashSet<QueueParams>,
}

impl QueueStateSets {
    /// Record the latest known state of a queue.
    pub fn record(&mut self, queue: &QueueParams, state: QueueState) {
        self.paused.remove(queue);
        self.stopped.remove(queue);
        self.locked.remove(queue);
        match state {
            QueueState::Paused => self.paused.insert(queue.clone()),
            QueueState::Stopped => self.stopped.insert(queue.clone()),
            QueueState::Locked => self.locked.insert(queue.clone()),
            QueueState::Active => false,
        };
    }

    pub fn is_paused(&self, queue: &QueueParams) -> bool {
        self.paused.contains(queue)
    }

    pub fn is_stopped(&self, queue: &QueueParams) -> bool {
        self.stopped.contains(queue)
    }

    pub fn is_locked(&self, queue: &QueueParams) -> bool {
        self.locked.contains(queue)
    }

    pub fn is_active(&self, queue: &QueueParams) -> bool {
        !self.is_paused(queue) && !self.is_stopped(queue) && !self.is_locked(queue)
    }
}

/// Keeps the set of running message handlers equal to the set of desired ones,
/// and in step with the operational state of their queues.
pub struct MessageHandlerRunner {
    inner: Arc<RunnerInner>,
}

struct RunnerInner {
    lifecycle: Lifecycle,
    ctx: HandlerContext,
    options: RunnerOptions,
    states: QueueStateManager,
    desired: Mutex<Vec<MessageHandlerConfig>>,
    running: Mutex<HashMap<ConsumerQueue, Arc<MessageHandler>>>,
    queue_states: Mutex<QueueStateSets>,
    /// Serializes starting and removing handlers
    start_lock: Mutex<()>,
    failures_tx: mpsc::UnboundedSender<HandlerFailure>,
    failures_rx: Mutex<Option<mpsc::UnboundedReceiver<HandlerFailure>>>,
    tasks: Mutex<ShutdownHandle>,
}

impl MessageHandlerRunner {
    pub(crate) fn new(ctx: HandlerContext, options: RunnerOptions) -> Self {
        let (failures_tx, failures_rx) = mpsc::unbounded_channel();
        Self {
            inner: Arc::new(RunnerInner {
                lifecycle: Lifecycle::new(format!("runner:{}", ctx.consumer_id)),
                states: QueueStateManager::new(ctx.store.clone()),
                ctx,
                options,
                desired: Mutex::new(Vec::new()),
                running: Mutex::new(HashMap::new()),
                queue_states: Mutex::new(QueueStateSets::default()),
                start_lock: Mutex::new(()),
                failures_tx,
                failures_rx: Mutex::new(Some(failures_rx)),
                tasks: Mutex::new(ShutdownHandle::new()),
            }),
        }
    }

    pub async fn add_message_handler(&self, config: MessageHandlerConfig) -> Result<(), SmqError> {
        config.target.validate()?;
        let target = config.target.clone();
        {
            let mut desired = self.inner.desired.lock().await;
            if desired.iter().any(|c| c.target == target) {
                return Err(SmqError::MessageHandlerAlreadyExists(target.to_string()));
            }
            desired.push(config);
        }
        tracing::debug!(queue = %target, "Message handler added");

        if self.inner.lifecycle.is_running() {
            self.inner.start_handler(&target).await?;
        }
        Ok(())
    }

    /// Remove a handler and stop its running instance. Unknown targets are ignored.
    pub async fn remove_message_handler(&self, target: &ConsumerQueue) -> Result<(), SmqError> {
        let _guard = self.inner.start_lock.lock().await;
        self.inner.desired.lock().await.retain(|c| &c.target != target);
        let instance = self.inner.running.lock().await.remove(target);
        if let Some(instance) = instance {
            instance.shutdown().await?;
            tracing::debug!(queue = %target, "Message handler removed");
        }
        Ok(())
    }

    pub async fn get_queues(&self) -> Vec<ConsumerQueue> {
        self.inner
            .desired
            .lock()
            .await
            .iter()
            .map(|c| c.target.clone())
            .collect()
    }

    pub async fn running_queues(&self) -> Vec<ConsumerQueue> {
        self.inner.running.lock().await.keys().cloned().collect()
    }

    pub async fn is_queue_paused(&self, queue: &QueueParams) -> bool {
        self.inner.queue_states.lock().await.is_paused(queue)
    }

    pub async fn is_queue_stopped(&self, queue: &QueueParams) -> bool {
        self.inner.queue_states.lock().await.is_stopped(queue)
    }

    pub async fn is_queue_locked(&self, queue: &QueueParams) -> bool {
        self.inner.queue_states.lock().await.is_locked(queue)
    }

    pub async fn is_queue_active(&self, queue: &QueueParams) -> bool {
        self.inner.queue_states.lock().await.is_active(queue)
    }

    /// Run one reconciliation pass now.
    pub async fn reconcile(&self) {
        self.inner.reconcile().await
    }
}

impl Runnable for MessageHandlerRunner {
    fn lifecycle(&self) -> &Lifecycle {
        &self.inner.lifecycle
    }

    async fn on_going_up(&self) -> Result<(), SmqError> {
        let inner = &self.inner;
        let mut tasks = inner.tasks.lock().await;

        // Subscribe before starting handlers so no state change slips through
        let mut state_events = events::subscribe_queue_state(&inner.ctx.store).await?;
        let runner = inner.clone();
        tasks.add_worker(WorkerHandle::spawn("runner:queue-state", |mut shutdown_rx| {
            async move {
                loop {
                    tokio::select! {
                        _ = &mut shutdown_rx => break,
                        event = state_events.next() => match event {
                            Some(event) => runner.on_queue_state_changed(event).await,
                            None => {
                                tracing::warn!("Queue state subscription closed, resubscribing");
                                tokio::select! {
                                    _ = &mut shutdown_rx => break,
                                    stream = runner.resubscribe() => state_events = stream,
                                }
                                // Transitions published while unsubscribed were missed
                                runner.reconcile().await;
                            }
                        }
                    }
                }
                Ok(())
            }
            .instrument(tracing::debug_span!("smq_runner_events"))
        }));

        if let Some(mut failures_rx) = inner.failures_rx.lock().await.take() {
            let runner = inner.clone();
            tasks.add_worker(WorkerHandle::spawn("runner:failures", |mut shutdown_rx| {
                async move {
                    loop {
                        tokio::select! {
                            _ = &mut shutdown_rx => break,
                            failure = failures_rx.recv() => match failure {
                                Some(failure) => runner.on_handler_failure(failure).await,
                                None => break,
                            }
                        }
                    }
                    // Keep the receiver for the next start
                    *runner.failures_rx.lock().await = Some(failures_rx);
                    Ok(())
                }
            }));
        }

        let runner = inner.clone();
        tasks.add_worker(WorkerHandle::spawn("runner:reconcile", |mut shutdown_rx| {
            async move {
                let mut interval = tokio::time::interval(runner.options.reconcile_interval);
                // The first tick completes immediately, handlers are started below
                interval.tick().await;
                loop {
                    tokio::select! {
                        _ = &mut shutdown_rx => break,
                        _ = interval.tick() => runner.reconcile().await,
                    }
                }
                Ok(())
            }
            .instrument(tracing::debug_span!("smq_runner_reconcile"))
        }));
        drop(tasks);

        let targets: Vec<ConsumerQueue> = inner
            .desired
            .lock()
            .await
            .iter()
            .map(|c| c.target.clone())
            .collect();
        for target in targets {
            if let Err(e) = inner.start_handler(&target).await {
                tracing::error!(queue = %target, error = ?e, "Failed to start message handler");
            }
        }
        Ok(())
    }

    async fn on_going_down(&self) -> Result<(), SmqError> {
        let inner = &self.inner;
        let tasks = std::mem::take(&mut *inner.tasks.lock().await);
        let tasks_result = tasks.shutdown().await;

        // A start in progress inserts its instance before this drains
        let _guard = inner.start_lock.lock().await;
        let instances: Vec<Arc<MessageHandler>> =
            inner.running.lock().await.drain().map(|(_, h)| h).collect();
        let results =
            futures::future::join_all(instances.iter().map(|instance| instance.shutdown())).await;

        for result in results {
            if let Err(e) = result {
                tracing::error!(error = ?e, "Message handler shut down with error");
            }
        }
        tasks_result
    }
}

impl RunnerInner {
    /// Start the handler for `target` unless it is no longer desired, already running
    /// or its queue is out of service.
    async fn start_handler(&self, target: &ConsumerQueue) -> Result<(), SmqError> {
        let _guard = self.start_lock.lock().await;
        self.lifecycle.ensure_active()?;

        let config = {
            let desired = self.desired.lock().await;
            match desired.iter().find(|c| &c.target == target) {
                Some(config) => config.clone(),
                None => return Ok(()),
            }
        };
        if self.running.lock().await.contains_key(target) {
            return Ok(());
        }

        let state = self.states.current(&target.queue).await?;
        self.queue_states.lock().await.record(&target.queue, state);
        if state != QueueState::Active {
            tracing::debug!(queue = %target, state = %state, "Queue is not active, handler not started");
            return Ok(());
        }

        let handler = Arc::new(MessageHandler::new(
            self.ctx.clone(),
            &config,
            self.failures_tx.clone(),
        ));
        handler.run().await?;
        self.running.lock().await.insert(target.clone(), handler);
        tracing::info!(queue = %target, "Message handler running");
        Ok(())
    }

    async fn stop_handler(&self, target: &ConsumerQueue) {
        let _guard = self.start_lock.lock().await;
        self.stop_instance(target).await;
    }

    /// Callers hold `start_lock`.
    async fn stop_instance(&self, target: &ConsumerQueue) {
        let instance = self.running.lock().await.remove(target);
        if let Some(instance) = instance {
            if let Err(e) = instance.shutdown().await {
                tracing::error!(queue = %target, error = ?e, "Message handler shut down with error");
            }
        }
    }

    async fn resubscribe(&self) -> BoxStream<'static, QueueStateChangedEvent> {
        let mut delay = RESUBSCRIBE_MIN_DELAY;
        loop {
            match events::subscribe_queue_state(&self.ctx.store).await {
                Ok(stream) => {
                    tracing::info!("Queue state subscription restored");
                    return stream;
                }
                Err(e) => {
                    tracing::warn!(error = ?e, retry_in = ?delay, "Failed to resubscribe to queue state");
                    tokio::time::sleep(delay).await;
                    delay = (delay * 2).min(self.options.reconcile_interval.max(RESUBSCRIBE_MIN_DELAY));
                }
            }
        }
    }

    /// Bring running handlers in line with the desired set and with the stored state of
    /// their queues, whatever events were missed.
    async fn reconcile(&self) {
        if !self.lifecycle.is_running() {
            return;
        }

        let desired: Vec<ConsumerQueue> = self
            .desired
            .lock()
            .await
            .iter()
            .map(|c| c.target.clone())
            .collect();
        let running: Vec<ConsumerQueue> = self.running.lock().await.keys().cloned().collect();

        let watched: HashSet<QueueParams> = desired
            .iter()
            .chain(running.iter())
            .map(|t| t.queue.clone())
            .collect();
        for queue in watched {
            match self.states.current(&queue).await {
                Ok(state) => self.queue_states.lock().await.record(&queue, state),
                Err(e) => tracing::warn!(queue = %queue, error = ?e, "Failed to refresh queue state"),
            }
        }

        let (zombies, extras): (Vec<ConsumerQueue>, Vec<ConsumerQueue>) = {
            let states = self.queue_states.lock().await;
            let zombies = desired
                .iter()
                .filter(|t| !running.contains(t) && states.is_active(&t.queue))
                .cloned()
                .collect();
            let extras = running
                .into_iter()
                .filter(|t| !desired.contains(t) || !states.is_active(&t.queue))
                .collect();
            (zombies, extras)
        };

        for target in extras {
            tracing::info!(queue = %target, "Stopping message handler that should not run");
            self.stop_handler(&target).await;
        }

        if !zombies.is_empty() {
            tracing::info!(count = zombies.len(), "Restarting message handlers");
        }
        // One at a time, each start re-checks that the target is still desired
        for target in zombies {
            if let Err(e) = self.start_handler(&target).await {
                tracing::error!(queue = %target, error = ?e, "Failed to restart message handler");
            }
        }
    }

    async fn on_queue_state_changed(&self, event: QueueStateChangedEvent) {
        let queue = &event.queue;
        let state = event.transition.to;

        let watched = self
            .desired
            .lock()
            .await
            .iter()
            .any(|c| &c.target.queue == queue);
        if !watched {
            return;
        }

        self.queue_states.lock().await.record(queue, state);
        tracing::info!(queue = %queue, state = %state, "Queue state changed");

        match state {
            QueueState::Paused | QueueState::Stopped | QueueState::Locked => {
                // A concurrent start either finishes first and is stopped here, or
                // reads the new state and does not start
                let _guard = self.start_lock.lock().await;
                let affected: Vec<ConsumerQueue> = self
                    .running
                    .lock()
                    .await
                    .keys()
                    .filter(|t| &t.queue == queue)
                    .cloned()
                    .collect();
                for target in affected {
                    self.stop_instance(&target).await;
                }
            }
            QueueState::Active => {
                let targets: Vec<ConsumerQueue> = self
                    .desired
                    .lock()
                    .await
                    .iter()
                    .filter(|c| &c.target.queue == queue)
                    .map(|c| c.target.clone())
                    .collect();
                for target in targets {
                    if let Err(e) = self.start_handler(&target).await {
                        tracing::error!(queue = %target, error = ?e, "Failed to start message handler");
                    }
                }
            }
        }
    }

    /// Shut the failed instance down. The next reconciliation restarts it.
    async fn on_handler_failure(&self, failure: HandlerFailure) {
        tracing::warn!(queue = %failure.target, error = failure.error, "Message handler reported an error");
        let _guard = self.start_lock.lock().await;
        let current = self
            .running
            .lock()
            .await
            .get(&failure.target)
            .map(|handler| handler.instance());
        if current != Some(failure.instance) {
            tracing::debug!(queue = %failure.target, instance = failure.instance, "Failed instance was already replaced");
            return;
        }
        self.stop_instance(&failure.target).await;
    }
}
