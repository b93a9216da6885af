use std::future::Future;

use tokio::sync::watch;

use crate::error::SmqError;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LifecycleState {
    Idle,
    GoingUp,
    Running,
    GoingDown,
    Down,
}

/// Lifecycle state shared by every long running component.
///
/// Transitions: `Idle | Down -> GoingUp -> Running -> GoingDown -> Down`.
/// A failed start goes `GoingUp -> Down`.
#[derive(Debug)]
pub struct Lifecycle {
    name: String,
    state: watch::Sender<LifecycleState>,
}

impl Lifecycle {
    pub fn new(name: impl Into<String>) -> Self {
        let (state, _) = watch::channel(LifecycleState::Idle);
        Self {
            name: name.into(),
            state,
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn state(&self) -> LifecycleState {
        *self.state.borrow()
    }

    pub fn is_running(&self) -> bool {
        self.state() == LifecycleState::Running
    }

    pub fn is_going_down(&self) -> bool {
        matches!(
            self.state(),
            LifecycleState::GoingDown | LifecycleState::Down
        )
    }

    pub fn subscribe(&self) -> watch::Receiver<LifecycleState> {
        self.state.subscribe()
    }

    /// Returns false when the component is already up or on its way up.
    pub fn begin_going_up(&self) -> bool {
        self.state.send_if_modified(|state| match state {
            LifecycleState::Idle | LifecycleState::Down => {
                *state = LifecycleState::GoingUp;
                true
            }
            _ => false,
        })
    }

    pub fn mark_running(&self) {
        self.state.send_replace(LifecycleState::Running);
    }

    /// Wait until a start in progress has either succeeded or failed.
    pub async fn wait_until_settled(&self) {
        let mut state = self.state.subscribe();
        // The sender lives in `self`, so the wait cannot fail
        let _ = state
            .wait_for(|state| *state != LifecycleState::GoingUp)
            .await;
    }

    /// Returns false unless the component is running.
    pub fn begin_going_down(&self) -> bool {
        self.state.send_if_modified(|state| match state {
            LifecycleState::Running => {
                *state = LifecycleState::GoingDown;
                true
            }
            _ => false,
        })
    }

    pub fn mark_down(&self) {
        self.state.send_replace(LifecycleState::Down);
    }

    /// Error out of work whose owner is no longer going up or running.
    pub fn ensure_active(&self) -> Result<(), SmqError> {
        match self.state() {
            LifecycleState::GoingUp | LifecycleState::Running => Ok(()),
            state => Err(SmqError::Aborted(format!(
                "{} is {:?}",
                self.name, state
            ))),
        }
    }
}

/// Components with a managed lifecycle implement the two transition hooks
/// and get `run`/`shutdown` with consistent state bookkeeping.
pub trait Runnable: Send + Sync {
    fn lifecycle(&self) -> &Lifecycle;

    fn on_going_up(&self) -> impl Future<Output = Result<(), SmqError>> + Send;

    fn on_going_down(&self) -> impl Future<Output = Result<(), SmqError>> + Send;

    /// Start the component. Returns `Ok(false)` if it was already up.
    fn run(&self) -> impl Future<Output = Result<bool, SmqError>> + Send {
        async move {
            let lifecycle = self.lifecycle();
            if !lifecycle.begin_going_up() {
                return Ok(false);
            }
            match self.on_going_up().await {
                Ok(()) => {
                    lifecycle.mark_running();
                    tracing::debug!(component = lifecycle.name(), "Component is running");
                    Ok(true)
                }
                Err(e) => {
                    tracing::error!(component = lifecycle.name(), error = ?e, "Component failed to start");
                    // Roll back whatever the hook managed to set up
                    if let Err(down_err) = self.on_going_down().await {
                        tracing::warn!(component = lifecycle.name(), error = ?down_err, "Cleanup after failed start errored");
                    }
                    lifecycle.mark_down();
                    Err(e)
                }
            }
        }
    }

    /// Stop the component. Returns `Ok(false)` if it was not running.
    ///
    /// A shutdown arriving while the component is going up waits for the start to
    /// finish, then undoes it.
    fn shutdown(&self) -> impl Future<Output = Result<bool, SmqError>> + Send {
        async move {
            let lifecycle = self.lifecycle();
            loop {
                if lifecycle.begin_going_down() {
                    break;
                }
                if lifecycle.state() != LifecycleState::GoingUp {
                    return Ok(false);
                }
                lifecycle.wait_until_settled().await;
            }
            let result = self.on_going_down().await;
            lifecycle.mark_down();
            match result {
                Ok(()) => {
                    tracing::debug!(component = lifecycle.name(), "Component is down");
                    Ok(true)
                }
                Err(e) => {
                    tracing::error!(component = lifecycle.name(), error = ?e, "Component shut down with error");
                    Err(e)
                }
            }
        }
    }
}
