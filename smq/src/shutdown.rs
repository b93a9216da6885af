use std::future::Future;

use tokio::sync::oneshot;

use crate::error::SmqError;

/// Handle for a single background task that can be shut down gracefully
pub struct WorkerHandle {
    name: String,
    pub join_handle: tokio::task::JoinHandle<Result<(), SmqError>>,
    pub shutdown_tx: oneshot::Sender<()>,
}

impl WorkerHandle {
    /// Spawn `task`, handing it the receiving half of the shutdown signal.
    pub fn spawn<F, Fut>(name: impl Into<String>, task: F) -> Self
    where
        F: FnOnce(oneshot::Receiver<()>) -> Fut,
        Fut: Future<Output = Result<(), SmqError>> + Send + 'static,
    {
        let (shutdown_tx, shutdown_rx) = oneshot::channel();
        Self {
            name: name.into(),
            join_handle: tokio::spawn(task(shutdown_rx)),
            shutdown_tx,
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    /// Shutdown this task gracefully
    pub async fn shutdown(self) -> Result<(), SmqError> {
        tracing::debug!(task = self.name, "Signalling task shutdown");

        if self.shutdown_tx.send(()).is_err() {
            tracing::debug!(task = self.name, "Task had already exited");
        }

        match self.join_handle.await {
            Ok(Ok(())) => {
                tracing::debug!(task = self.name, "Task shut down gracefully");
                Ok(())
            }
            Ok(Err(e)) => {
                tracing::error!(task = self.name, error = ?e, "Task shut down with error");
                Err(e)
            }
            Err(e) => {
                tracing::error!(task = self.name, error = ?e, "Task panicked during shutdown");
                Err(SmqError::WorkerPanic(format!("{}: {}", self.name, e)))
            }
        }
    }
}

/// Handle for coordinating shutdown of multiple tasks
#[derive(Default)]
pub struct ShutdownHandle {
    workers: Vec<WorkerHandle>,
}

impl ShutdownHandle {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn add_worker(&mut self, worker: WorkerHandle) {
        self.workers.push(worker);
    }

    pub fn worker_count(&self) -> usize {
        self.workers.len()
    }

    pub fn is_empty(&self) -> bool {
        self.workers.is_empty()
    }

    /// Signal every task first, then wait for all of them
    pub async fn shutdown(self) -> Result<(), SmqError> {
        let worker_count = self.workers.len();
        let mut names = Vec::with_capacity(worker_count);
        let mut join_handles = Vec::with_capacity(worker_count);

        for worker in self.workers {
            if worker.shutdown_tx.send(()).is_err() {
                tracing::debug!(task = worker.name, "Task had already exited");
            }
            names.push(worker.name);
            join_handles.push(worker.join_handle);
        }

        let results = futures::future::join_all(join_handles).await;
        let mut first_error = None;

        for (name, result) in names.into_iter().zip(results) {
            let error = match result {
                Ok(Ok(())) => continue,
                Ok(Err(e)) => e,
                Err(e) => SmqError::WorkerPanic(format!("{name}: {e}")),
            };
            tracing::error!(task = name, error = ?error, "Task shut down with error");
            first_error.get_or_insert(error);
        }

        match first_error {
            None => {
                tracing::debug!(worker_count, "All tasks shut down gracefully");
                Ok(())
            }
            // Every error has been logged, report the first one
            Some(e) => Err(e),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn signalled_tasks_exit() {
        let worker = WorkerHandle::spawn("waiter", |shutdown_rx| async move {
            let _ = shutdown_rx.await;
            Ok(())
        });
        assert_eq!(worker.name(), "waiter");
        assert!(worker.shutdown().await.is_ok());
    }

    #[tokio::test]
    async fn first_error_is_reported() {
        let mut handle = ShutdownHandle::new();
        handle.add_worker(WorkerHandle::spawn("ok", |rx| async move {
            let _ = rx.await;
            Ok(())
        }));
        handle.add_worker(WorkerHandle::spawn("failing", |_rx| async move {
            Err(SmqError::runtime("boom"))
        }));
        assert_eq!(handle.worker_count(), 2);

        let result = handle.shutdown().await;
        assert!(matches!(result, Err(SmqError::Runtime { .. })));
    }
}
