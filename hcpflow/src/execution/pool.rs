//! Bounded worker pool for per-run commands.

use crate::errors::ExecutionError;
use futures::future::join_all;
use parking_lot::RwLock;
use std::future::Future;
use std::sync::Arc;
use tokio::sync::Semaphore;
use tokio::task::JoinHandle;

type Worker = (String, JoinHandle<Result<i32, ExecutionError>>);

/// A group of command tasks sharing a fixed concurrency budget.
///
/// Tasks start as soon as a slot is free and may finish in any order;
/// [`WorkerPool::wait`] is the barrier and reports exit codes in spawn order.
pub struct WorkerPool {
    slots: Arc<Semaphore>,
    size: usize,
    handles: RwLock<Vec<Worker>>,
}

impl WorkerPool {
    /// Creates a pool running at most `size` tasks at once (at least one).
    #[must_use]
    pub fn new(size: usize) -> Self {
        let size = size.max(1);
        Self {
            slots: Arc::new(Semaphore::new(size)),
            size,
            handles: RwLock::new(Vec::new()),
        }
    }

    /// Returns the concurrency limit.
    #[must_use]
    pub fn size(&self) -> usize {
        self.size
    }

    /// Queues a task.
    pub fn spawn<F, Fut>(&self, label: impl Into<String>, task: F)
    where
        F: FnOnce() -> Fut + Send + 'static,
        Fut: Future<Output = Result<i32, ExecutionError>> + Send + 'static,
    {
        let slots = Arc::clone(&self.slots);
        let handle = tokio::spawn(async move {
            // The semaphore is never closed.
            let _permit = slots.acquire_owned().await.ok();
            task().await
        });
        self.handles.write().push((label.into(), handle));
    }

    /// Waits for every queued task.
    ///
    /// All tasks are awaited even after an error; the first error is returned.
    pub async fn wait(&self) -> Result<Vec<i32>, ExecutionError> {
        let workers: Vec<Worker> = std::mem::take(&mut *self.handles.write());
        let (labels, handles): (Vec<String>, Vec<_>) = workers.into_iter().unzip();
        let results = join_all(handles).await;

        let mut codes = Vec::with_capacity(results.len());
        let mut first_error = None;
        for (label, result) in labels.into_iter().zip(results) {
            match result {
                Ok(Ok(code)) => codes.push(code),
                Ok(Err(e)) => {
                    first_error.get_or_insert(e);
                }
                Err(join_error) => {
                    first_error.get_or_insert(ExecutionError::Worker {
                        label,
                        message: join_error.to_string(),
                    });
                }
            }
        }

        match first_error {
            Some(e) => Err(e),
            None => Ok(codes),
        }
    }

    /// Returns the number of queued tasks not yet awaited.
    #[must_use]
    pub fn task_count(&self) -> usize {
        self.handles.read().len()
    }
}

impl std::fmt::Debug for WorkerPool {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("WorkerPool")
            .field("size", &self.size)
            .field("task_count", &self.task_count())
            .finish()
    }
}
