use std::future::Future;
use std::sync::Arc;

use thiserror::Error;
use tokio::sync::{mpsc, Mutex};
use tokio_util::sync::CancellationToken;

#[derive(Debug, Error)]
pub enum PoolError<E: std::error::Error> {
    #[error("task {index} failed: {error}")]
    Task { index: usize, error: E },
    #[error("cancelled")]
    Cancelled,
}

/// Fixed-width executor over an ordered task list. Tasks complete in any
/// order; results carry their index so callers can reassemble. The first
/// task error cancels the rest, and the pool always drains its workers
/// before returning. Submission is bounded, so producers of huge task lists
/// never balloon memory.
pub struct WorkerPool {
    workers: usize,
    queue_depth: usize,
}

impl WorkerPool {
    pub fn new(workers: usize) -> Self {
        let workers = workers.max(1);
        Self {
            workers,
            queue_depth: workers * 2,
        }
    }

    pub async fn run<T, R, E, F, Fut>(
        &self,
        tasks: Vec<T>,
        cancel: &CancellationToken,
        op: F,
    ) -> Result<Vec<R>, PoolError<E>>
    where
        T: Send + 'static,
        R: Send + 'static,
        E: std::error::Error + Send + 'static,
        F: Fn(usize, T) -> Fut + Clone + Send + 'static,
        Fut: Future<Output = Result<R, E>> + Send,
    {
        let total = tasks.len();
        if total == 0 {
            return Ok(Vec::new());
        }

        // Internal child token: a task failure stops this run without
        // cancelling the caller's token.
        let internal = cancel.child_token();
        let (task_tx, task_rx) = mpsc::channel::<(usize, T)>(self.queue_depth);
        let task_rx = Arc::new(Mutex::new(task_rx));
        let (result_tx, mut result_rx) = mpsc::channel::<(usize, Result<R, E>)>(self.queue_depth);

        let producer = {
            let internal = internal.clone();
            tokio::spawn(async move {
                for (index, task) in tasks.into_iter().enumerate() {
                    tokio::select! {
                        _ = internal.cancelled() => break,
                        sent = task_tx.send((index, task)) => {
                            if sent.is_err() {
                                break;
                            }
                        }
                    }
                }
            })
        };

        let mut workers = Vec::with_capacity(self.workers.min(total));
        for _ in 0..self.workers.min(total) {
            let task_rx = task_rx.clone();
            let result_tx = result_tx.clone();
            let internal = internal.clone();
            let op = op.clone();
            workers.push(tokio::spawn(async move {
                loop {
                    let next = {
                        let mut rx = task_rx.lock().await;
                        tokio::select! {
                            _ = internal.cancelled() => None,
                            task = rx.recv() => task,
                        }
                    };
                    let Some((index, task)) = next else {
                        break;
                    };
                    // Cancellation interrupts the task future at its next
                    // suspension point.
                    let outcome = tokio::select! {
                        _ = internal.cancelled() => break,
                        outcome = op(index, task) => outcome,
                    };
                    let failed = outcome.is_err();
                    if result_tx.send((index, outcome)).await.is_err() || failed {
                        break;
                    }
                }
            }));
        }
        drop(result_tx);

        let mut results: Vec<Option<R>> = (0..total).map(|_| None).collect();
        let mut first_error: Option<PoolError<E>> = None;
        while let Some((index, outcome)) = result_rx.recv().await {
            match outcome {
                Ok(value) => results[index] = Some(value),
                Err(error) => {
                    if first_error.is_none() {
                        first_error = Some(PoolError::Task { index, error });
                        internal.cancel();
                    }
                }
            }
        }

        // Drain before reporting anything.
        let _ = producer.await;
        for worker in workers {
            let _ = worker.await;
        }

        if let Some(error) = first_error {
            return Err(error);
        }
        if cancel.is_cancelled() {
            return Err(PoolError::Cancelled);
        }
        let mut ordered = Vec::with_capacity(total);
        for slot in results {
            match slot {
                Some(value) => ordered.push(value),
                // interrupted mid-run without a task error
                None => return Err(PoolError::Cancelled),
            }
        }
        Ok(ordered)
    }
}
