//! Bounded worker pool.
//!
//! `W` executors share one bounded task queue. Every submitted task runs exactly
//! once and produces exactly one [`TaskResult`] on the channel returned by
//! [`WorkerPool::start`]. Results carry no ordering guarantee; callers correlate
//! them by task id.

use std::fmt;
use std::panic::AssertUnwindSafe;
use std::sync::{Arc, Mutex, PoisonError};
use std::time::{Duration, Instant};

use async_trait::async_trait;
use futures::FutureExt;
use thiserror::Error;
use tokio::sync::mpsc::{self, error::TrySendError};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;

use crate::error::{Result, ScribeError};

#[derive(Error, Debug, Clone, Copy, PartialEq, Eq)]
pub enum PoolError {
    #[error("task queue is full")]
    QueueFull,

    #[error("worker pool is not started")]
    NotStarted,

    #[error("worker pool is already started")]
    AlreadyStarted,
}

/// A unit of work executed by the pool.
#[async_trait]
pub trait Task: Send + 'static {
    type Output: Send + 'static;

    fn id(&self) -> &str;

    async fn execute(self: Box<Self>, cancel: CancellationToken) -> Result<Self::Output>;
}

pub type BoxedTask<T> = Box<dyn Task<Output = T>>;

#[derive(Debug)]
pub struct TaskResult<T> {
    pub task_id: String,
    pub value: Result<T>,
    pub duration: Duration,
}

/// A task the pool refused, handed back to the submitter.
pub struct Rejected<T> {
    pub reason: PoolError,
    pub task: BoxedTask<T>,
}

impl<T: Send + 'static> fmt::Debug for Rejected<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Rejected")
            .field("reason", &self.reason)
            .field("task_id", &self.task.id())
            .finish()
    }
}

impl<T> From<Rejected<T>> for ScribeError {
    fn from(rejected: Rejected<T>) -> Self {
        ScribeError::Pool(rejected.reason)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, serde::Serialize)]
pub struct WorkerPoolStats {
    pub worker_count: usize,
    pub queued: usize,
    pub queue_capacity: usize,
    pub started: bool,
}

struct Running<T> {
    sender: mpsc::Sender<BoxedTask<T>>,
    workers: Vec<JoinHandle<()>>,
    cancel: CancellationToken,
}

pub struct WorkerPool<T> {
    worker_count: usize,
    queue_capacity: usize,
    state: Mutex<Option<Running<T>>>,
}

impl<T: Send + 'static> WorkerPool<T> {
    pub fn new(worker_count: usize, queue_capacity: usize) -> Self {
        Self {
            worker_count: worker_count.max(1),
            queue_capacity: queue_capacity.max(1),
            state: Mutex::new(None),
        }
    }

    /// Spawn the executors and hand back the result channel.
    ///
    /// Must be called from within a tokio runtime. A stopped pool may be started
    /// again; a running one may not.
    pub fn start(&self) -> std::result::Result<mpsc::Receiver<TaskResult<T>>, PoolError> {
        let mut state = self.state.lock().unwrap_or_else(PoisonError::into_inner);
        if state.is_some() {
            return Err(PoolError::AlreadyStarted);
        }

        let (task_tx, task_rx) = mpsc::channel(self.queue_capacity);
        let (result_tx, result_rx) = mpsc::channel(self.queue_capacity);
        let task_rx = Arc::new(tokio::sync::Mutex::new(task_rx));
        let cancel = CancellationToken::new();

        let workers = (0..self.worker_count)
            .map(|worker_id| {
                tokio::spawn(run_worker(
                    worker_id,
                    task_rx.clone(),
                    result_tx.clone(),
                    cancel.clone(),
                ))
            })
            .collect();

        *state = Some(Running {
            sender: task_tx,
            workers,
            cancel,
        });

        tracing::info!(
            workers = self.worker_count,
            queue_capacity = self.queue_capacity,
            "Worker pool started"
        );

        Ok(result_rx)
    }

    /// Enqueue a task without waiting. A full queue rejects immediately.
    pub fn submit(&self, task: BoxedTask<T>) -> std::result::Result<(), Rejected<T>> {
        let state = self.state.lock().unwrap_or_else(PoisonError::into_inner);
        let Some(running) = state.as_ref() else {
            return Err(Rejected {
                reason: PoolError::NotStarted,
                task,
            });
        };

        match running.sender.try_send(task) {
            Ok(()) => Ok(()),
            Err(TrySendError::Full(task)) => Err(Rejected {
                reason: PoolError::QueueFull,
                task,
            }),
            Err(TrySendError::Closed(task)) => Err(Rejected {
                reason: PoolError::NotStarted,
                task,
            }),
        }
    }

    /// Close the queue, let the executors finish everything already queued,
    /// then cancel the shared scope. The result channel closes once the last
    /// executor exits. No-op on a pool that is not running.
    pub async fn stop(&self) {
        let running = self
            .state
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .take();
        let Some(Running {
            sender,
            workers,
            cancel,
        }) = running
        else {
            return;
        };

        drop(sender);
        join_workers(workers).await;
        cancel.cancel();

        tracing::info!("Worker pool stopped");
    }

    /// Cancel in-flight and queued work, then wait for the executors to exit.
    pub async fn abort(&self) {
        let running = self
            .state
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .take();
        let Some(Running {
            sender,
            workers,
            cancel,
        }) = running
        else {
            return;
        };

        cancel.cancel();
        drop(sender);
        join_workers(workers).await;

        tracing::info!("Worker pool aborted");
    }

    pub fn is_started(&self) -> bool {
        self.state
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .is_some()
    }

    pub fn stats(&self) -> WorkerPoolStats {
        let state = self.state.lock().unwrap_or_else(PoisonError::into_inner);
        let queued = state
            .as_ref()
            .map(|running| running.sender.max_capacity() - running.sender.capacity())
            .unwrap_or(0);

        WorkerPoolStats {
            worker_count: self.worker_count,
            queued,
            queue_capacity: self.queue_capacity,
            started: state.is_some(),
        }
    }
}

async fn join_workers(workers: Vec<JoinHandle<()>>) {
    for handle in workers {
        if let Err(e) = handle.await {
            tracing::error!(error = %e, "Worker exited abnormally");
        }
    }
}

async fn run_worker<T: Send + 'static>(
    worker_id: usize,
    tasks: Arc<tokio::sync::Mutex<mpsc::Receiver<BoxedTask<T>>>>,
    results: mpsc::Sender<TaskResult<T>>,
    cancel: CancellationToken,
) {
    tracing::debug!(worker_id, "Worker started");

    loop {
        let next = {
            let mut rx = tasks.lock().await;
            tokio::select! {
                biased;
                _ = cancel.cancelled() => None,
                task = rx.recv() => task,
            }
        };
        let Some(task) = next else {
            break;
        };

        let task_id = task.id().to_string();
        let started = Instant::now();
        let value = match AssertUnwindSafe(task.execute(cancel.clone()))
            .catch_unwind()
            .await
        {
            Ok(value) => value,
            Err(_) => {
                tracing::error!(worker_id, task_id = %task_id, "Task panicked");
                Err(ScribeError::Internal(format!("task {task_id} panicked")))
            }
        };

        let result = TaskResult {
            task_id,
            value,
            duration: started.elapsed(),
        };

        tokio::select! {
            biased;
            _ = cancel.cancelled() => break,
            sent = results.send(result) => {
                if sent.is_err() {
                    tracing::debug!(worker_id, "Result receiver dropped, discarding result");
                }
            }
        }
    }

    tracing::debug!(worker_id, "Worker exited");
}
