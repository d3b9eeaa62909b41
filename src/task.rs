//! Cancellable background tasks with progress reporting.
//!
//! Filter passes and searches run off the caller's thread. The caller gets a
//! `TaskHandle` that receives progress events and exactly one outcome.

use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};

use tokio::sync::mpsc;

use crate::error::EngineError;

/// Shared flag polled by long-running work
#[derive(Clone, Debug, Default)]
pub struct CancelToken(Arc<AtomicBool>);

impl CancelToken {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn cancel(&self) {
        self.0.store(true, Ordering::Relaxed);
    }

    pub fn is_cancelled(&self) -> bool {
        self.0.load(Ordering::Relaxed)
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct Progress {
    pub done: usize,
    pub total: usize,
}

/// How a task ended
#[derive(Debug)]
pub enum TaskOutcome<T> {
    Completed(T),
    /// Stopped early; carries whatever was produced before the stop
    Cancelled(T),
    Failed(EngineError),
}

impl<T> TaskOutcome<T> {
    pub fn is_completed(&self) -> bool {
        matches!(self, TaskOutcome::Completed(_))
    }

    /// The result, partial or not
    pub fn value(self) -> Option<T> {
        match self {
            TaskOutcome::Completed(v) | TaskOutcome::Cancelled(v) => Some(v),
            TaskOutcome::Failed(_) => None,
        }
    }
}

#[derive(Debug)]
pub enum TaskEvent<T> {
    Progress(Progress),
    Finished(TaskOutcome<T>),
}

/// Caller side of a background task
pub struct TaskHandle<T> {
    cancel: CancelToken,
    events: mpsc::UnboundedReceiver<TaskEvent<T>>,
}

impl<T> TaskHandle<T> {
    /// Request cooperative cancellation. The outcome still arrives.
    pub fn cancel(&self) {
        self.cancel.cancel();
    }

    pub fn cancel_token(&self) -> CancelToken {
        self.cancel.clone()
    }

    /// Next progress or outcome event; `None` once the outcome was taken
    pub async fn next_event(&mut self) -> Option<TaskEvent<T>> {
        self.events.recv().await
    }

    /// Skip progress events and wait for the outcome
    pub async fn outcome(mut self) -> TaskOutcome<T> {
        while let Some(event) = self.events.recv().await {
            if let TaskEvent::Finished(outcome) = event {
                return outcome;
            }
        }
        TaskOutcome::Failed(EngineError::Cancelled)
    }
}

/// Worker side of a background task.
///
/// Dropping a reporter without finishing reports a failure, so the caller
/// always sees exactly one outcome even if the worker panics.
pub(crate) struct TaskReporter<T> {
    tx: Option<mpsc::UnboundedSender<TaskEvent<T>>>,
}

impl<T> TaskReporter<T> {
    pub(crate) fn progress_sender(&self) -> ProgressSender<T> {
        ProgressSender { tx: self.tx.clone() }
    }

    pub(crate) fn finish(mut self, outcome: TaskOutcome<T>) {
        if let Some(tx) = self.tx.take() {
            let _ = tx.send(TaskEvent::Finished(outcome));
        }
    }
}

impl<T> Drop for TaskReporter<T> {
    fn drop(&mut self) {
        if let Some(tx) = self.tx.take() {
            let _ = tx.send(TaskEvent::Finished(TaskOutcome::Failed(EngineError::Cancelled)));
        }
    }
}

/// Cloneable progress callback, usable from worker threads
pub(crate) struct ProgressSender<T> {
    tx: Option<mpsc::UnboundedSender<TaskEvent<T>>>,
}

impl<T> ProgressSender<T> {
    pub(crate) fn report(&self, done: usize, total: usize) {
        if let Some(tx) = &self.tx {
            let _ = tx.send(TaskEvent::Progress(Progress { done, total }));
        }
    }
}

/// Create a connected handle/reporter pair
pub(crate) fn task_channel<T>(cancel: CancelToken) -> (TaskHandle<T>, TaskReporter<T>) {
    let (tx, rx) = mpsc::unbounded_channel();
    (
        TaskHandle { cancel, events: rx },
        TaskReporter { tx: Some(tx) },
    )
}
