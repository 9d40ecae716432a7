//! Work items executed on the pipeline thread.

use crate::error::HostError;
use crate::host::cancellation::LinkedToken;
use crate::host::options::ExecutionOptions;
use crate::host::pipeline::PipelineContext;
use std::future::Future;
use std::panic::{catch_unwind, AssertUnwindSafe};
use std::pin::Pin;
use std::task::{Context, Poll};
use tokio::sync::oneshot;
use tracing::{debug, warn};

/// Task ID for tracking a submission through the queue
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct TaskId(u64);

impl TaskId {
    /// Generate the next task ID
    pub fn next() -> Self {
        use std::sync::atomic::{AtomicU64, Ordering};
        static COUNTER: AtomicU64 = AtomicU64::new(1);
        TaskId(COUNTER.fetch_add(1, Ordering::Relaxed))
    }

    pub fn as_u64(self) -> u64 {
        self.0
    }
}

impl std::fmt::Display for TaskId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "task-{}", self.0)
    }
}

/// Final state of a work item's result slot
#[derive(Debug)]
pub enum TaskOutcome<T> {
    Completed(T),
    Faulted(HostError),
    Canceled,
}

impl<T> TaskOutcome<T> {
    pub fn kind(&self) -> OutcomeKind {
        match self {
            TaskOutcome::Completed(_) => OutcomeKind::Completed,
            TaskOutcome::Faulted(_) => OutcomeKind::Faulted,
            TaskOutcome::Canceled => OutcomeKind::Canceled,
        }
    }

    pub fn is_canceled(&self) -> bool {
        matches!(self, TaskOutcome::Canceled)
    }

    pub fn into_result(self) -> Result<T, HostError> {
        match self {
            TaskOutcome::Completed(value) => Ok(value),
            TaskOutcome::Faulted(err) => Err(err),
            TaskOutcome::Canceled => Err(HostError::Canceled),
        }
    }
}

/// Outcome without the payload, used for statistics and logging
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum OutcomeKind {
    Completed,
    Faulted,
    Canceled,
}

/// A unit of work the pipeline thread runs synchronously
pub trait SynchronousTask: Send {
    fn id(&self) -> TaskId;

    fn description(&self) -> &str;

    fn options(&self) -> &ExecutionOptions;

    /// Run the task and resolve its result slot
    fn execute(self: Box<Self>, ctx: &mut PipelineContext, executor_token: &LinkedToken)
        -> OutcomeKind;

    /// Resolve the result slot as canceled without running
    fn cancel(self: Box<Self>);
}

pub type WorkItem = Box<dyn SynchronousTask>;

type TaskBody<T> = Box<dyn FnOnce(&mut PipelineContext, &LinkedToken) -> Result<T, HostError> + Send>;

/// Work item wrapping a closure over the pipeline context
pub struct DelegateTask<T> {
    id: TaskId,
    description: String,
    options: ExecutionOptions,
    requester_token: LinkedToken,
    body: TaskBody<T>,
    completion_tx: oneshot::Sender<TaskOutcome<T>>,
}

impl<T: Send + 'static> DelegateTask<T> {
    pub fn new<F>(
        description: impl Into<String>,
        options: ExecutionOptions,
        requester_token: LinkedToken,
        body: F,
    ) -> (Self, TaskHandle<T>)
    where
        F: FnOnce(&mut PipelineContext, &LinkedToken) -> Result<T, HostError> + Send + 'static,
    {
        let (completion_tx, completion_rx) = oneshot::channel();
        let id = TaskId::next();
        let task = Self {
            id,
            description: description.into(),
            options,
            requester_token,
            body: Box::new(body),
            completion_tx,
        };
        (task, TaskHandle { id, rx: completion_rx })
    }

    pub fn into_work_item(self) -> WorkItem {
        Box::new(self)
    }
}

impl<T: Send + 'static> SynchronousTask for DelegateTask<T> {
    fn id(&self) -> TaskId {
        self.id
    }

    fn description(&self) -> &str {
        &self.description
    }

    fn options(&self) -> &ExecutionOptions {
        &self.options
    }

    fn execute(
        self: Box<Self>,
        ctx: &mut PipelineContext,
        executor_token: &LinkedToken,
    ) -> OutcomeKind {
        let DelegateTask {
            id,
            description,
            requester_token,
            body,
            completion_tx,
            ..
        } = *self;

        let token = requester_token.linked_with(executor_token);
        let outcome = if token.is_cancelled() {
            TaskOutcome::Canceled
        } else {
            debug!(task_id = id.as_u64(), task = %description, "Executing work item");
            match catch_unwind(AssertUnwindSafe(|| body(ctx, &token))) {
                Ok(Ok(value)) => TaskOutcome::Completed(value),
                Ok(Err(err)) if err.is_cancellation() => TaskOutcome::Canceled,
                Ok(Err(err)) => {
                    debug!(task_id = id.as_u64(), error = %err, "Work item faulted");
                    TaskOutcome::Faulted(err)
                }
                Err(panic) => {
                    let message = panic_message(panic.as_ref());
                    warn!(task_id = id.as_u64(), task = %description, panic = %message, "Work item panicked");
                    TaskOutcome::Faulted(HostError::Faulted(message))
                }
            }
        };

        let kind = outcome.kind();
        // Receiver may already be gone; the outcome is still counted
        let _ = completion_tx.send(outcome);
        kind
    }

    fn cancel(self: Box<Self>) {
        let _ = self.completion_tx.send(TaskOutcome::Canceled);
    }
}

pub(crate) fn panic_message(panic: &(dyn std::any::Any + Send)) -> String {
    if let Some(s) = panic.downcast_ref::<&str>() {
        (*s).to_string()
    } else if let Some(s) = panic.downcast_ref::<String>() {
        s.clone()
    } else {
        "unknown panic".to_string()
    }
}

/// Future resolving to a submitted task's outcome
#[derive(Debug)]
pub struct TaskHandle<T> {
    id: TaskId,
    rx: oneshot::Receiver<TaskOutcome<T>>,
}

impl<T> TaskHandle<T> {
    pub fn id(&self) -> TaskId {
        self.id
    }

    /// Block the calling thread until the outcome is known.
    /// Must not be called from inside an async runtime worker.
    pub fn blocking_wait(self) -> TaskOutcome<T> {
        futures::executor::block_on(self)
    }
}

impl<T> Future for TaskHandle<T> {
    type Output = TaskOutcome<T>;

    fn poll(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Self::Output> {
        // A dropped sender means the item was discarded without running
        Pin::new(&mut self.rx)
            .poll(cx)
            .map(|res| res.unwrap_or(TaskOutcome::Canceled))
    }
}
