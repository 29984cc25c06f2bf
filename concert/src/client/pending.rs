//! Sequencing of multi-step connection workflows.
//!
//! A [`PendingConnection`] runs an ordered list of [`ConnectionTask`]s, one
//! at a time, against a context `C` borrowed on every call. The owner keeps
//! at most one pending connection and replaces it with `None` once it
//! finishes; dropping or aborting it mid-flight resolves its future with
//! [`ConnectionResultCode::Aborted`].

use std::collections::VecDeque;
use std::fmt;
use std::future::Future;
use std::pin::Pin;
use std::task::{Context, Poll};

use tokio::sync::oneshot;

/// Terminal code of a connection workflow.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectionResultCode {
    /// Every task succeeded.
    Success,
    /// A task failed.
    Failed,
    /// A task gave up waiting.
    TimedOut,
    /// The workflow was cancelled.
    Canceled,
    /// The workflow was torn down mid-flight.
    Aborted,
    /// The server refused the connection.
    Rejected,
}

impl fmt::Display for ConnectionResultCode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        fmt::Debug::fmt(self, f)
    }
}

/// Result of a connection workflow.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ConnectionOutcome {
    /// Terminal code.
    pub code: ConnectionResultCode,
    /// Failure reason; empty on success.
    pub reason: String,
}

impl ConnectionOutcome {
    /// Successful outcome.
    pub fn success() -> Self {
        Self {
            code: ConnectionResultCode::Success,
            reason: String::new(),
        }
    }

    /// Outcome with a code and reason.
    pub fn new(code: ConnectionResultCode, reason: impl Into<String>) -> Self {
        Self {
            code,
            reason: reason.into(),
        }
    }

    /// Whether the code is [`ConnectionResultCode::Success`].
    pub fn is_success(&self) -> bool {
        self.code == ConnectionResultCode::Success
    }
}

/// Status reported by a task after every call.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TaskStatus {
    /// Still running.
    Pending,
    /// Done; the next task may start.
    Success,
    /// Done; the whole workflow fails with this outcome.
    Failed(ConnectionOutcome),
}

/// One step of a connection workflow.
pub trait ConnectionTask<C>: Send {
    /// Start the task. Called exactly once.
    fn execute(&mut self, ctx: &mut C);

    /// Make progress. `should_cancel` asks the task to wind down.
    fn tick(&mut self, ctx: &mut C, should_cancel: bool);

    /// Stop immediately, releasing whatever the task holds in `ctx`.
    fn abort(&mut self, ctx: &mut C);

    /// Current status.
    fn status(&self) -> TaskStatus;

    /// Short description for logs.
    fn description(&self) -> String;
}

/// Boxed connection task.
pub type BoxedConnectionTask<C> = Box<dyn ConnectionTask<C>>;

/// Future resolving to the outcome of a [`PendingConnection`].
///
/// Resolves to `Aborted` if the connection is dropped before finishing.
#[derive(Debug)]
pub struct ConnectionFuture {
    rx: oneshot::Receiver<ConnectionOutcome>,
    taken: bool,
}

impl ConnectionFuture {
    /// Take the outcome if available, at most once.
    pub fn try_outcome(&mut self) -> Option<ConnectionOutcome> {
        if self.taken {
            return None;
        }
        let outcome = match self.rx.try_recv() {
            Ok(outcome) => outcome,
            Err(oneshot::error::TryRecvError::Empty) => return None,
            Err(oneshot::error::TryRecvError::Closed) => aborted(),
        };
        self.taken = true;
        Some(outcome)
    }
}

impl Future for ConnectionFuture {
    type Output = ConnectionOutcome;

    fn poll(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Self::Output> {
        Pin::new(&mut self.rx)
            .poll(cx)
            .map(|result| result.unwrap_or_else(|_| aborted()))
    }
}

fn aborted() -> ConnectionOutcome {
    ConnectionOutcome::new(ConnectionResultCode::Aborted, "connection attempt aborted")
}

/// An in-flight connection workflow.
pub struct PendingConnection<C> {
    remaining: VecDeque<BoxedConnectionTask<C>>,
    active: Option<BoxedConnectionTask<C>>,
    should_cancel: bool,
    completion: Option<oneshot::Sender<ConnectionOutcome>>,
}

impl<C> fmt::Debug for PendingConnection<C> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("PendingConnection")
            .field("active", &self.active.as_ref().map(|t| t.description()))
            .field("remaining", &self.remaining.len())
            .field("should_cancel", &self.should_cancel)
            .finish()
    }
}

impl<C> PendingConnection<C> {
    /// Start `tasks[0]` and return the workflow with its future.
    ///
    /// An empty task list succeeds immediately.
    pub fn execute(tasks: Vec<BoxedConnectionTask<C>>, ctx: &mut C) -> (Self, ConnectionFuture) {
        let (tx, rx) = oneshot::channel();
        let mut pending = Self {
            remaining: tasks.into(),
            active: None,
            should_cancel: false,
            completion: Some(tx),
        };
        pending.start_next(ctx);
        (pending, ConnectionFuture { rx, taken: false })
    }

    /// Whether the workflow has resolved its future.
    pub fn is_finished(&self) -> bool {
        self.completion.is_none()
    }

    /// Description of the running task.
    pub fn active_description(&self) -> Option<String> {
        self.active.as_ref().map(|task| task.description())
    }

    /// Ask the running task to cancel. Takes effect on the next tick.
    pub fn cancel(&mut self) {
        self.should_cancel = true;
    }

    /// Poll the running task, advancing or finishing the workflow.
    ///
    /// Returns true once finished.
    pub fn tick(&mut self, ctx: &mut C) -> bool {
        let Some(task) = self.active.as_mut() else {
            return self.is_finished();
        };
        task.tick(ctx, self.should_cancel);
        match task.status() {
            TaskStatus::Pending => {
                if self.should_cancel {
                    task.abort(ctx);
                    self.active = None;
                    self.finish(ConnectionOutcome::new(
                        ConnectionResultCode::Canceled,
                        "connection canceled",
                    ));
                }
            }
            TaskStatus::Success => {
                tracing::debug!(task = %task.description(), "connection task succeeded");
                self.active = None;
                self.start_next(ctx);
            }
            TaskStatus::Failed(outcome) => {
                tracing::info!(
                    task = %task.description(),
                    code = %outcome.code,
                    reason = %outcome.reason,
                    "connection task failed"
                );
                self.active = None;
                self.remaining.clear();
                self.finish(outcome);
            }
        }
        self.is_finished()
    }

    /// Abort the running task and resolve `Aborted`.
    pub fn abort(mut self, ctx: &mut C) {
        if let Some(mut task) = self.active.take() {
            task.abort(ctx);
        }
        self.remaining.clear();
        self.finish(aborted());
    }

    fn start_next(&mut self, ctx: &mut C) {
        match self.remaining.pop_front() {
            Some(mut task) => {
                tracing::debug!(task = %task.description(), "starting connection task");
                task.execute(ctx);
                self.active = Some(task);
            }
            None => self.finish(ConnectionOutcome::success()),
        }
    }

    fn finish(&mut self, outcome: ConnectionOutcome) {
        if let Some(tx) = self.completion.take() {
            let _ = tx.send(outcome);
        }
    }
}

impl<C> Drop for PendingConnection<C> {
    fn drop(&mut self) {
        if !self.is_finished() {
            tracing::debug!("pending connection dropped mid-flight");
            self.finish(aborted());
        }
    }
}
