//! Bounded asynchronous task execution.
//!
//! [`TaskRunner`] is an explicitly constructed, explicitly shut-down
//! service: a fixed pool of worker tasks drains one bounded admission queue
//! whose receiver is shared behind a mutex. Submission beyond the queue
//! capacity is a caller-visible [`WatchworkError::QueueFull`], never a
//! silent drop. Completed executions retire from the active set into a
//! capped history ring.
//!
//! The execution policy lives in [`drive`], one shared recursive routine
//! used for top-level runs, sequence components, and continuation chains:
//! begin the monitor, run the body under panic isolation racing the
//! cancellation token and the optional timeout, force an idempotent
//! terminal state, then run exactly one of the success/error chains under a
//! nested reporter. Failures surface only through the monitor; the
//! submitter never sees a raised error.

use std::collections::{HashMap, VecDeque};
use std::fmt;
use std::panic::AssertUnwindSafe;
use std::path::PathBuf;
use std::sync::{Arc, Weak};
use std::time::Duration;

use chrono::{DateTime, Utc};
use futures::FutureExt;
use futures::future::BoxFuture;
use tokio::sync::{RwLock, mpsc, watch};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};
use uuid::Uuid;

use crate::actions::{Action, ActionContext, Params};
use crate::progress::ProgressReporter;
use crate::{Result, WatchworkError};
use watchwork_model::ExecutionStatus;

/// Unique identifier for one action execution.
#[derive(Clone, Copy, Debug, Eq, PartialEq, Hash)]
pub struct ExecutionId(pub Uuid);

impl ExecutionId {
    pub fn new() -> Self {
        Self(Uuid::now_v7())
    }
}

impl Default for ExecutionId {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Display for ExecutionId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Configuration for one task runner instance.
#[derive(Debug, Clone)]
pub struct RunnerConfig {
    /// Number of worker tasks.
    pub workers: usize,
    /// Admission queue capacity; submissions beyond it fail with
    /// [`WatchworkError::QueueFull`].
    pub queue_capacity: usize,
    /// Completed executions retained for lookup; oldest evicted beyond
    /// this.
    pub history_capacity: usize,
    /// Working directory and resolution root for script actions.
    pub scripts_root: PathBuf,
}

impl Default for RunnerConfig {
    fn default() -> Self {
        Self {
            workers: 4,
            queue_capacity: 64,
            history_capacity: 256,
            scripts_root: PathBuf::from("scripts"),
        }
    }
}

/// One run of one action.
pub struct Execution {
    pub id: ExecutionId,
    action_name: String,
    pub params: Params,
    pub reporter: Arc<ProgressReporter>,
    cancel: CancellationToken,
    cancel_reason: Arc<std::sync::Mutex<Option<String>>>,
    submitted_at: DateTime<Utc>,
    started_at: std::sync::Mutex<Option<DateTime<Utc>>>,
    finished_at: std::sync::Mutex<Option<DateTime<Utc>>>,
    done: watch::Sender<bool>,
}

impl Execution {
    fn new(action_name: &str, params: Params, reporter: Arc<ProgressReporter>) -> Self {
        let (done, _) = watch::channel(false);
        Self {
            id: ExecutionId::new(),
            action_name: action_name.to_string(),
            params,
            reporter,
            cancel: CancellationToken::new(),
            cancel_reason: Arc::new(std::sync::Mutex::new(None)),
            submitted_at: Utc::now(),
            started_at: std::sync::Mutex::new(None),
            finished_at: std::sync::Mutex::new(None),
            done,
        }
    }

    pub fn action_name(&self) -> &str {
        &self.action_name
    }

    pub fn status(&self) -> ExecutionStatus {
        ExecutionStatus {
            id: self.id.to_string(),
            action: self.action_name.clone(),
            snapshot: self.reporter.snapshot(),
            submitted_at: self.submitted_at,
            started_at: *self.started_at.lock().expect("execution time poisoned"),
            finished_at: *self.finished_at.lock().expect("execution time poisoned"),
        }
    }
}

impl fmt::Debug for Execution {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Execution")
            .field("id", &self.id)
            .field("action", &self.action_name)
            .finish()
    }
}

/// Caller-side view of one submitted execution. Completion is observed
/// through the reporter; `wait` blocks until the execution retires.
pub struct ExecutionHandle {
    pub id: ExecutionId,
    pub reporter: Arc<ProgressReporter>,
    done: watch::Receiver<bool>,
}

impl ExecutionHandle {
    pub async fn wait(&mut self) {
        // A dropped sender also means the execution is finished (or the
        // runner is gone); either way there is nothing left to wait for.
        let _ = self.done.wait_for(|done| *done).await;
    }
}

impl fmt::Debug for ExecutionHandle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ExecutionHandle")
            .field("id", &self.id)
            .finish()
    }
}

struct QueueItem {
    execution: Arc<Execution>,
    action: Arc<dyn Action>,
}

struct RunnerInner {
    config: RunnerConfig,
    /// Intake; `None` once the runner is shut down.
    queue_tx: std::sync::Mutex<Option<mpsc::Sender<QueueItem>>>,
    queue_rx: Arc<tokio::sync::Mutex<mpsc::Receiver<QueueItem>>>,
    active: RwLock<HashMap<ExecutionId, Arc<Execution>>>,
    history: tokio::sync::Mutex<VecDeque<Arc<Execution>>>,
    workers: std::sync::Mutex<Vec<tokio::task::JoinHandle<()>>>,
    shutdown: CancellationToken,
}

/// Bounded worker pool executing submitted actions. Cheap to clone; clones
/// share the pool.
#[derive(Clone)]
pub struct TaskRunner {
    inner: Arc<RunnerInner>,
}

impl fmt::Debug for TaskRunner {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("TaskRunner")
            .field("workers", &self.inner.config.workers)
            .field("queue_capacity", &self.inner.config.queue_capacity)
            .finish()
    }
}

impl TaskRunner {
    pub fn new(config: RunnerConfig) -> Self {
        let worker_count = config.workers.max(1);
        let (queue_tx, queue_rx) = mpsc::channel(config.queue_capacity.max(1));
        let queue_rx = Arc::new(tokio::sync::Mutex::new(queue_rx));
        let shutdown = CancellationToken::new();

        let runner = Self {
            inner: Arc::new(RunnerInner {
                config,
                queue_tx: std::sync::Mutex::new(Some(queue_tx)),
                queue_rx: Arc::clone(&queue_rx),
                active: RwLock::new(HashMap::new()),
                history: tokio::sync::Mutex::new(VecDeque::new()),
                workers: std::sync::Mutex::new(Vec::new()),
                shutdown: shutdown.clone(),
            }),
        };

        let mut workers = Vec::with_capacity(worker_count);
        for id in 0..worker_count {
            let rx = Arc::clone(&queue_rx);
            let inner = Arc::downgrade(&runner.inner);
            let token = shutdown.clone();
            workers.push(tokio::spawn(worker_loop(id, rx, inner, token)));
        }
        *runner.inner.workers.lock().expect("worker handles poisoned") = workers;

        info!("Started {} task runner workers", worker_count);
        runner
    }

    /// Submit an action with a fresh reporter.
    pub async fn submit(
        &self,
        action: Arc<dyn Action>,
        params: Params,
    ) -> Result<ExecutionHandle> {
        self.submit_with_reporter(action, params, ProgressReporter::new())
            .await
    }

    /// Submit an action reporting through `reporter` (typically a nested
    /// reporter owned by a compound action).
    pub async fn submit_with_reporter(
        &self,
        action: Arc<dyn Action>,
        params: Params,
        reporter: Arc<ProgressReporter>,
    ) -> Result<ExecutionHandle> {
        let execution = Arc::new(Execution::new(action.name(), params, reporter));
        let handle = ExecutionHandle {
            id: execution.id,
            reporter: Arc::clone(&execution.reporter),
            done: execution.done.subscribe(),
        };

        self.inner
            .active
            .write()
            .await
            .insert(execution.id, Arc::clone(&execution));

        let tx = self
            .inner
            .queue_tx
            .lock()
            .expect("queue sender poisoned")
            .clone();
        let Some(tx) = tx else {
            self.inner.active.write().await.remove(&execution.id);
            return Err(WatchworkError::Internal("Runner is shut down".into()));
        };

        match tx.try_send(QueueItem {
            execution: Arc::clone(&execution),
            action,
        }) {
            Ok(()) => {
                debug!(
                    "Submitted '{}' as execution {}",
                    execution.action_name, execution.id
                );
                Ok(handle)
            }
            Err(mpsc::error::TrySendError::Full(_)) => {
                self.inner.active.write().await.remove(&execution.id);
                Err(WatchworkError::QueueFull)
            }
            Err(mpsc::error::TrySendError::Closed(_)) => {
                self.inner.active.write().await.remove(&execution.id);
                Err(WatchworkError::Internal("Runner is shut down".into()))
            }
        }
    }

    /// Cooperatively cancel an active execution. The terminal state is
    /// failed with a cancellation message; a cancel racing natural
    /// completion is a no-op because termination is idempotent.
    pub async fn cancel(&self, id: ExecutionId, reason: impl Into<String>) -> Result<()> {
        let execution = self
            .inner
            .active
            .read()
            .await
            .get(&id)
            .cloned()
            .ok_or_else(|| WatchworkError::NotFound(format!("execution {}", id)))?;

        let reason = reason.into();
        info!("Cancelling execution {}: {}", id, reason);
        *execution
            .cancel_reason
            .lock()
            .expect("cancel reason poisoned") = Some(reason);
        execution.cancel.cancel();
        Ok(())
    }

    pub async fn active(&self) -> Vec<Arc<Execution>> {
        self.inner.active.read().await.values().cloned().collect()
    }

    /// Look up an execution in the active set first, then the history ring.
    pub async fn get(&self, id: ExecutionId) -> Option<Arc<Execution>> {
        if let Some(execution) = self.inner.active.read().await.get(&id) {
            return Some(Arc::clone(execution));
        }
        self.inner
            .history
            .lock()
            .await
            .iter()
            .find(|execution| execution.id == id)
            .cloned()
    }

    /// Stop intake, let in-flight work finish, and join the workers.
    /// Queued-but-unstarted submissions are failed, not silently dropped.
    pub async fn shutdown(&self) {
        info!("Shutting down task runner");
        self.inner
            .queue_tx
            .lock()
            .expect("queue sender poisoned")
            .take();
        self.inner.shutdown.cancel();

        let handles: Vec<_> = std::mem::take(
            &mut *self.inner.workers.lock().expect("worker handles poisoned"),
        );
        for handle in handles {
            let _ = handle.await;
        }

        // Fail whatever never reached a worker so every submission still
        // reaches a terminal state.
        let mut rx = self.inner.queue_rx.lock().await;
        while let Ok(item) = rx.try_recv() {
            item.execution
                .reporter
                .terminate_failure("runner shut down before execution started");
            self.retire(&item.execution).await;
        }
        info!("Task runner shutdown complete");
    }

    async fn process(&self, item: QueueItem) {
        let execution = item.execution;
        *execution
            .started_at
            .lock()
            .expect("execution time poisoned") = Some(Utc::now());
        debug!(
            "Executing '{}' ({})",
            execution.action_name, execution.id
        );

        let ctx = ActionContext {
            runner: self.clone(),
            scripts_root: self.inner.config.scripts_root.clone(),
            cancel: execution.cancel.clone(),
            cancel_reason: Arc::clone(&execution.cancel_reason),
        };
        drive(
            ctx,
            item.action,
            execution.params.clone(),
            Arc::clone(&execution.reporter),
        )
        .await;

        *execution
            .finished_at
            .lock()
            .expect("execution time poisoned") = Some(Utc::now());
        self.retire(&execution).await;
    }

    async fn retire(&self, execution: &Arc<Execution>) {
        self.inner.active.write().await.remove(&execution.id);
        let mut history = self.inner.history.lock().await;
        history.push_back(Arc::clone(execution));
        while history.len() > self.inner.config.history_capacity {
            history.pop_front();
        }
        drop(history);
        let _ = execution.done.send(true);
    }
}

async fn worker_loop(
    id: usize,
    rx: Arc<tokio::sync::Mutex<mpsc::Receiver<QueueItem>>>,
    inner: Weak<RunnerInner>,
    shutdown: CancellationToken,
) {
    debug!("Worker {} started", id);
    loop {
        let item = tokio::select! {
            _ = shutdown.cancelled() => break,
            item = async { rx.lock().await.recv().await } => item,
        };
        let Some(item) = item else { break };
        let Some(inner) = inner.upgrade() else { break };
        TaskRunner { inner }.process(item).await;
    }
    debug!("Worker {} stopped", id);
}

/// Outcome of racing an action body against its timeout and cancellation.
enum BodyOutcome {
    Finished(std::thread::Result<anyhow::Result<Params>>),
    TimedOut(Duration),
    Cancelled,
}

/// The shared execution policy (see module docs). Returns the action's
/// output parameters on success, the input parameters otherwise.
pub(crate) fn drive(
    ctx: ActionContext,
    action: Arc<dyn Action>,
    params: Params,
    reporter: Arc<ProgressReporter>,
) -> BoxFuture<'static, Params> {
    Box::pin(async move {
        reporter.begin();

        let outcome = {
            let body = AssertUnwindSafe(action.run(
                &ctx,
                params.clone(),
                Arc::clone(&reporter),
            ))
            .catch_unwind();
            match action.timeout().filter(|limit| !limit.is_zero()) {
                Some(limit) => tokio::select! {
                    _ = ctx.cancel.cancelled() => BodyOutcome::Cancelled,
                    result = tokio::time::timeout(limit, body) => match result {
                        Ok(finished) => BodyOutcome::Finished(finished),
                        Err(_) => BodyOutcome::TimedOut(limit),
                    },
                },
                None => tokio::select! {
                    _ = ctx.cancel.cancelled() => BodyOutcome::Cancelled,
                    finished = body => BodyOutcome::Finished(finished),
                },
            }
        };

        let output = match outcome {
            BodyOutcome::Finished(Ok(Ok(output))) => {
                // No-op when the body already terminated the monitor; the
                // body's verdict wins.
                reporter.terminate_success();
                Some(output)
            }
            BodyOutcome::Finished(Ok(Err(error))) => {
                reporter.terminate_failure(format!(
                    "action '{}' failed: {:#}",
                    action.name(),
                    error
                ));
                None
            }
            BodyOutcome::Finished(Err(panic)) => {
                warn!("Action '{}' panicked", action.name());
                reporter.terminate_failure(format!(
                    "action '{}' panicked: {}",
                    action.name(),
                    panic_message(panic.as_ref())
                ));
                None
            }
            BodyOutcome::TimedOut(limit) => {
                reporter.terminate_failure(format!(
                    "action '{}' timeout after {}ms",
                    action.name(),
                    limit.as_millis()
                ));
                None
            }
            BodyOutcome::Cancelled => {
                let reason = ctx
                    .cancel_reason()
                    .unwrap_or_else(|| "cancelled by caller".to_string());
                reporter.terminate_failure(format!(
                    "action '{}' cancelled: {}",
                    action.name(),
                    reason
                ));
                None
            }
        };

        // A terminal state is always reached; no error kind silently
        // disappears.
        if !reporter.is_terminated() {
            reporter.terminate_failure(format!(
                "action '{}' finished without reporting a terminal state",
                action.name()
            ));
        }

        // Exactly one continuation per terminal execution, under a nested
        // reporter so a failing continuation never flips this terminal
        // state. The success chain sees the output parameters, the error
        // chain the original ones.
        if reporter.succeeded() {
            let result = output.unwrap_or_else(|| params.clone());
            if let Some(next) = action.on_success() {
                drive(ctx.clone(), next, result.clone(), reporter.nested()).await;
            }
            result
        } else {
            if let Some(next) = action.on_error() {
                drive(ctx.clone(), next, params.clone(), reporter.nested()).await;
            }
            params
        }
    })
}

fn panic_message(payload: &(dyn std::any::Any + Send)) -> String {
    if let Some(text) = payload.downcast_ref::<&str>() {
        (*text).to_string()
    } else if let Some(text) = payload.downcast_ref::<String>() {
        text.clone()
    } else {
        "non-string panic payload".to_string()
    }
}
