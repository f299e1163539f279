use std::future::Future;
use std::sync::Arc;

use pubload_metrics::MetricsRecorder;

use super::error::ErrorClass;

/// Failure of a single task invocation.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum TaskError {
    /// The worker logs it and keeps going.
    #[error("transient: {0}")]
    Transient(String),

    /// The worker stops; other workers are unaffected.
    #[error("fatal: {0}")]
    Fatal(String),
}

impl TaskError {
    pub fn transient(message: impl Into<String>) -> Self {
        Self::Transient(message.into())
    }

    pub fn fatal(message: impl Into<String>) -> Self {
        Self::Fatal(message.into())
    }

    pub fn is_fatal(&self) -> bool {
        matches!(self, Self::Fatal(_))
    }

    pub fn class(&self) -> ErrorClass {
        match self {
            Self::Transient(_) => ErrorClass::Transient,
            Self::Fatal(_) => ErrorClass::Fatal,
        }
    }

    pub fn message(&self) -> &str {
        match self {
            Self::Transient(m) | Self::Fatal(m) => m,
        }
    }
}

/// One unit of backend work (publish a batch, poll once) that a worker invokes on
/// every tick. Tasks report their own latency/count through the recorder they were
/// built with.
pub trait Task: Send + 'static {
    fn run(&mut self) -> impl Future<Output = Result<(), TaskError>> + Send;

    /// Called once when the owning worker stops, after the last `run`.
    fn shutdown(&mut self) -> impl Future<Output = ()> + Send {
        async {}
    }
}

/// Everything a task factory gets to build the task for one worker.
#[derive(Debug)]
pub struct TaskContext<P> {
    pub worker_id: u64,
    pub worker_count: u64,
    /// This worker's share of the target rate, in invocations per second.
    pub rate_share: f64,
    pub params: Arc<P>,
    pub recorder: MetricsRecorder,
}

impl<P> Clone for TaskContext<P> {
    fn clone(&self) -> Self {
        Self {
            worker_id: self.worker_id,
            worker_count: self.worker_count,
            rate_share: self.rate_share,
            params: self.params.clone(),
            recorder: self.recorder.clone(),
        }
    }
}

/// Synchronous counterpart of [`Task`] for clients that block (e.g. `poll(timeout)`).
/// Wrap it in [`Blocking`] to run it on the blocking thread pool.
pub trait BlockingTask: Send + 'static {
    fn run(&mut self) -> Result<(), TaskError>;

    fn shutdown(&mut self) {}
}

/// Adapts a [`BlockingTask`] to [`Task`] via `spawn_blocking`.
#[derive(Debug)]
pub struct Blocking<T> {
    inner: Option<T>,
}

impl<T: BlockingTask> Blocking<T> {
    pub fn new(task: T) -> Self {
        Self { inner: Some(task) }
    }

    /// `None` only while an invocation is in flight or after a panic.
    pub fn get_ref(&self) -> Option<&T> {
        self.inner.as_ref()
    }
}

impl<T: BlockingTask> Task for Blocking<T> {
    async fn run(&mut self) -> Result<(), TaskError> {
        let Some(mut task) = self.inner.take() else {
            return Err(TaskError::fatal("blocking task is gone after a previous panic"));
        };

        let (task, res) = tokio::task::spawn_blocking(move || {
            let res = task.run();
            (task, res)
        })
        .await
        .map_err(|err| TaskError::fatal(format!("blocking task panicked: {err}")))?;

        self.inner = Some(task);
        res
    }

    async fn shutdown(&mut self) {
        if let Some(mut task) = self.inner.take() {
            let _ = tokio::task::spawn_blocking(move || task.shutdown()).await;
        }
    }
}
