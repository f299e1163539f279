mod config;
mod error;
mod progress;
mod report;
mod run;
mod scheduler;
mod task;
mod worker;

pub use config::{
    DEFAULT_DURATION, DEFAULT_GRACE_PERIOD, DEFAULT_PROGRESS_INTERVAL, DEFAULT_WORKERS,
    MAX_RUN_SPAN, RunConfiguration, RunOptions,
};
pub use error::{Error, ErrorClass, Result};
pub use progress::{LiveMetrics, ProgressUpdate, RunPhase};
pub use report::{ReportSink, RunOutcome, RunReport, SinkError, StopReason};
pub use run::{LoadTestRunner, RunState};
pub use scheduler::{MAX_TICK_INTERVAL, RateScheduler, next_delay};
pub use task::{Blocking, BlockingTask, Task, TaskContext, TaskError};
pub use worker::{Worker, WorkerHandle, WorkerOptions, WorkerReport, WorkerStats, WorkerStatus};
