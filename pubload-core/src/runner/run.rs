use std::fmt::Display;
use std::future::Future;
use std::sync::Arc;
use std::time::Duration;

use pubload_metrics::{LatencyMetric, MetricsAggregator, RateSeries, per_sec};
use tokio::sync::watch;
use tokio::time::{Instant, MissedTickBehavior};
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use super::config::{RunConfiguration, RunOptions};
use super::error::{Error, Result};
use super::progress::{LiveMetrics, ProgressUpdate, RunPhase};
use super::report::{ReportSink, RunReport, StopReason};
use super::task::{Task, TaskContext};
use super::worker::{ExitLatch, Worker, WorkerHandle, WorkerOptions, WorkerStats};

#[derive(Debug, Clone, Copy, PartialEq, Eq, strum::Display)]
#[strum(serialize_all = "snake_case")]
pub enum RunState {
    Configured,
    Starting,
    Running,
    Stopping,
    Completed,
    Failed,
}

impl RunState {
    pub fn is_terminal(self) -> bool {
        matches!(self, Self::Completed | Self::Failed)
    }
}

/// Drives one load test: builds a task per worker, runs them at the configured rate
/// for the configured duration, then stops them and reports.
///
/// The factory is called once per worker, concurrently, with that worker's
/// [`TaskContext`].
pub struct LoadTestRunner<P, F> {
    options: RunOptions,
    params: P,
    factory: F,
    metric: LatencyMetric,
    cancel: CancellationToken,
    state: watch::Sender<RunState>,
    sink: Option<Arc<dyn ReportSink>>,
}

impl<P, F> LoadTestRunner<P, F> {
    pub fn new(options: RunOptions, params: P, factory: F) -> Self {
        let (state, _) = watch::channel(RunState::Configured);
        Self {
            options,
            params,
            factory,
            metric: LatencyMetric::EndToEndLatency,
            cancel: CancellationToken::new(),
            state,
            sink: None,
        }
    }

    pub fn with_sink(mut self, sink: Arc<dyn ReportSink>) -> Self {
        self.sink = Some(sink);
        self
    }

    /// Names the latency the tasks record; defaults to end-to-end latency.
    pub fn with_latency_metric(mut self, metric: LatencyMetric) -> Self {
        self.metric = metric;
        self
    }

    /// Cancelling this token moves a running test to `Stopping` before the
    /// duration elapses.
    pub fn cancel_token(&self) -> CancellationToken {
        self.cancel.clone()
    }

    pub fn state(&self) -> watch::Receiver<RunState> {
        self.state.subscribe()
    }
}

impl<P, F, Fut, T, E> LoadTestRunner<P, F>
where
    P: Send + Sync + 'static,
    F: Fn(TaskContext<P>) -> Fut + Clone + Send + Sync + 'static,
    Fut: Future<Output = std::result::Result<T, E>> + Send + 'static,
    T: Task,
    E: Display + Send + 'static,
{
    pub async fn run(self) -> Result<RunReport> {
        let Self {
            options,
            params,
            factory,
            metric,
            cancel,
            state,
            sink,
        } = self;

        let transition = |next: RunState| {
            info!(state = %next, "run state changed");
            state.send_replace(next);
        };

        let config = match RunConfiguration::from_options(options, params) {
            Ok(config) => config,
            Err(err) => {
                error!(%err, "invalid run configuration");
                transition(RunState::Failed);
                return Err(err);
            }
        };
        transition(RunState::Starting);

        let aggregator = MetricsAggregator::new(metric);
        let tasks = match build_tasks(&config, &aggregator, &factory).await {
            Ok(tasks) => tasks,
            Err(err) => {
                transition(RunState::Failed);
                return Err(err);
            }
        };

        let scheduler = config.scheduler();
        let worker_options = WorkerOptions {
            max_transient_errors: config.max_transient_errors(),
            seed: config.seed(),
        };
        let stop = cancel.child_token();
        let latch = Arc::new(ExitLatch::new(config.workers()));

        let burn_in = config.burn_in();
        if burn_in.is_zero() {
            aggregator.start_measuring();
        } else {
            aggregator.begin_burn_in();
        }

        let epoch = Instant::now();
        let bounds = epoch.checked_add(burn_in).and_then(|burn_in_end| {
            let deadline = burn_in_end.checked_add(config.duration())?;
            let latest = deadline.checked_add(config.grace_period())?;
            Some((burn_in_end, deadline, latest))
        });
        let Some((burn_in_end, deadline, latest)) = bounds else {
            error!(?burn_in, duration = ?config.duration(), "run window is not representable");
            for (_, mut task) in tasks {
                task.shutdown().await;
            }
            transition(RunState::Failed);
            return Err(Error::RunTooLong);
        };

        let handles: Vec<WorkerHandle> = tasks
            .into_iter()
            .map(|(worker_id, task)| {
                Worker::new(worker_id, task, scheduler, worker_options)
                    .with_stop_token(stop.child_token())
                    .with_exit_latch(latch.clone())
                    .start_at(epoch)
            })
            .collect();
        transition(RunState::Running);

        let progress_handle = match (config.progress_interval(), sink.clone()) {
            (Some(every), Some(sink)) => Some(tokio::spawn(
                ProgressLoop {
                    sink,
                    aggregator: aggregator.clone(),
                    workers: handles.iter().map(WorkerHandle::stats).collect(),
                    every,
                    epoch,
                    total_duration: deadline.duration_since(epoch),
                    target_rate: config.target_rate(),
                }
                .run(),
            )),
            _ => None,
        };

        let stop_reason = tokio::select! {
            _ = async {
                if !burn_in.is_zero() {
                    tokio::time::sleep_until(burn_in_end).await;
                    aggregator.start_measuring();
                    info!(?burn_in, "burn-in complete");
                }
                tokio::time::sleep_until(deadline).await;
            } => StopReason::DurationElapsed,
            _ = cancel.cancelled() => StopReason::Cancelled,
            _ = latch.wait() => StopReason::AllWorkersExited,
        };

        transition(RunState::Stopping);
        info!(reason = %stop_reason, "stopping workers");
        stop.cancel();
        aggregator.stop_measuring();

        let grace_deadline = Instant::now()
            .checked_add(config.grace_period())
            .unwrap_or(latest);
        let mut reports = Vec::with_capacity(handles.len());
        for mut handle in handles {
            match handle.join_until(grace_deadline).await {
                Some(report) => reports.push(report),
                None => {
                    warn!(
                        worker_id = handle.id(),
                        grace_period = ?config.grace_period(),
                        "worker did not stop within the grace period; abandoning it"
                    );
                    reports.push(handle.abandon());
                }
            }
        }

        if let Some(h) = progress_handle {
            h.abort();
            let _ = h.await;
        }

        let report = RunReport::new(
            stop_reason,
            config.target_rate(),
            aggregator.snapshot(),
            reports,
        );
        transition(RunState::Completed);

        if let Some(sink) = &sink {
            sink.report(&report)
                .map_err(|err| Error::Sink(err.to_string()))?;
        }

        Ok(report)
    }
}

async fn build_tasks<P, F, Fut, T, E>(
    config: &RunConfiguration<P>,
    aggregator: &MetricsAggregator,
    factory: &F,
) -> Result<Vec<(u64, T)>>
where
    P: Send + Sync + 'static,
    F: Fn(TaskContext<P>) -> Fut + Clone + Send + Sync + 'static,
    Fut: Future<Output = std::result::Result<T, E>> + Send + 'static,
    T: Task,
    E: Display + Send + 'static,
{
    let workers = config.workers();
    let rate_share = config.scheduler().per_worker_rate();

    let mut pending = Vec::with_capacity(usize::try_from(workers).unwrap_or(0));
    for worker_id in 1..=workers {
        let ctx = TaskContext {
            worker_id,
            worker_count: workers,
            rate_share,
            params: config.params().clone(),
            recorder: aggregator.recorder(worker_id),
        };
        let factory = factory.clone();
        pending.push((worker_id, tokio::spawn(async move { factory(ctx).await })));
    }

    let mut built = Vec::with_capacity(pending.len());
    let mut first_err: Option<Error> = None;
    for (worker_id, handle) in pending {
        match handle.await {
            Ok(Ok(task)) => built.push((worker_id, task)),
            Ok(Err(err)) => {
                first_err.get_or_insert(Error::TaskConstruction {
                    worker_id,
                    message: err.to_string(),
                });
            }
            Err(err) => {
                first_err.get_or_insert(Error::TaskConstruction {
                    worker_id,
                    message: format!("task factory panicked: {err}"),
                });
            }
        }
    }

    if let Some(err) = first_err {
        error!(%err, built = built.len(), "task construction failed");
        for (_, mut task) in built {
            task.shutdown().await;
        }
        return Err(err);
    }

    debug!(workers, "all tasks constructed");
    Ok(built)
}

struct ProgressLoop {
    sink: Arc<dyn ReportSink>,
    aggregator: MetricsAggregator,
    workers: Vec<Arc<WorkerStats>>,
    every: Duration,
    epoch: Instant,
    total_duration: Duration,
    target_rate: f64,
}

impl ProgressLoop {
    async fn run(self) {
        let mut interval = tokio::time::interval(self.every);
        interval.set_missed_tick_behavior(MissedTickBehavior::Delay);
        // The first tick completes immediately.
        interval.tick().await;

        let mut tick: u64 = 0;
        let mut last_at = Instant::now();
        let mut rates = RateSeries::starting_at(self.aggregator.messages_observed());

        loop {
            interval.tick().await;

            tick = tick.saturating_add(1);
            let now = Instant::now();
            let dt = now.duration_since(last_at);
            last_at = now;

            let measuring = self.aggregator.is_measuring();
            let messages_per_sec_now =
                rates.advance(self.aggregator.messages_observed(), dt, measuring);
            let phase = if measuring {
                RunPhase::Measuring
            } else {
                RunPhase::BurnIn
            };

            let window = self.aggregator.take_window();
            let messages_total = self.aggregator.messages_total();

            let mut metrics = LiveMetrics {
                messages_per_sec_now,
                messages_total,
                messages_per_sec_avg: per_sec(messages_total, self.aggregator.elapsed()),
                messages_per_sec_stdev: rates.stdev(),
                messages_per_sec_max: rates.max(),
                latency_p50_ms_now: window.p50,
                latency_p95_ms_now: window.p95,
                latency_p99_ms_now: window.p99,
                latency_samples_now: window.count,
                ..LiveMetrics::default()
            };
            for w in &self.workers {
                metrics.invocations_total += w.invocations();
                metrics.transient_errors_total += w.transient_errors();
                metrics.late_ticks_total += w.late_ticks();
                if w.is_running() {
                    metrics.active_workers += 1;
                }
            }

            self.sink.progress(&ProgressUpdate {
                tick,
                elapsed: self.epoch.elapsed(),
                total_duration: self.total_duration,
                phase,
                target_rate: self.target_rate,
                workers: self.workers.len() as u64,
                metrics,
            });
        }
    }
}
