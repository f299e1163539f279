use std::sync::Arc;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::time::Duration;

use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};
use tokio::sync::Notify;
use tokio::task::{JoinError, JoinHandle};
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, warn};

use super::error::ErrorClass;
use super::scheduler::RateScheduler;
use super::task::{Task, TaskError};

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct WorkerOptions {
    /// Fail the worker once this many transient errors occur back to back.
    pub max_transient_errors: Option<u32>,
    /// Base seed for jitter; each worker mixes in its own id.
    pub seed: u64,
}

/// Live counters of one worker, readable while it runs.
#[derive(Debug, Default)]
pub struct WorkerStats {
    invocations: AtomicU64,
    transient_errors: AtomicU64,
    late_ticks: AtomicU64,
    running: AtomicBool,
}

impl WorkerStats {
    pub fn invocations(&self) -> u64 {
        self.invocations.load(Ordering::Relaxed)
    }

    pub fn transient_errors(&self) -> u64 {
        self.transient_errors.load(Ordering::Relaxed)
    }

    pub fn late_ticks(&self) -> u64 {
        self.late_ticks.load(Ordering::Relaxed)
    }

    pub fn is_running(&self) -> bool {
        self.running.load(Ordering::Acquire)
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum WorkerStatus {
    Completed,
    Failed { class: ErrorClass, reason: String },
    /// Still running when the grace period ran out; left detached.
    Abandoned,
}

impl WorkerStatus {
    pub fn is_failed(&self) -> bool {
        matches!(self, Self::Failed { .. })
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct WorkerReport {
    pub worker_id: u64,
    pub status: WorkerStatus,
    pub invocations: u64,
    pub transient_errors: u64,
    pub late_ticks: u64,
}

impl WorkerReport {
    fn from_stats(worker_id: u64, stats: &WorkerStats, status: WorkerStatus) -> Self {
        Self {
            worker_id,
            status,
            invocations: stats.invocations(),
            transient_errors: stats.transient_errors(),
            late_ticks: stats.late_ticks(),
        }
    }
}

/// Counts down as workers exit; lets the runner wait for "everyone is gone".
#[derive(Debug)]
pub(crate) struct ExitLatch {
    remaining: AtomicU64,
    notify: Notify,
}

impl ExitLatch {
    pub(crate) fn new(workers: u64) -> Self {
        Self {
            remaining: AtomicU64::new(workers),
            notify: Notify::new(),
        }
    }

    fn arrive(&self) {
        if self.remaining.fetch_sub(1, Ordering::AcqRel) == 1 {
            self.notify.notify_waiters();
        }
    }

    pub(crate) async fn wait(&self) {
        loop {
            let notified = self.notify.notified();
            if self.remaining.load(Ordering::Acquire) == 0 {
                return;
            }
            notified.await;
        }
    }
}

/// Clears the running flag and signals the latch even if the task panics.
struct ExitGuard {
    stats: Arc<WorkerStats>,
    latch: Option<Arc<ExitLatch>>,
}

impl Drop for ExitGuard {
    fn drop(&mut self) {
        self.stats.running.store(false, Ordering::Release);
        if let Some(latch) = &self.latch {
            latch.arrive();
        }
    }
}

pub struct Worker<T> {
    id: u64,
    task: T,
    scheduler: RateScheduler,
    options: WorkerOptions,
    stop: CancellationToken,
    stats: Arc<WorkerStats>,
    latch: Option<Arc<ExitLatch>>,
}

impl<T: Task> Worker<T> {
    /// `id` is 1-based; worker `id` uses scheduler slot `id - 1`.
    pub fn new(id: u64, task: T, scheduler: RateScheduler, options: WorkerOptions) -> Self {
        Self {
            id,
            task,
            scheduler,
            options,
            stop: CancellationToken::new(),
            stats: Arc::new(WorkerStats::default()),
            latch: None,
        }
    }

    /// Stops the worker when `token` is cancelled, in addition to [`WorkerHandle::stop`].
    pub fn with_stop_token(mut self, token: CancellationToken) -> Self {
        self.stop = token;
        self
    }

    pub(crate) fn with_exit_latch(mut self, latch: Arc<ExitLatch>) -> Self {
        self.latch = Some(latch);
        self
    }

    pub fn id(&self) -> u64 {
        self.id
    }

    pub fn stats(&self) -> Arc<WorkerStats> {
        self.stats.clone()
    }

    pub fn start(self) -> WorkerHandle {
        self.start_at(Instant::now())
    }

    /// Spawns the loop with ticks anchored at `epoch`, so that a group of workers
    /// share one start instant.
    pub fn start_at(self, epoch: Instant) -> WorkerHandle {
        let id = self.id;
        let stop = self.stop.clone();
        let stats = self.stats.clone();
        self.stats.running.store(true, Ordering::Release);

        let handle = tokio::spawn(self.run(epoch));
        WorkerHandle {
            id,
            stop,
            stats,
            handle,
        }
    }

    async fn run(mut self, epoch: Instant) -> WorkerReport {
        let _guard = ExitGuard {
            stats: self.stats.clone(),
            latch: self.latch.take(),
        };

        let slot = self.id.saturating_sub(1);
        let mut rng = StdRng::seed_from_u64(self.options.seed ^ self.id);
        let interval = self.scheduler.per_worker_interval();
        let mut next_at = epoch.checked_add(self.scheduler.initial_offset(slot));
        let mut consecutive_transient = 0u32;
        let mut status = WorkerStatus::Completed;

        debug!(worker_id = self.id, ?interval, "worker started");

        loop {
            let Some(at) = next_at else {
                warn!(
                    worker_id = self.id,
                    "next tick is past the clock range; idling until stopped"
                );
                self.stop.cancelled().await;
                break;
            };
            tokio::select! {
                biased;
                _ = self.stop.cancelled() => break,
                _ = tokio::time::sleep_until(at) => {}
            }

            self.stats.invocations.fetch_add(1, Ordering::Relaxed);
            match self.task.run().await {
                Ok(()) => consecutive_transient = 0,
                Err(TaskError::Transient(reason)) => {
                    self.stats.transient_errors.fetch_add(1, Ordering::Relaxed);
                    consecutive_transient = consecutive_transient.saturating_add(1);
                    warn!(worker_id = self.id, error = %reason, "transient task error");

                    if let Some(max) = self.options.max_transient_errors
                        && consecutive_transient >= max
                    {
                        error!(
                            worker_id = self.id,
                            consecutive = consecutive_transient,
                            "too many consecutive transient errors; stopping worker"
                        );
                        status = WorkerStatus::Failed {
                            class: ErrorClass::RepeatedTransient,
                            reason: format!(
                                "{consecutive_transient} consecutive transient errors, \
                                 last: {reason}"
                            ),
                        };
                        break;
                    }
                }
                Err(TaskError::Fatal(reason)) => {
                    error!(
                        worker_id = self.id,
                        error = %reason,
                        "fatal task error; stopping worker"
                    );
                    status = WorkerStatus::Failed {
                        class: ErrorClass::Fatal,
                        reason,
                    };
                    break;
                }
            }

            let now = Instant::now();
            next_at = at
                .checked_add(self.scheduler.jittered_delay(rng.random::<f64>()))
                .map(|next| {
                    if next >= now {
                        return next;
                    }
                    self.stats
                        .late_ticks
                        .fetch_add(late_ticks(now - next, interval), Ordering::Relaxed);
                    now
                });
        }

        self.task.shutdown().await;
        debug!(worker_id = self.id, ?status, "worker stopped");

        WorkerReport::from_stats(self.id, &self.stats, status)
    }
}

/// Ticks that could not fire on time when the loop is `behind` schedule: the
/// overdue one plus every whole interval skipped after it.
fn late_ticks(behind: Duration, interval: Duration) -> u64 {
    if interval.is_zero() {
        return 1;
    }
    let skipped = behind.as_nanos() / interval.as_nanos();
    u64::try_from(skipped).unwrap_or(u64::MAX).saturating_add(1)
}

/// Control side of a spawned worker.
#[derive(Debug)]
pub struct WorkerHandle {
    id: u64,
    stop: CancellationToken,
    stats: Arc<WorkerStats>,
    handle: JoinHandle<WorkerReport>,
}

impl WorkerHandle {
    pub fn id(&self) -> u64 {
        self.id
    }

    pub fn stats(&self) -> Arc<WorkerStats> {
        self.stats.clone()
    }

    /// Asks the worker to stop before its next tick. An in-flight invocation is
    /// never interrupted.
    pub fn stop(&self) {
        self.stop.cancel();
    }

    pub fn is_finished(&self) -> bool {
        self.handle.is_finished()
    }

    pub async fn join(self) -> WorkerReport {
        let res = self.handle.await;
        report_from_join(self.id, &self.stats, res)
    }

    /// Waits until `deadline` for the worker to exit. `None` means it is still running.
    pub async fn join_until(&mut self, deadline: Instant) -> Option<WorkerReport> {
        match tokio::time::timeout_at(deadline, &mut self.handle).await {
            Ok(res) => Some(report_from_join(self.id, &self.stats, res)),
            Err(_) => None,
        }
    }

    /// Detaches the worker. It keeps running until its current invocation returns
    /// and it observes the stop signal.
    pub fn abandon(self) -> WorkerReport {
        self.stop.cancel();
        WorkerReport::from_stats(self.id, &self.stats, WorkerStatus::Abandoned)
    }
}

fn report_from_join(
    worker_id: u64,
    stats: &WorkerStats,
    res: Result<WorkerReport, JoinError>,
) -> WorkerReport {
    match res {
        Ok(report) => report,
        Err(err) => {
            let reason = if err.is_panic() {
                "task panicked".to_string()
            } else {
                err.to_string()
            };
            error!(worker_id, %reason, "worker did not exit cleanly");
            WorkerReport::from_stats(
                worker_id,
                stats,
                WorkerStatus::Failed {
                    class: ErrorClass::Panicked,
                    reason,
                },
            )
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::AtomicU32;

    struct Scripted {
        calls: Arc<AtomicU32>,
        shutdowns: Arc<AtomicU32>,
        script: fn(u32) -> Result<(), TaskError>,
    }

    impl Task for Scripted {
        async fn run(&mut self) -> Result<(), TaskError> {
            let n = self.calls.fetch_add(1, Ordering::Relaxed) + 1;
            (self.script)(n)
        }

        async fn shutdown(&mut self) {
            self.shutdowns.fetch_add(1, Ordering::Relaxed);
        }
    }

    fn scripted(
        script: fn(u32) -> Result<(), TaskError>,
    ) -> (Scripted, Arc<AtomicU32>, Arc<AtomicU32>) {
        let calls = Arc::new(AtomicU32::new(0));
        let shutdowns = Arc::new(AtomicU32::new(0));
        (
            Scripted {
                calls: calls.clone(),
                shutdowns: shutdowns.clone(),
                script,
            },
            calls,
            shutdowns,
        )
    }

    fn scheduler(rate: f64) -> RateScheduler {
        RateScheduler::new(rate, 1, 0.0).unwrap_or_else(|e| panic!("scheduler: {e}"))
    }

    #[test]
    fn late_tick_counting() {
        let i = Duration::from_millis(10);
        assert_eq!(late_ticks(Duration::from_millis(1), i), 1);
        assert_eq!(late_ticks(Duration::from_millis(25), i), 3);
        assert_eq!(late_ticks(Duration::from_millis(25), Duration::ZERO), 1);
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn fatal_error_stops_worker_and_runs_shutdown() {
        let (task, calls, shutdowns) = scripted(|n| {
            if n == 3 {
                Err(TaskError::fatal("broker gone"))
            } else {
                Ok(())
            }
        });

        let handle = Worker::new(1, task, scheduler(1000.0), WorkerOptions::default()).start();
        let report = handle.join().await;

        assert_eq!(
            report.status,
            WorkerStatus::Failed {
                class: ErrorClass::Fatal,
                reason: "broker gone".to_string()
            }
        );
        assert_eq!(report.invocations, 3);
        assert_eq!(calls.load(Ordering::Relaxed), 3);
        assert_eq!(shutdowns.load(Ordering::Relaxed), 1);
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn transient_errors_continue_until_the_limit() {
        let (task, _, shutdowns) = scripted(|n| {
            if n == 1 || n >= 3 {
                Err(TaskError::transient("busy"))
            } else {
                Ok(())
            }
        });

        let options = WorkerOptions {
            max_transient_errors: Some(3),
            seed: 0,
        };
        let report = Worker::new(1, task, scheduler(1000.0), options)
            .start()
            .join()
            .await;

        // 1 error, 1 success (resets), then 3 in a row.
        assert_eq!(report.invocations, 5);
        assert_eq!(report.transient_errors, 4);
        assert!(matches!(
            report.status,
            WorkerStatus::Failed {
                class: ErrorClass::RepeatedTransient,
                ..
            }
        ));
        assert_eq!(shutdowns.load(Ordering::Relaxed), 1);
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn stop_is_observed_before_the_next_tick() {
        let (task, calls, shutdowns) = scripted(|_| Ok(()));
        // One tick every 10s: the first fires immediately, the second never comes.
        let handle = Worker::new(1, task, scheduler(0.1), WorkerOptions::default()).start();
        let stats = handle.stats();

        tokio::time::sleep(Duration::from_millis(50)).await;
        assert!(stats.is_running());
        handle.stop();

        let report = tokio::time::timeout(Duration::from_secs(1), handle.join())
            .await
            .unwrap_or_else(|_| panic!("worker did not stop"));
        assert_eq!(report.status, WorkerStatus::Completed);
        assert_eq!(calls.load(Ordering::Relaxed), 1);
        assert_eq!(shutdowns.load(Ordering::Relaxed), 1);
        assert!(!stats.is_running());
    }

    /// Latest instant the clock can represent; one more nanosecond overflows.
    fn last_instant() -> Instant {
        let mut edge = Instant::now();
        let mut step = Duration::from_secs(u64::MAX);
        while !step.is_zero() {
            match edge.checked_add(step) {
                Some(next) => edge = next,
                None => step /= 2,
            }
        }
        edge
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn unrepresentable_tick_idles_until_stopped() {
        let (task, calls, shutdowns) = scripted(|_| Ok(()));
        // Worker 2 of 2 at 2/s starts half a second after the epoch.
        let scheduler =
            RateScheduler::new(2.0, 2, 0.0).unwrap_or_else(|e| panic!("scheduler: {e}"));
        let handle = Worker::new(2, task, scheduler, WorkerOptions::default())
            .start_at(last_instant());
        let stats = handle.stats();

        tokio::time::sleep(Duration::from_millis(20)).await;
        assert!(stats.is_running());
        handle.stop();

        let report = tokio::time::timeout(Duration::from_secs(1), handle.join())
            .await
            .unwrap_or_else(|_| panic!("worker did not stop"));
        assert_eq!(report.status, WorkerStatus::Completed);
        assert_eq!(calls.load(Ordering::Relaxed), 0);
        assert_eq!(shutdowns.load(Ordering::Relaxed), 1);
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn panicking_task_is_reported_as_panicked() {
        let (task, _, _) = scripted(|_| panic!("boom"));
        let latch = Arc::new(ExitLatch::new(1));
        let report = Worker::new(1, task, scheduler(10.0), WorkerOptions::default())
            .with_exit_latch(latch.clone())
            .start()
            .join()
            .await;

        assert!(matches!(
            report.status,
            WorkerStatus::Failed {
                class: ErrorClass::Panicked,
                ..
            }
        ));
        tokio::time::timeout(Duration::from_secs(1), latch.wait())
            .await
            .unwrap_or_else(|_| panic!("latch not released"));
    }

    struct Slow;

    impl Task for Slow {
        async fn run(&mut self) -> Result<(), TaskError> {
            tokio::time::sleep(Duration::from_millis(30)).await;
            Ok(())
        }
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn overrunning_task_counts_late_ticks() {
        // 100/s wants a tick every 10ms; each run takes 30ms.
        let handle = Worker::new(1, Slow, scheduler(100.0), WorkerOptions::default()).start();
        tokio::time::sleep(Duration::from_millis(200)).await;
        handle.stop();
        let report = handle.join().await;

        assert!(report.invocations >= 3, "{report:?}");
        assert!(report.late_ticks >= report.invocations - 1, "{report:?}");
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn join_until_times_out_on_a_stuck_worker() {
        struct Stuck;
        impl Task for Stuck {
            async fn run(&mut self) -> Result<(), TaskError> {
                tokio::time::sleep(Duration::from_secs(30)).await;
                Ok(())
            }
        }

        let mut handle = Worker::new(1, Stuck, scheduler(10.0), WorkerOptions::default()).start();
        tokio::time::sleep(Duration::from_millis(20)).await;
        handle.stop();

        let joined = handle
            .join_until(Instant::now() + Duration::from_millis(50))
            .await;
        assert!(joined.is_none());

        let report = handle.abandon();
        assert_eq!(report.status, WorkerStatus::Abandoned);
        assert_eq!(report.invocations, 1);
    }
}
