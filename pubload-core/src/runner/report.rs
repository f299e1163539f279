use std::collections::BTreeMap;

use pubload_metrics::MetricsSnapshot;

use super::error::ErrorClass;
use super::progress::ProgressUpdate;
use super::worker::{WorkerReport, WorkerStatus};

#[derive(Debug, Clone, Copy, PartialEq, Eq, strum::Display)]
#[strum(serialize_all = "snake_case")]
pub enum RunOutcome {
    Completed,
    /// Some workers had to be abandoned after the grace period.
    CompletedWithWarnings,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, strum::Display)]
#[strum(serialize_all = "snake_case")]
pub enum StopReason {
    DurationElapsed,
    Cancelled,
    AllWorkersExited,
}

#[derive(Debug, Clone, PartialEq)]
pub struct RunReport {
    pub outcome: RunOutcome,
    pub stop_reason: StopReason,
    pub target_rate: f64,
    pub snapshot: MetricsSnapshot,
    pub workers: Vec<WorkerReport>,
    pub failed_workers: u64,
    pub abandoned_workers: u64,
    pub failures_by_class: BTreeMap<ErrorClass, u64>,
    pub invocations_total: u64,
    pub transient_errors_total: u64,
    pub late_ticks_total: u64,
    pub warnings: Vec<String>,
}

impl RunReport {
    pub(crate) fn new(
        stop_reason: StopReason,
        target_rate: f64,
        snapshot: MetricsSnapshot,
        mut workers: Vec<WorkerReport>,
    ) -> Self {
        workers.sort_by_key(|w| w.worker_id);

        let mut failed_workers = 0u64;
        let mut abandoned_workers = 0u64;
        let mut failures_by_class = BTreeMap::new();
        let mut invocations_total = 0u64;
        let mut transient_errors_total = 0u64;
        let mut late_ticks_total = 0u64;

        for w in &workers {
            invocations_total = invocations_total.saturating_add(w.invocations);
            transient_errors_total = transient_errors_total.saturating_add(w.transient_errors);
            late_ticks_total = late_ticks_total.saturating_add(w.late_ticks);

            match &w.status {
                WorkerStatus::Completed => {}
                WorkerStatus::Failed { class, .. } => {
                    failed_workers += 1;
                    *failures_by_class.entry(*class).or_insert(0) += 1;
                }
                WorkerStatus::Abandoned => abandoned_workers += 1,
            }
        }

        let mut warnings = Vec::new();
        if abandoned_workers > 0 {
            warnings.push(format!(
                "{abandoned_workers} worker(s) did not stop within the grace period \
                 and were abandoned"
            ));
        }
        if snapshot.clamped_samples > 0 {
            warnings.push(format!(
                "{} latency sample(s) exceeded the histogram range and were clamped",
                snapshot.clamped_samples
            ));
        }

        let outcome = if abandoned_workers > 0 {
            RunOutcome::CompletedWithWarnings
        } else {
            RunOutcome::Completed
        };

        Self {
            outcome,
            stop_reason,
            target_rate,
            snapshot,
            workers,
            failed_workers,
            abandoned_workers,
            failures_by_class,
            invocations_total,
            transient_errors_total,
            late_ticks_total,
            warnings,
        }
    }

    /// True when any worker failed or had to be abandoned.
    pub fn is_degraded(&self) -> bool {
        self.failed_workers > 0 || self.abandoned_workers > 0
    }

    pub fn completed_workers(&self) -> u64 {
        self.workers
            .iter()
            .filter(|w| w.status == WorkerStatus::Completed)
            .count() as u64
    }
}

pub type SinkError = Box<dyn std::error::Error + Send + Sync + 'static>;

/// Destination for live progress and the final report.
pub trait ReportSink: Send + Sync {
    fn progress(&self, _update: &ProgressUpdate) {}

    fn report(&self, report: &RunReport) -> Result<(), SinkError>;
}
