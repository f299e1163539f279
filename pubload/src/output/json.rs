use pubload_core::{ProgressUpdate, ReportSink, RunReport, SinkError, WorkerStatus};
use serde::Serialize;
use std::collections::BTreeMap;
use std::io::Write as _;
use std::sync::Arc;

use super::{OutputFormatter, RunHeader};

pub(crate) struct JsonOutput;

impl OutputFormatter for JsonOutput {
    fn print_header(&self, _header: &RunHeader) {}

    fn into_sink(self: Arc<Self>) -> Arc<dyn ReportSink> {
        self
    }
}

impl ReportSink for JsonOutput {
    fn progress(&self, u: &ProgressUpdate) {
        // Progress lines are best-effort; a closed stdout surfaces with the summary.
        let _ = emit_json_line(&build_progress_line(u));
    }

    fn report(&self, report: &RunReport) -> Result<(), SinkError> {
        emit_json_line(&build_summary_line(report))
    }
}

#[derive(Debug, Serialize)]
pub(crate) struct JsonProgressLine {
    pub kind: &'static str,
    pub tick: u64,
    pub elapsed_secs: f64,
    pub phase: String,
    pub target_rate: f64,
    pub workers: u64,
    pub active_workers: u64,

    pub messages_per_sec: f64,
    pub messages_total: u64,
    pub messages_per_sec_avg: f64,
    pub messages_per_sec_stdev: f64,
    pub messages_per_sec_max: f64,

    pub latency_p50_ms: Option<f64>,
    pub latency_p95_ms: Option<f64>,
    pub latency_p99_ms: Option<f64>,
    pub latency_samples: u64,

    pub invocations_total: u64,
    pub transient_errors_total: u64,
    pub late_ticks_total: u64,
}

fn build_progress_line(u: &ProgressUpdate) -> JsonProgressLine {
    let m = &u.metrics;
    JsonProgressLine {
        kind: "progress",
        tick: u.tick,
        elapsed_secs: u.elapsed.as_secs_f64(),
        phase: u.phase.to_string(),
        target_rate: u.target_rate,
        workers: u.workers,
        active_workers: m.active_workers,

        messages_per_sec: m.messages_per_sec_now,
        messages_total: m.messages_total,
        messages_per_sec_avg: m.messages_per_sec_avg,
        messages_per_sec_stdev: m.messages_per_sec_stdev,
        messages_per_sec_max: m.messages_per_sec_max,

        latency_p50_ms: m.latency_p50_ms_now,
        latency_p95_ms: m.latency_p95_ms_now,
        latency_p99_ms: m.latency_p99_ms_now,
        latency_samples: m.latency_samples_now,

        invocations_total: m.invocations_total,
        transient_errors_total: m.transient_errors_total,
        late_ticks_total: m.late_ticks_total,
    }
}

#[derive(Debug, Serialize)]
pub(crate) struct JsonSummaryLine {
    pub kind: &'static str,
    pub outcome: String,
    pub stop_reason: String,
    pub target_rate: f64,
    pub metric: String,
    pub elapsed_secs: f64,
    pub messages_total: u64,
    pub burn_in_messages: u64,
    pub throughput_per_sec: f64,
    pub clamped_samples: u64,
    pub latency: Option<JsonLatencySummary>,
    pub totals: JsonTotals,
    pub failures_by_class: BTreeMap<String, u64>,
    pub workers: Vec<JsonWorker>,
    pub warnings: Vec<String>,
}

#[derive(Debug, Serialize)]
pub(crate) struct JsonLatencySummary {
    pub p50: Option<f64>,
    pub p75: Option<f64>,
    pub p90: Option<f64>,
    pub p95: Option<f64>,
    pub p99: Option<f64>,
    pub min: Option<f64>,
    pub max: Option<f64>,
    pub mean: Option<f64>,
    pub stdev: Option<f64>,
    pub count: u64,
}

#[derive(Debug, Serialize)]
pub(crate) struct JsonTotals {
    pub invocations_total: u64,
    pub transient_errors_total: u64,
    pub late_ticks_total: u64,
    pub failed_workers: u64,
    pub abandoned_workers: u64,
}

#[derive(Debug, Serialize)]
pub(crate) struct JsonWorker {
    pub worker_id: u64,
    pub status: &'static str,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error_class: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub reason: Option<String>,
    pub messages: u64,
    pub invocations: u64,
    pub transient_errors: u64,
    pub late_ticks: u64,
}

fn build_summary_line(report: &RunReport) -> JsonSummaryLine {
    let s = &report.snapshot;

    let latency = s.latency.as_ref().map(|l| JsonLatencySummary {
        p50: l.p50,
        p75: l.p75,
        p90: l.p90,
        p95: l.p95,
        p99: l.p99,
        min: l.min,
        max: l.max,
        mean: l.mean,
        stdev: l.stdev,
        count: l.count,
    });

    let workers = report
        .workers
        .iter()
        .map(|w| {
            let messages = s
                .workers
                .iter()
                .find(|m| m.worker_id == w.worker_id)
                .map_or(0, |m| m.messages);
            let (status, error_class, reason) = match &w.status {
                WorkerStatus::Completed => ("completed", None, None),
                WorkerStatus::Abandoned => ("abandoned", None, None),
                WorkerStatus::Failed { class, reason } => {
                    ("failed", Some(class.to_string()), Some(reason.clone()))
                }
            };
            JsonWorker {
                worker_id: w.worker_id,
                status,
                error_class,
                reason,
                messages,
                invocations: w.invocations,
                transient_errors: w.transient_errors,
                late_ticks: w.late_ticks,
            }
        })
        .collect();

    JsonSummaryLine {
        kind: "summary",
        outcome: report.outcome.to_string(),
        stop_reason: report.stop_reason.to_string(),
        target_rate: report.target_rate,
        metric: s.metric.to_string(),
        elapsed_secs: s.elapsed.as_secs_f64(),
        messages_total: s.messages_total,
        burn_in_messages: s.burn_in_messages,
        throughput_per_sec: s.throughput_per_sec,
        clamped_samples: s.clamped_samples,
        latency,
        totals: JsonTotals {
            invocations_total: report.invocations_total,
            transient_errors_total: report.transient_errors_total,
            late_ticks_total: report.late_ticks_total,
            failed_workers: report.failed_workers,
            abandoned_workers: report.abandoned_workers,
        },
        failures_by_class: report
            .failures_by_class
            .iter()
            .map(|(class, count)| (class.to_string(), *count))
            .collect(),
        workers,
        warnings: report.warnings.clone(),
    }
}

fn emit_json_line<T: Serialize>(line: &T) -> Result<(), SinkError> {
    let mut out = std::io::stdout().lock();
    serde_json::to_writer(&mut out, line)?;
    writeln!(out)?;
    out.flush()?;
    Ok(())
}
