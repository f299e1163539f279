use std::fmt::Write as _;

use pubload_core::{RunReport, WorkerStatus};

use super::format::*;

pub(crate) fn render(report: &RunReport) -> String {
    let mut out = String::new();
    let s = &report.snapshot;

    out.push_str("summary\n");
    writeln!(
        out,
        "  outcome: {} ({})",
        report.outcome, report.stop_reason
    )
    .ok();
    writeln!(
        out,
        "  elapsed: {} (measured)",
        format_duration_single(s.elapsed)
    )
    .ok();
    writeln!(
        out,
        "  messages: {} (burn-in {})",
        s.messages_total, s.burn_in_messages
    )
    .ok();
    writeln!(
        out,
        "  throughput: {} msg/s (target rate {}/s)",
        format_rate(s.throughput_per_sec),
        format_rate(report.target_rate)
    )
    .ok();

    match &s.latency {
        Some(h) => {
            writeln!(
                out,
                "  {} = p50={} p90={} p95={} p99={} mean={} max={} (n={})",
                s.metric,
                format_ms_opt(h.p50),
                format_ms_opt(h.p90),
                format_ms_opt(h.p95),
                format_ms_opt(h.p99),
                format_ms_opt(h.mean),
                format_ms_opt(h.max),
                h.count
            )
            .ok();
        }
        None => {
            writeln!(out, "  {}: n/a", s.metric).ok();
        }
    }

    out.push_str("workers\n");
    writeln!(
        out,
        "  completed: {} failed: {} abandoned: {}",
        report.completed_workers(),
        report.failed_workers,
        report.abandoned_workers
    )
    .ok();
    writeln!(
        out,
        "  invocations: {} transient_errors: {} late_ticks: {}",
        report.invocations_total, report.transient_errors_total, report.late_ticks_total
    )
    .ok();

    for (class, count) in &report.failures_by_class {
        writeln!(out, "  {class}: {count}").ok();
    }
    for w in &report.workers {
        if let WorkerStatus::Failed { class, reason } = &w.status {
            writeln!(out, "    worker {} {class}: {reason}", w.worker_id).ok();
        }
    }

    out
}
