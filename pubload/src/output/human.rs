use pubload_core::{ProgressUpdate, ReportSink, RunReport, SinkError};
use std::sync::Arc;

mod format;
mod progress;
mod summary;

use format::{format_bytes, format_duration_single, format_ms_opt, format_rate};
use progress::HumanProgress;
use summary::render;

use super::{OutputFormatter, RunHeader};

pub(crate) struct HumanReadableOutput {
    progress: HumanProgress,
}

impl HumanReadableOutput {
    pub(crate) fn new() -> Self {
        Self {
            progress: HumanProgress::new(),
        }
    }
}

impl OutputFormatter for HumanReadableOutput {
    fn print_header(&self, h: &RunHeader) {
        println!("{}", header_text(h));
    }

    fn abort(&self) {
        self.progress.finish();
    }

    fn into_sink(self: Arc<Self>) -> Arc<dyn ReportSink> {
        self
    }
}

impl ReportSink for HumanReadableOutput {
    fn progress(&self, u: &ProgressUpdate) {
        self.progress
            .update(u.total_duration, u.elapsed, progress_message(u));
    }

    fn report(&self, report: &RunReport) -> Result<(), SinkError> {
        self.progress.finish();
        print!("{}", render(report));
        for w in &report.warnings {
            eprintln!("warning: {w}");
        }
        Ok(())
    }
}

fn header_text(h: &RunHeader) -> String {
    let rate = h.rate.map_or_else(|| "?".to_string(), format_rate);
    let feed = h
        .feed_rate
        .map(|r| format!(" feed={}/s", format_rate(r)))
        .unwrap_or_default();
    format!(
        "topic: {}/{}{feed}\nbackend: {} rate={rate}/s workers={} duration={} burn_in={} \
         message_size={}\n",
        h.project,
        h.topic,
        h.backend,
        h.workers,
        format_duration_single(h.duration),
        format_duration_single(h.burn_in),
        format_bytes(h.message_size as u64),
    )
}

fn progress_message(u: &ProgressUpdate) -> String {
    let m = &u.metrics;
    format!(
        "{} elapsed={} msgs/s={} total={} p50={} p99={} errors={} late={} workers={}/{}",
        u.phase,
        format_duration_single(u.elapsed),
        format_rate(m.messages_per_sec_now),
        m.messages_total,
        format_ms_opt(m.latency_p50_ms_now),
        format_ms_opt(m.latency_p99_ms_now),
        m.transient_errors_total,
        m.late_ticks_total,
        m.active_workers,
        u.workers,
    )
}

#[cfg(test)]
mod tests {
    use super::*;
    use pubload_broker::BackendMode;
    use pubload_core::{LiveMetrics, RunPhase};
    use std::time::Duration;

    #[test]
    fn header_names_topic_and_feed() {
        let mut h = RunHeader {
            backend: BackendMode::Subscribe,
            project: "bench".to_string(),
            topic: "orders".to_string(),
            feed_rate: Some(5000.0),
            rate: Some(50.0),
            workers: 2,
            duration: Duration::from_secs(30),
            burn_in: Duration::ZERO,
            message_size: 1000,
        };

        let text = header_text(&h);
        assert!(text.starts_with("topic: bench/orders feed=5000/s\n"), "{text}");
        assert!(text.contains("backend: subscribe rate=50/s workers=2"), "{text}");

        h.feed_rate = None;
        h.rate = None;
        let text = header_text(&h);
        assert!(text.starts_with("topic: bench/orders\n"), "{text}");
        assert!(text.contains("rate=?/s"), "{text}");
    }

    #[test]
    fn progress_message_shows_phase_and_rates() {
        let u = ProgressUpdate {
            tick: 3,
            elapsed: Duration::from_secs(3),
            total_duration: Duration::from_secs(10),
            phase: RunPhase::Measuring,
            target_rate: 100.0,
            workers: 4,
            metrics: LiveMetrics {
                messages_per_sec_now: 99.6,
                messages_total: 250,
                latency_p50_ms_now: Some(1.5),
                latency_p99_ms_now: None,
                transient_errors_total: 2,
                active_workers: 3,
                ..LiveMetrics::default()
            },
        };

        let msg = progress_message(&u);
        assert!(msg.starts_with("measuring elapsed=3s"), "{msg}");
        assert!(msg.contains("msgs/s=100"), "{msg}");
        assert!(msg.contains("total=250"), "{msg}");
        assert!(msg.contains("p50=1.50ms p99=-"), "{msg}");
        assert!(msg.contains("errors=2"), "{msg}");
        assert!(msg.contains("workers=3/4"), "{msg}");
    }
}
