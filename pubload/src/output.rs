use crate::cli::OutputFormat;
use pubload_broker::BackendMode;
use pubload_core::ReportSink;
use std::sync::Arc;
use std::time::Duration;

mod human;
mod json;

/// What is about to run, printed before the workers start.
#[derive(Debug, Clone)]
pub(crate) struct RunHeader {
    pub backend: BackendMode,
    pub project: String,
    pub topic: String,
    /// Background publish rate of a subscribe-only run.
    pub feed_rate: Option<f64>,
    pub rate: Option<f64>,
    pub workers: u64,
    pub duration: Duration,
    pub burn_in: Duration,
    pub message_size: usize,
}

pub(crate) trait OutputFormatter: ReportSink {
    fn print_header(&self, header: &RunHeader);

    /// Clears live output when the run ends without a report.
    fn abort(&self) {}

    fn into_sink(self: Arc<Self>) -> Arc<dyn ReportSink>;
}

pub(crate) fn formatter(format: OutputFormat) -> Arc<dyn OutputFormatter> {
    match format {
        OutputFormat::HumanReadable => Arc::new(human::HumanReadableOutput::new()),
        OutputFormat::Json => Arc::new(json::JsonOutput),
    }
}
