pub mod runner;

pub use pubload_metrics::{
    HistogramSummary, LatencyMetric, MetricsAggregator, MetricsRecorder, MetricsSnapshot,
    WorkerMetrics,
};
pub use runner::*;
