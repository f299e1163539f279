pub mod aggregator;
pub mod histogram;
pub mod stats;

pub use aggregator::{
    LatencyWindow, MetricsAggregator, MetricsRecorder, MetricsSnapshot, WorkerMetrics,
};
pub use histogram::{HistogramSummary, LatencyMetric, MAX_LATENCY_US};
pub use stats::{RateSeries, per_sec};
