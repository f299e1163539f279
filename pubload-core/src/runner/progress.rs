use std::time::Duration;

#[derive(Debug, Clone, Copy, PartialEq, Eq, strum::Display)]
#[strum(serialize_all = "snake_case")]
pub enum RunPhase {
    BurnIn,
    Measuring,
}

#[derive(Debug, Clone, Default, PartialEq)]
pub struct LiveMetrics {
    /// Messages observed during the last progress interval, per second.
    pub messages_per_sec_now: f64,

    /// Messages counted inside the measurement window so far.
    pub messages_total: u64,

    /// Aggregate messages/sec statistics across progress intervals.
    pub messages_per_sec_avg: f64,
    pub messages_per_sec_stdev: f64,
    pub messages_per_sec_max: f64,

    /// Latency percentiles (milliseconds) over the last progress interval.
    pub latency_p50_ms_now: Option<f64>,
    pub latency_p95_ms_now: Option<f64>,
    pub latency_p99_ms_now: Option<f64>,
    pub latency_samples_now: u64,

    pub invocations_total: u64,
    pub transient_errors_total: u64,
    pub late_ticks_total: u64,
    pub active_workers: u64,
}

#[derive(Debug, Clone, PartialEq)]
pub struct ProgressUpdate {
    /// Monotonic tick counter (1-based) for progress emissions.
    pub tick: u64,
    /// Time since the workers were started, burn-in included.
    pub elapsed: Duration,
    /// Burn-in plus measurement window.
    pub total_duration: Duration,
    pub phase: RunPhase,
    pub target_rate: f64,
    pub workers: u64,
    pub metrics: LiveMetrics,
}
