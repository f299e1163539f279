use hdrhistogram::Histogram;

/// Upper bound of a latency histogram: 1 hour in microseconds.
pub const MAX_LATENCY_US: u64 = 3_600_000_000;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, strum::Display, strum::EnumString)]
#[strum(serialize_all = "snake_case")]
pub enum LatencyMetric {
    /// Time between a message being published and a subscriber observing it.
    EndToEndLatency,
    /// Time between a publish call and the broker acknowledging it.
    PublishAckLatency,
}

/// Latency summary in milliseconds.
#[derive(Debug, Clone, PartialEq)]
pub struct HistogramSummary {
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

pub(crate) fn new_default_histogram() -> Histogram<u64> {
    match Histogram::<u64>::new_with_bounds(1, MAX_LATENCY_US, 3) {
        Ok(h) => h,
        Err(err) => panic!("failed to create histogram: {err}"),
    }
}

/// Records `us` with weight `count`, clamping to the histogram range.
///
/// Returns `true` when the value had to be clamped.
pub(crate) fn record_clamped(h: &mut Histogram<u64>, us: u64, count: u64) -> bool {
    let clamped = us > MAX_LATENCY_US;
    h.saturating_record_n(us.min(MAX_LATENCY_US), count);
    clamped
}

pub(crate) fn summarize_histogram(h: &Histogram<u64>) -> HistogramSummary {
    let count = h.len();
    let ms = |v: u64| v as f64 / 1000.0;

    HistogramSummary {
        p50: (count > 0).then(|| ms(h.value_at_quantile(0.50))),
        p75: (count > 0).then(|| ms(h.value_at_quantile(0.75))),
        p90: (count > 0).then(|| ms(h.value_at_quantile(0.90))),
        p95: (count > 0).then(|| ms(h.value_at_quantile(0.95))),
        p99: (count > 0).then(|| ms(h.value_at_quantile(0.99))),
        min: (count > 0).then(|| ms(h.min())),
        max: (count > 0).then(|| ms(h.max())),
        mean: (count > 0).then(|| h.mean() / 1000.0),
        stdev: (count > 0).then(|| h.stdev() / 1000.0),
        count,
    }
}
