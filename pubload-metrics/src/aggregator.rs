use std::collections::BTreeMap;
use std::sync::Arc;
use std::sync::atomic::{AtomicU8, AtomicU64, Ordering};
use std::time::{Duration, Instant};

use hdrhistogram::Histogram;
use parking_lot::{Mutex, RwLock};

use crate::histogram::{
    HistogramSummary, LatencyMetric, new_default_histogram, record_clamped, summarize_histogram,
};
use crate::stats::per_sec;

const PHASE_BURN_IN: u8 = 0;
const PHASE_MEASURING: u8 = 1;

/// Point-in-time view of everything recorded so far.
#[derive(Debug, Clone, PartialEq)]
pub struct MetricsSnapshot {
    pub metric: LatencyMetric,
    /// Messages observed inside the measurement window. Always equals the sum of
    /// `workers[*].messages`.
    pub messages_total: u64,
    /// Messages observed during burn-in; excluded from every other figure.
    pub burn_in_messages: u64,
    pub latency: Option<HistogramSummary>,
    /// Latency samples above the histogram range, recorded at the upper bound.
    pub clamped_samples: u64,
    pub elapsed: Duration,
    pub throughput_per_sec: f64,
    pub workers: Vec<WorkerMetrics>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct WorkerMetrics {
    pub worker_id: u64,
    pub messages: u64,
    pub latency_samples: u64,
}

/// Interval percentiles (milliseconds) since the previous [`MetricsAggregator::take_window`].
#[derive(Debug, Clone, Copy, Default, PartialEq)]
pub struct LatencyWindow {
    pub count: u64,
    pub p50: Option<f64>,
    pub p95: Option<f64>,
    pub p99: Option<f64>,
}

#[derive(Debug)]
struct WorkerSeries {
    messages: AtomicU64,
    burn_in_messages: AtomicU64,
    clamped: AtomicU64,
    latency: Mutex<Histogram<u64>>,
    latency_window: Mutex<Histogram<u64>>,
}

impl WorkerSeries {
    fn new() -> Self {
        Self {
            messages: AtomicU64::new(0),
            burn_in_messages: AtomicU64::new(0),
            clamped: AtomicU64::new(0),
            latency: Mutex::new(new_default_histogram()),
            latency_window: Mutex::new(new_default_histogram()),
        }
    }
}

#[derive(Debug, Default, Clone, Copy)]
struct MeasurementWindow {
    started: Option<Instant>,
    stopped: Option<Instant>,
}

impl MeasurementWindow {
    fn elapsed(&self) -> Duration {
        match (self.started, self.stopped) {
            (Some(start), Some(stop)) => stop.saturating_duration_since(start),
            (Some(start), None) => start.elapsed(),
            (None, _) => Duration::ZERO,
        }
    }
}

#[derive(Debug)]
struct Inner {
    metric: LatencyMetric,
    phase: AtomicU8,
    workers: RwLock<BTreeMap<u64, Arc<WorkerSeries>>>,
    window: Mutex<MeasurementWindow>,
}

impl Inner {
    fn is_measuring(&self) -> bool {
        self.phase.load(Ordering::Acquire) == PHASE_MEASURING
    }
}

/// Run-wide metrics sink shared by every worker.
///
/// Writers go through a [`MetricsRecorder`] bound to one worker; each worker owns its
/// counters and histograms, so writers only contend with snapshot readers. Aggregate
/// figures are computed by summing/merging the per-worker series at snapshot time.
#[derive(Debug, Clone)]
pub struct MetricsAggregator {
    inner: Arc<Inner>,
}

impl Default for MetricsAggregator {
    fn default() -> Self {
        Self::new(LatencyMetric::EndToEndLatency)
    }
}

impl MetricsAggregator {
    pub fn new(metric: LatencyMetric) -> Self {
        Self {
            inner: Arc::new(Inner {
                metric,
                phase: AtomicU8::new(PHASE_MEASURING),
                workers: RwLock::new(BTreeMap::new()),
                window: Mutex::new(MeasurementWindow::default()),
            }),
        }
    }

    pub fn metric(&self) -> LatencyMetric {
        self.inner.metric
    }

    /// Returns the recorder for `worker_id`, registering the worker on first use.
    pub fn recorder(&self, worker_id: u64) -> MetricsRecorder {
        let existing = self.inner.workers.read().get(&worker_id).cloned();
        let series = match existing {
            Some(series) => series,
            None => self
                .inner
                .workers
                .write()
                .entry(worker_id)
                .or_insert_with(|| Arc::new(WorkerSeries::new()))
                .clone(),
        };

        MetricsRecorder {
            inner: self.inner.clone(),
            series,
            worker_id,
        }
    }

    /// Routes subsequent records to the burn-in counters until [`Self::start_measuring`].
    pub fn begin_burn_in(&self) {
        self.inner.phase.store(PHASE_BURN_IN, Ordering::Release);
    }

    /// Opens the measurement window. Calling it again has no effect on the start time.
    pub fn start_measuring(&self) {
        {
            let mut window = self.inner.window.lock();
            if window.started.is_none() {
                window.started = Some(Instant::now());
            }
        }
        self.inner.phase.store(PHASE_MEASURING, Ordering::Release);
    }

    /// Freezes the elapsed time reported by snapshots.
    pub fn stop_measuring(&self) {
        let mut window = self.inner.window.lock();
        if window.started.is_some() && window.stopped.is_none() {
            window.stopped = Some(Instant::now());
        }
    }

    pub fn is_measuring(&self) -> bool {
        self.inner.is_measuring()
    }

    pub fn elapsed(&self) -> Duration {
        self.inner.window.lock().elapsed()
    }

    /// Cheap running total (no histogram work).
    pub fn messages_total(&self) -> u64 {
        self.inner
            .workers
            .read()
            .values()
            .map(|s| s.messages.load(Ordering::Relaxed))
            .fold(0u64, u64::saturating_add)
    }

    /// Measured plus burn-in messages; used for live rates that span both phases.
    pub fn messages_observed(&self) -> u64 {
        self.inner
            .workers
            .read()
            .values()
            .map(|s| {
                s.messages
                    .load(Ordering::Relaxed)
                    .saturating_add(s.burn_in_messages.load(Ordering::Relaxed))
            })
            .fold(0u64, u64::saturating_add)
    }

    pub fn snapshot(&self) -> MetricsSnapshot {
        let elapsed = self.elapsed();

        let mut merged = new_default_histogram();
        let mut workers = Vec::new();
        let mut messages_total = 0u64;
        let mut burn_in_messages = 0u64;
        let mut clamped_samples = 0u64;

        {
            let series = self.inner.workers.read();
            workers.reserve(series.len());

            for (worker_id, s) in series.iter() {
                let messages = s.messages.load(Ordering::Relaxed);
                let latency_samples = {
                    let h = s.latency.lock();
                    let _ = merged.add(&*h);
                    h.len()
                };

                messages_total = messages_total.saturating_add(messages);
                burn_in_messages =
                    burn_in_messages.saturating_add(s.burn_in_messages.load(Ordering::Relaxed));
                clamped_samples = clamped_samples.saturating_add(s.clamped.load(Ordering::Relaxed));

                workers.push(WorkerMetrics {
                    worker_id: *worker_id,
                    messages,
                    latency_samples,
                });
            }
        }

        let latency = (!merged.is_empty()).then(|| summarize_histogram(&merged));
        let throughput_per_sec = per_sec(messages_total, elapsed);

        MetricsSnapshot {
            metric: self.inner.metric,
            messages_total,
            burn_in_messages,
            latency,
            clamped_samples,
            elapsed,
            throughput_per_sec,
            workers,
        }
    }

    /// Merges and resets the interval histograms.
    pub fn take_window(&self) -> LatencyWindow {
        let mut merged = new_default_histogram();
        {
            let series = self.inner.workers.read();
            for s in series.values() {
                let mut h = s.latency_window.lock();
                let _ = merged.add(&*h);
                h.reset();
            }
        }

        if merged.is_empty() {
            return LatencyWindow::default();
        }

        let ms = |q: f64| merged.value_at_quantile(q) as f64 / 1000.0;
        LatencyWindow {
            count: merged.len(),
            p50: Some(ms(0.50)),
            p95: Some(ms(0.95)),
            p99: Some(ms(0.99)),
        }
    }
}

/// Write handle for one worker. Cloning shares the same series.
#[derive(Debug, Clone)]
pub struct MetricsRecorder {
    inner: Arc<Inner>,
    series: Arc<WorkerSeries>,
    worker_id: u64,
}

impl MetricsRecorder {
    pub fn worker_id(&self) -> u64 {
        self.worker_id
    }

    /// Records `count` messages that each observed `latency`.
    pub fn record(&self, latency: Duration, count: u64) {
        if count == 0 {
            return;
        }
        // One phase read so the count and the sample land on the same side.
        let measuring = self.inner.is_measuring();
        self.count_messages(count, measuring);
        self.observe(latency, count, measuring);
    }

    pub fn add_messages(&self, count: u64) {
        if count == 0 {
            return;
        }
        self.count_messages(count, self.inner.is_measuring());
    }

    /// Records one latency sample without touching the message count.
    pub fn record_latency(&self, latency: Duration) {
        self.observe(latency, 1, self.inner.is_measuring());
    }

    fn count_messages(&self, count: u64, measuring: bool) {
        if measuring {
            self.series.messages.fetch_add(count, Ordering::Relaxed);
        } else {
            self.series
                .burn_in_messages
                .fetch_add(count, Ordering::Relaxed);
        }
    }

    fn observe(&self, latency: Duration, count: u64, measuring: bool) {
        let us = latency.as_micros().min(u64::MAX as u128) as u64;

        {
            let mut h = self.series.latency_window.lock();
            let _ = record_clamped(&mut h, us, count);
        }

        if !measuring {
            return;
        }

        let clamped = {
            let mut h = self.series.latency.lock();
            record_clamped(&mut h, us, count)
        };
        if clamped {
            self.series.clamped.fetch_add(count, Ordering::Relaxed);
        }
    }
}
