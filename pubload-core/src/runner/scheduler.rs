use std::time::Duration;

use super::error::{Error, Result};

/// Longest average delay between two ticks of one worker.
pub const MAX_TICK_INTERVAL: Duration = Duration::from_secs(24 * 60 * 60);

/// Average delay between two invocations of one worker when `worker_count` workers
/// share `target_rate` invocations per second.
///
/// Every worker gets the same share, so the delay is `worker_count / target_rate`
/// regardless of `worker_index`; the index is only checked for range.
pub fn next_delay(worker_index: u64, worker_count: u64, target_rate: f64) -> Result<Duration> {
    let scheduler = RateScheduler::new(target_rate, worker_count, 0.0)?;
    if worker_index >= worker_count {
        return Err(Error::WorkerIndexOutOfRange {
            index: worker_index,
            count: worker_count,
        });
    }
    Ok(scheduler.per_worker_interval())
}

#[derive(Debug, Clone, Copy, PartialEq)]
pub struct RateScheduler {
    target_rate: f64,
    worker_count: u64,
    interval: Duration,
    jitter: f64,
}

impl RateScheduler {
    pub fn new(target_rate: f64, worker_count: u64, jitter: f64) -> Result<Self> {
        if !target_rate.is_finite() || target_rate <= 0.0 {
            return Err(Error::InvalidRate);
        }
        if worker_count == 0 {
            return Err(Error::InvalidWorkers);
        }
        if !jitter.is_finite() || !(0.0..1.0).contains(&jitter) {
            return Err(Error::InvalidJitter);
        }

        let secs = worker_count as f64 / target_rate;
        if !(secs <= MAX_TICK_INTERVAL.as_secs_f64()) {
            return Err(Error::RateTooLow);
        }
        let interval = Duration::try_from_secs_f64(secs).map_err(|_| Error::InvalidRate)?;

        Ok(Self {
            target_rate,
            worker_count,
            interval,
            jitter,
        })
    }

    pub fn target_rate(&self) -> f64 {
        self.target_rate
    }

    pub fn worker_count(&self) -> u64 {
        self.worker_count
    }

    pub fn jitter(&self) -> f64 {
        self.jitter
    }

    pub fn per_worker_interval(&self) -> Duration {
        self.interval
    }

    pub fn per_worker_rate(&self) -> f64 {
        self.target_rate / self.worker_count as f64
    }

    /// Stagger for the first tick so that workers do not fire in lock-step:
    /// worker `i` of `N` starts `i / N` of an interval late.
    pub fn initial_offset(&self, worker_index: u64) -> Duration {
        let index = u128::from(worker_index % self.worker_count);
        let nanos = self.interval.as_nanos() * index / u128::from(self.worker_count);
        Duration::from_nanos(u64::try_from(nanos).unwrap_or(u64::MAX))
    }

    /// Delay until the next tick given a uniform sample in `[0, 1)`.
    ///
    /// The result is spread over `interval * (1 ± jitter)` and keeps the interval
    /// as its mean.
    pub fn jittered_delay(&self, unit_sample: f64) -> Duration {
        if self.jitter == 0.0 {
            return self.interval;
        }

        let u = if unit_sample.is_finite() {
            unit_sample.clamp(0.0, 1.0)
        } else {
            0.5
        };
        let factor = 1.0 + self.jitter * (2.0 * u - 1.0);

        Duration::try_from_secs_f64(self.interval.as_secs_f64() * factor).unwrap_or(self.interval)
    }
}
