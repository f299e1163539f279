use std::time::Duration;

/// Messages/sec over consecutive progress intervals.
///
/// Each [`RateSeries::advance`] turns the growth of a running message total into
/// a rate; rates passed with `sample == true` feed a Welford mean/stdev and the max.
#[derive(Debug, Default, Clone, Copy)]
pub struct RateSeries {
    last_total: u64,
    samples: u64,
    mean: f64,
    m2: f64,
    max: f64,
}

impl RateSeries {
    pub fn starting_at(total: u64) -> Self {
        Self {
            last_total: total,
            ..Self::default()
        }
    }

    /// Rate since the previous call, over `dt`. Moves the baseline to `total` either
    /// way, so intervals that are not sampled (burn-in) are still not double counted.
    pub fn advance(&mut self, total: u64, dt: Duration, sample: bool) -> f64 {
        let rate = per_sec(total.saturating_sub(self.last_total), dt);
        self.last_total = total;

        if sample {
            self.samples = self.samples.saturating_add(1);
            let delta = rate - self.mean;
            self.mean += delta / self.samples as f64;
            self.m2 += delta * (rate - self.mean);
            self.max = self.max.max(rate);
        }
        rate
    }

    pub fn stdev(&self) -> f64 {
        if self.samples < 2 {
            return 0.0;
        }
        (self.m2 / (self.samples - 1) as f64).sqrt()
    }

    pub fn max(&self) -> f64 {
        self.max
    }
}

/// `count` spread over `elapsed`; zero for an empty interval.
pub fn per_sec(count: u64, elapsed: Duration) -> f64 {
    let secs = elapsed.as_secs_f64();
    if secs > 0.0 { count as f64 / secs } else { 0.0 }
}
