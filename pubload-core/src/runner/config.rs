use std::sync::Arc;
use std::time::Duration;

use super::error::{Error, Result};
use super::scheduler::RateScheduler;

pub const DEFAULT_DURATION: Duration = Duration::from_secs(10);
pub const DEFAULT_WORKERS: u64 = 1;
pub const DEFAULT_GRACE_PERIOD: Duration = Duration::from_secs(5);
pub const DEFAULT_PROGRESS_INTERVAL: Duration = Duration::from_secs(1);
/// Upper bound for `burn_in + duration + grace_period`.
pub const MAX_RUN_SPAN: Duration = Duration::from_secs(365 * 24 * 60 * 60);

/// Raw run options. Every field is optional so that sources can be layered
/// (CLI flags over a config file over defaults) before validation.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct RunOptions {
    pub rate: Option<f64>,
    pub duration: Option<Duration>,
    pub workers: Option<u64>,
    pub burn_in: Option<Duration>,
    pub grace_period: Option<Duration>,
    pub jitter: Option<f64>,
    pub seed: Option<u64>,
    pub progress_interval: Option<Duration>,
    pub disable_progress: Option<bool>,
    pub max_transient_errors: Option<u32>,
}

impl RunOptions {
    /// Fills every unset field from `fallback`.
    pub fn or(self, fallback: RunOptions) -> RunOptions {
        RunOptions {
            rate: self.rate.or(fallback.rate),
            duration: self.duration.or(fallback.duration),
            workers: self.workers.or(fallback.workers),
            burn_in: self.burn_in.or(fallback.burn_in),
            grace_period: self.grace_period.or(fallback.grace_period),
            jitter: self.jitter.or(fallback.jitter),
            seed: self.seed.or(fallback.seed),
            progress_interval: self.progress_interval.or(fallback.progress_interval),
            disable_progress: self.disable_progress.or(fallback.disable_progress),
            max_transient_errors: self.max_transient_errors.or(fallback.max_transient_errors),
        }
    }
}

/// Validated, immutable run configuration.
#[derive(Debug)]
pub struct RunConfiguration<P> {
    scheduler: RateScheduler,
    duration: Duration,
    burn_in: Duration,
    grace_period: Duration,
    seed: u64,
    progress_interval: Option<Duration>,
    max_transient_errors: Option<u32>,
    params: Arc<P>,
}

impl<P> Clone for RunConfiguration<P> {
    fn clone(&self) -> Self {
        Self {
            scheduler: self.scheduler,
            duration: self.duration,
            burn_in: self.burn_in,
            grace_period: self.grace_period,
            seed: self.seed,
            progress_interval: self.progress_interval,
            max_transient_errors: self.max_transient_errors,
            params: self.params.clone(),
        }
    }
}

impl<P> RunConfiguration<P> {
    pub fn from_options(options: RunOptions, params: P) -> Result<Self> {
        let rate = options.rate.ok_or(Error::InvalidRate)?;
        let workers = options.workers.unwrap_or(DEFAULT_WORKERS);
        let scheduler = RateScheduler::new(rate, workers, options.jitter.unwrap_or(0.0))?;

        let duration = options.duration.unwrap_or(DEFAULT_DURATION);
        if duration.is_zero() {
            return Err(Error::InvalidDuration);
        }

        let grace_period = options.grace_period.unwrap_or(DEFAULT_GRACE_PERIOD);
        if grace_period.is_zero() {
            return Err(Error::InvalidGracePeriod);
        }

        let burn_in = options.burn_in.unwrap_or(Duration::ZERO);
        let span = burn_in
            .checked_add(duration)
            .and_then(|d| d.checked_add(grace_period));
        if !span.is_some_and(|span| span <= MAX_RUN_SPAN) {
            return Err(Error::RunTooLong);
        }

        let progress_interval = if options.disable_progress.unwrap_or(false) {
            None
        } else {
            let every = options
                .progress_interval
                .unwrap_or(DEFAULT_PROGRESS_INTERVAL);
            if every.is_zero() {
                return Err(Error::InvalidProgressInterval);
            }
            Some(every)
        };

        if options.max_transient_errors == Some(0) {
            return Err(Error::InvalidMaxTransientErrors);
        }

        Ok(Self {
            scheduler,
            duration,
            burn_in,
            grace_period,
            seed: options.seed.unwrap_or(0),
            progress_interval,
            max_transient_errors: options.max_transient_errors,
            params: Arc::new(params),
        })
    }

    pub fn scheduler(&self) -> RateScheduler {
        self.scheduler
    }

    pub fn target_rate(&self) -> f64 {
        self.scheduler.target_rate()
    }

    pub fn workers(&self) -> u64 {
        self.scheduler.worker_count()
    }

    pub fn jitter(&self) -> f64 {
        self.scheduler.jitter()
    }

    /// Length of the measurement window, excluding burn-in.
    pub fn duration(&self) -> Duration {
        self.duration
    }

    pub fn burn_in(&self) -> Duration {
        self.burn_in
    }

    pub fn grace_period(&self) -> Duration {
        self.grace_period
    }

    pub fn seed(&self) -> u64 {
        self.seed
    }

    pub fn progress_interval(&self) -> Option<Duration> {
        self.progress_interval
    }

    pub fn max_transient_errors(&self) -> Option<u32> {
        self.max_transient_errors
    }

    pub fn params(&self) -> &Arc<P> {
        &self.params
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn opts(rate: f64) -> RunOptions {
        RunOptions {
            rate: Some(rate),
            ..RunOptions::default()
        }
    }

    #[test]
    fn defaults_are_applied() {
        let cfg = RunConfiguration::from_options(opts(50.0), ())
            .unwrap_or_else(|e| panic!("config: {e}"));
        assert_eq!(cfg.workers(), DEFAULT_WORKERS);
        assert_eq!(cfg.duration(), DEFAULT_DURATION);
        assert_eq!(cfg.burn_in(), Duration::ZERO);
        assert_eq!(cfg.grace_period(), DEFAULT_GRACE_PERIOD);
        assert_eq!(cfg.progress_interval(), Some(DEFAULT_PROGRESS_INTERVAL));
        assert_eq!(cfg.max_transient_errors(), None);
        assert_eq!(cfg.seed(), 0);
        assert_eq!(cfg.jitter(), 0.0);
    }

    #[test]
    fn missing_or_non_positive_rate_is_rejected() {
        let err = RunConfiguration::from_options(RunOptions::default(), ()).err();
        assert!(matches!(err, Some(Error::InvalidRate)));

        let err = RunConfiguration::from_options(opts(0.0), ()).err();
        assert!(matches!(err, Some(Error::InvalidRate)));

        let err = RunConfiguration::from_options(opts(-1.0), ()).err();
        assert!(matches!(err, Some(Error::InvalidRate)));
    }

    #[test]
    fn zero_values_are_rejected() {
        let cases = [
            (
                RunOptions {
                    workers: Some(0),
                    ..opts(1.0)
                },
                "workers",
            ),
            (
                RunOptions {
                    duration: Some(Duration::ZERO),
                    ..opts(1.0)
                },
                "duration",
            ),
            (
                RunOptions {
                    grace_period: Some(Duration::ZERO),
                    ..opts(1.0)
                },
                "grace_period",
            ),
            (
                RunOptions {
                    progress_interval: Some(Duration::ZERO),
                    ..opts(1.0)
                },
                "progress_interval",
            ),
            (
                RunOptions {
                    max_transient_errors: Some(0),
                    ..opts(1.0)
                },
                "max_transient_errors",
            ),
        ];

        for (options, field) in cases {
            let err = RunConfiguration::from_options(options, ())
                .err()
                .unwrap_or_else(|| panic!("expected `{field}` to be rejected"));
            assert!(err.is_configuration(), "{field}: {err}");
            assert!(err.to_string().contains(field), "{field}: {err}");
        }
    }

    #[test]
    fn disabled_progress_skips_interval_validation() {
        let cfg = RunConfiguration::from_options(
            RunOptions {
                progress_interval: Some(Duration::ZERO),
                disable_progress: Some(true),
                ..opts(1.0)
            },
            (),
        )
        .unwrap_or_else(|e| panic!("config: {e}"));
        assert_eq!(cfg.progress_interval(), None);
    }

    #[test]
    fn layering_prefers_the_receiver() {
        let cli = RunOptions {
            rate: Some(200.0),
            workers: None,
            ..RunOptions::default()
        };
        let file = RunOptions {
            rate: Some(10.0),
            workers: Some(4),
            jitter: Some(0.1),
            ..RunOptions::default()
        };

        let merged = cli.or(file);
        assert_eq!(merged.rate, Some(200.0));
        assert_eq!(merged.workers, Some(4));
        assert_eq!(merged.jitter, Some(0.1));
        assert_eq!(merged.duration, None);
    }

    #[test]
    fn explicit_progress_setting_overrides_the_fallback() {
        let file = RunOptions {
            disable_progress: Some(true),
            ..RunOptions::default()
        };
        let cli = RunOptions {
            disable_progress: Some(false),
            ..opts(1.0)
        };

        let merged = cli.or(file.clone());
        assert_eq!(merged.disable_progress, Some(false));
        let cfg = RunConfiguration::from_options(merged, ())
            .unwrap_or_else(|e| panic!("config: {e}"));
        assert_eq!(cfg.progress_interval(), Some(DEFAULT_PROGRESS_INTERVAL));

        let merged = opts(1.0).or(file);
        assert_eq!(merged.disable_progress, Some(true));
        let cfg = RunConfiguration::from_options(merged, ())
            .unwrap_or_else(|e| panic!("config: {e}"));
        assert_eq!(cfg.progress_interval(), None);
    }

    #[test]
    fn run_span_is_bounded() {
        let huge = Duration::from_secs(u64::MAX);
        let cases = [
            RunOptions {
                duration: Some(huge),
                ..opts(1.0)
            },
            RunOptions {
                grace_period: Some(huge),
                ..opts(1.0)
            },
            RunOptions {
                burn_in: Some(huge),
                ..opts(1.0)
            },
            RunOptions {
                duration: Some(MAX_RUN_SPAN),
                ..opts(1.0)
            },
        ];
        for options in cases {
            let err = RunConfiguration::from_options(options.clone(), ()).err();
            assert!(
                matches!(err, Some(Error::RunTooLong)),
                "{options:?}: {err:?}"
            );
        }

        let longest = MAX_RUN_SPAN - DEFAULT_GRACE_PERIOD;
        let cfg = RunConfiguration::from_options(
            RunOptions {
                duration: Some(longest),
                ..opts(1.0)
            },
            (),
        )
        .unwrap_or_else(|e| panic!("config: {e}"));
        assert_eq!(cfg.duration(), longest);
    }

    #[test]
    fn params_are_shared_not_copied() {
        let cfg = RunConfiguration::from_options(opts(1.0), String::from("topic-a"))
            .unwrap_or_else(|e| panic!("config: {e}"));
        let copy = cfg.clone();
        assert!(Arc::ptr_eq(cfg.params(), copy.params()));
        assert_eq!(copy.params().as_str(), "topic-a");
    }
}
