use anyhow::Context as _;
use pubload_broker::{
    BackendMode, Broker, BrokerConfig, BrokerParams, DEFAULT_BATCH_SIZE, DEFAULT_FEED_RATE,
    DEFAULT_MESSAGE_SIZE, DEFAULT_PROJECT, DEFAULT_TOPIC, FeedConfig, FeedStats, Feeder,
    build_task,
};
use pubload_core::{DEFAULT_DURATION, DEFAULT_WORKERS, LoadTestRunner, RunOptions, RunState};
use std::sync::Arc;
use tokio::sync::watch;
use tracing::{info, warn};

use crate::cli::RunArgs;
use crate::config_file::{self, RunFile};
use crate::exit_codes::ExitCode;
use crate::output::{self, RunHeader};
use crate::run_error::RunError;

pub async fn run(args: RunArgs) -> Result<ExitCode, RunError> {
    let file = match &args.config {
        Some(path) => config_file::load(path)
            .await
            .map_err(RunError::InvalidInput)?,
        None => RunFile::default(),
    };
    let settings = Settings::resolve(&args, file).map_err(RunError::InvalidInput)?;

    let out = output::formatter(args.output);
    out.print_header(&settings.header());

    let broker = Arc::new(Broker::new(settings.broker_config));
    let params = settings.params(broker.clone());
    params
        .validate()
        .context("invalid backend settings")
        .map_err(RunError::InvalidInput)?;

    let feed_target = (params.project.clone(), params.topic.clone());
    let runner = LoadTestRunner::new(settings.options, params, build_task)
        .with_latency_metric(settings.mode.latency_metric())
        .with_sink(out.clone().into_sink());

    let feed = settings.feed.map(|config| {
        tokio::spawn(feed_while_running(
            broker.clone(),
            feed_target,
            config,
            runner.state(),
        ))
    });

    let cancel = runner.cancel_token();
    let ctrl_c = tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            info!("interrupt received, stopping workers");
            cancel.cancel();
        }
    });

    let result = runner.run().await;
    ctrl_c.abort();
    if let Some(feed) = feed {
        match feed.await {
            Ok(Ok(stats)) => info!(
                published = stats.published,
                rejected = stats.rejected,
                "feeder stopped"
            ),
            Ok(Err(err)) => warn!(error = %format!("{err:#}"), "feeder failed"),
            Err(err) => warn!(%err, "feeder did not exit cleanly"),
        }
    }
    broker.close();

    match result {
        Ok(report) => Ok(ExitCode::from_report(&report, args.fail_on_degraded)),
        Err(err) => {
            out.abort();
            Err(err.into())
        }
    }
}

/// Publishes into the run's topic while the runner is `Running`, so that
/// subscribe-only runs have something to consume.
async fn feed_while_running(
    broker: Arc<Broker>,
    (project, topic): (String, String),
    config: FeedConfig,
    mut state: watch::Receiver<RunState>,
) -> anyhow::Result<FeedStats> {
    // Subscriptions exist once the runner leaves `Starting`.
    let reached = *state
        .wait_for(|s| !matches!(s, RunState::Configured | RunState::Starting))
        .await?;
    if reached != RunState::Running {
        return Ok(FeedStats::default());
    }

    let publisher = broker.publisher(&project, &topic)?;
    let feeder = Feeder::start(publisher, config)?;
    // An error means the runner is gone, which also ends the run.
    let _ = state.wait_for(|s| *s != RunState::Running).await;
    Ok(feeder.stop().await)
}

/// Flags layered over the run file.
#[derive(Debug)]
struct Settings {
    options: RunOptions,
    mode: BackendMode,
    broker_config: BrokerConfig,
    feed: Option<FeedConfig>,
    project: Option<String>,
    topic: Option<String>,
    group_id: Option<String>,
    batch_size: Option<usize>,
    message_size: Option<usize>,
    max_poll_records: Option<usize>,
    poll_timeout: Option<std::time::Duration>,
}

impl Settings {
    fn resolve(args: &RunArgs, file: RunFile) -> anyhow::Result<Self> {
        let options = cli_options(args).or(file.run_options());

        let mode = match (args.backend, file.backend.as_deref()) {
            (Some(mode), _) => mode,
            (None, Some(raw)) => raw
                .parse()
                .map_err(|_| anyhow::anyhow!("unknown backend `{raw}` in run file"))?,
            (None, None) => BackendMode::default(),
        };

        let defaults = BrokerConfig::default();
        let broker_config = BrokerConfig {
            queue_capacity: args
                .queue_capacity
                .or(file.queue_capacity)
                .unwrap_or(defaults.queue_capacity),
            ack_delay: args
                .ack_delay
                .or(file.ack_delay.map(Into::into))
                .unwrap_or(defaults.ack_delay),
        };
        anyhow::ensure!(
            broker_config.queue_capacity > 0,
            "`queue_capacity` must be a positive integer"
        );

        let workers = options.workers.unwrap_or(DEFAULT_WORKERS);
        anyhow::ensure!(
            mode != BackendMode::Pubsub || workers >= 2,
            "backend `pubsub` needs at least 2 workers (got {workers})"
        );

        let batch_size = args.batch_size.or(file.batch_size);
        let message_size = args.message_size.or(file.message_size);
        let feed_rate = args.feed_rate.or(file.feed_rate);
        let feed = match mode {
            BackendMode::Subscribe => {
                let config = FeedConfig {
                    rate: feed_rate.unwrap_or(DEFAULT_FEED_RATE),
                    batch_size: batch_size.unwrap_or(DEFAULT_BATCH_SIZE),
                    message_size: message_size.unwrap_or(DEFAULT_MESSAGE_SIZE),
                };
                config.plan()?;
                Some(config)
            }
            _ => {
                anyhow::ensure!(
                    feed_rate.is_none(),
                    "`feed_rate` only applies to backend `subscribe` (got `{mode}`)"
                );
                None
            }
        };

        Ok(Self {
            options,
            mode,
            broker_config,
            feed,
            project: args.project.clone().or(file.project),
            topic: args.topic.clone().or(file.topic),
            group_id: args.group_id.clone().or(file.group_id),
            batch_size,
            message_size,
            max_poll_records: args.max_poll_records.or(file.max_poll_records),
            poll_timeout: args.poll_timeout.or(file.poll_timeout.map(Into::into)),
        })
    }

    fn params(&self, broker: Arc<Broker>) -> BrokerParams {
        let mut params = BrokerParams::new(broker, self.mode);
        if let Some(v) = &self.project {
            params.project.clone_from(v);
        }
        if let Some(v) = &self.topic {
            params.topic.clone_from(v);
        }
        if let Some(v) = &self.group_id {
            params.group_id.clone_from(v);
        }
        if let Some(v) = self.batch_size {
            params.batch_size = v;
        }
        if let Some(v) = self.message_size {
            params.message_size = v;
        }
        if let Some(v) = self.max_poll_records {
            params.max_poll_records = v;
        }
        if let Some(v) = self.poll_timeout {
            params.poll_timeout = v;
        }
        params
    }

    fn header(&self) -> RunHeader {
        RunHeader {
            backend: self.mode,
            project: self.project.clone().unwrap_or_else(|| DEFAULT_PROJECT.to_string()),
            topic: self.topic.clone().unwrap_or_else(|| DEFAULT_TOPIC.to_string()),
            feed_rate: self.feed.map(|f| f.rate),
            rate: self.options.rate,
            workers: self.options.workers.unwrap_or(DEFAULT_WORKERS),
            duration: self.options.duration.unwrap_or(DEFAULT_DURATION),
            burn_in: self.options.burn_in.unwrap_or_default(),
            message_size: self.message_size.unwrap_or(DEFAULT_MESSAGE_SIZE),
        }
    }
}

fn cli_options(args: &RunArgs) -> RunOptions {
    RunOptions {
        rate: args.rate,
        duration: args.duration,
        workers: args.workers,
        burn_in: args.burn_in,
        grace_period: args.grace_period,
        jitter: args.jitter,
        seed: args.seed,
        progress_interval: args.progress_interval,
        disable_progress: if args.no_progress {
            Some(true)
        } else {
            args.progress.then_some(false)
        },
        max_transient_errors: args.max_transient_errors,
    }
}
