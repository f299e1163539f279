use clap::{Args, Parser, Subcommand};
use pubload_broker::BackendMode;
use std::path::PathBuf;
use std::time::Duration;

const DURATION_HINT: &str = "expected e.g. 10s, 250ms, 1m30s";

/// Bare integers are seconds; anything else goes through `humantime`.
pub(crate) fn parse_duration(input: &str) -> Result<Duration, String> {
    let s = input.trim();
    if s.is_empty() {
        return Err(format!("duration cannot be empty ({DURATION_HINT})"));
    }

    if s.bytes().all(|b| b.is_ascii_digit()) {
        return s
            .parse::<u64>()
            .map(Duration::from_secs)
            .map_err(|_| format!("duration '{s}' is too large"));
    }

    humantime::parse_duration(s)
        .map_err(|err| format!("invalid duration '{s}': {err} ({DURATION_HINT})"))
}

fn parse_backend(input: &str) -> Result<BackendMode, String> {
    input
        .trim()
        .parse()
        .map_err(|_| format!("unknown backend '{input}' (expected publish, subscribe or pubsub)"))
}

#[derive(Debug, Clone, Copy, clap::ValueEnum)]
pub enum OutputFormat {
    /// Progress bar and a human-readable summary.
    HumanReadable,
    /// Emit JSON progress and summary lines (NDJSON) to stdout.
    Json,
}

#[derive(Debug, Parser)]
#[command(
    name = "pubload",
    author,
    version,
    about = "Rate-controlled load generator for publish/subscribe systems",
    long_about = concat!(
        "pubload drives a pub/sub backend at a fixed aggregate rate spread over N workers.\n\n",
        "Each worker runs its task on a fixed cadence (workers / rate), either publishing ",
        "batches or polling a subscription, while pubload collects throughput and latency. ",
        "Subscribe-only runs get a background feeder publishing at `--feed-rate`.\n\n",
        "Settings can come from flags or a YAML/JSON run file (`--config`); flags win."
    ),
    after_help = concat!(
        "Examples:\n",
        "  pubload run --rate 1000 --workers 4 --duration 30s\n",
        "  pubload run --backend pubsub --rate 200 --workers 8 --burn-in 5s\n",
        "  pubload run --backend subscribe --rate 50 --feed-rate 5000\n",
        "  pubload run --config run.yaml --output json"
    )
)]
pub struct Cli {
    #[command(subcommand)]
    pub command: Command,
}

#[derive(Debug, Subcommand)]
pub enum Command {
    /// Run a load test against the selected backend.
    Run(Box<RunArgs>),
}

#[derive(Debug, Args)]
pub struct RunArgs {
    /// YAML or JSON run file. Flags override values from the file.
    #[arg(long, value_name = "PATH")]
    pub config: Option<PathBuf>,

    /// What the workers do: publish, subscribe or pubsub (odd workers publish, even ones poll).
    #[arg(long, value_parser = parse_backend, value_name = "MODE")]
    pub backend: Option<BackendMode>,

    /// Target aggregate invocations per second, split evenly across workers.
    #[arg(long, value_name = "PER_SEC")]
    pub rate: Option<f64>,

    /// Measurement window (e.g. 10s, 1m). Defaults to 10s.
    #[arg(long, value_parser = parse_duration)]
    pub duration: Option<Duration>,

    /// Number of concurrent workers. Defaults to 1.
    #[arg(long, short = 'w')]
    pub workers: Option<u64>,

    /// Warm-up period before the measurement window; its samples are not reported.
    #[arg(long, value_parser = parse_duration)]
    pub burn_in: Option<Duration>,

    /// How long to wait for workers to stop before abandoning them. Defaults to 5s.
    #[arg(long, value_parser = parse_duration)]
    pub grace_period: Option<Duration>,

    /// Relative jitter applied to every tick interval, in [0, 1).
    #[arg(long)]
    pub jitter: Option<f64>,

    /// Seed for the jitter RNG.
    #[arg(long)]
    pub seed: Option<u64>,

    /// How often live metrics are reported. Defaults to 1s.
    #[arg(long, value_parser = parse_duration)]
    pub progress_interval: Option<Duration>,

    /// Disable live progress reporting.
    #[arg(long, overrides_with = "progress")]
    pub no_progress: bool,

    /// Enable live progress reporting even if the run file disables it.
    #[arg(long, overrides_with = "no_progress")]
    pub progress: bool,

    /// Fail a worker after this many consecutive transient errors.
    #[arg(long, value_name = "N")]
    pub max_transient_errors: Option<u32>,

    #[arg(long)]
    pub project: Option<String>,

    #[arg(long)]
    pub topic: Option<String>,

    /// Subscription shared by every subscribing worker.
    #[arg(long)]
    pub group_id: Option<String>,

    /// Messages per publish call.
    #[arg(long)]
    pub batch_size: Option<usize>,

    /// Payload size in bytes.
    #[arg(long)]
    pub message_size: Option<usize>,

    /// Max messages returned by one poll.
    #[arg(long)]
    pub max_poll_records: Option<usize>,

    /// How long one poll waits for messages.
    #[arg(long, value_parser = parse_duration)]
    pub poll_timeout: Option<Duration>,

    /// Max messages buffered per subscription before publishes are refused.
    #[arg(long)]
    pub queue_capacity: Option<usize>,

    /// Simulated delay between a publish call and its acknowledgement.
    #[arg(long, value_parser = parse_duration)]
    pub ack_delay: Option<Duration>,

    /// Messages per second published in the background for `--backend subscribe`.
    /// Defaults to 1000.
    #[arg(long, value_name = "PER_SEC")]
    pub feed_rate: Option<f64>,

    /// Output format.
    #[arg(long, value_enum, default_value_t = OutputFormat::HumanReadable)]
    pub output: OutputFormat,

    /// Exit with code 10 when any worker failed or had to be abandoned.
    #[arg(long)]
    pub fail_on_degraded: bool,
}
