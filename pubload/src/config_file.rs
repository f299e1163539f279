use anyhow::Context as _;
use pubload_core::RunOptions;
use serde::Deserialize;
use std::path::Path;
use std::time::Duration;

/// Run settings loaded from `--config`; every field is optional.
#[derive(Debug, Default, Deserialize)]
#[serde(deny_unknown_fields)]
pub(crate) struct RunFile {
    pub rate: Option<f64>,
    pub duration: Option<YamlDuration>,
    pub workers: Option<u64>,
    pub burn_in: Option<YamlDuration>,
    pub grace_period: Option<YamlDuration>,
    pub jitter: Option<f64>,
    pub seed: Option<u64>,
    pub progress_interval: Option<YamlDuration>,
    pub disable_progress: Option<bool>,
    pub max_transient_errors: Option<u32>,

    pub backend: Option<String>,
    pub project: Option<String>,
    pub topic: Option<String>,
    pub group_id: Option<String>,
    pub batch_size: Option<usize>,
    pub message_size: Option<usize>,
    pub max_poll_records: Option<usize>,
    pub poll_timeout: Option<YamlDuration>,
    pub queue_capacity: Option<usize>,
    pub ack_delay: Option<YamlDuration>,
    pub feed_rate: Option<f64>,
}

impl RunFile {
    pub(crate) fn run_options(&self) -> RunOptions {
        RunOptions {
            rate: self.rate,
            duration: self.duration.map(YamlDuration::into_inner),
            workers: self.workers,
            burn_in: self.burn_in.map(YamlDuration::into_inner),
            grace_period: self.grace_period.map(YamlDuration::into_inner),
            jitter: self.jitter,
            seed: self.seed,
            progress_interval: self.progress_interval.map(YamlDuration::into_inner),
            disable_progress: self.disable_progress,
            max_transient_errors: self.max_transient_errors,
        }
    }
}

pub(crate) async fn load(path: &Path) -> anyhow::Result<RunFile> {
    let raw = tokio::fs::read_to_string(path)
        .await
        .with_context(|| format!("failed to read run file {}", path.display()))?;
    parse(&raw, path)
}

fn parse(raw: &str, path: &Path) -> anyhow::Result<RunFile> {
    let is_json = path
        .extension()
        .and_then(|e| e.to_str())
        .is_some_and(|e| e.eq_ignore_ascii_case("json"));

    if is_json {
        serde_json::from_str(raw).with_context(|| format!("invalid run file {}", path.display()))
    } else {
        // An empty YAML document means "no overrides".
        if raw.trim().is_empty() {
            return Ok(RunFile::default());
        }
        serde_yaml::from_str(raw).with_context(|| format!("invalid run file {}", path.display()))
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) struct YamlDuration(Duration);

impl YamlDuration {
    fn into_inner(self) -> Duration {
        self.0
    }
}

impl From<YamlDuration> for Duration {
    fn from(value: YamlDuration) -> Self {
        value.0
    }
}

impl<'de> Deserialize<'de> for YamlDuration {
    fn deserialize<D>(deserializer: D) -> Result<Self, D::Error>
    where
        D: serde::Deserializer<'de>,
    {
        struct V;

        impl serde::de::Visitor<'_> for V {
            type Value = YamlDuration;

            fn expecting(&self, f: &mut std::fmt::Formatter) -> std::fmt::Result {
                f.write_str("duration as string (e.g. 10s), integer seconds, or float seconds")
            }

            fn visit_u64<E>(self, v: u64) -> Result<Self::Value, E>
            where
                E: serde::de::Error,
            {
                Ok(YamlDuration(Duration::from_secs(v)))
            }

            fn visit_i64<E>(self, v: i64) -> Result<Self::Value, E>
            where
                E: serde::de::Error,
            {
                u64::try_from(v)
                    .map(|secs| YamlDuration(Duration::from_secs(secs)))
                    .map_err(|_| E::custom("duration must not be negative"))
            }

            fn visit_f64<E>(self, v: f64) -> Result<Self::Value, E>
            where
                E: serde::de::Error,
            {
                Duration::try_from_secs_f64(v)
                    .map(YamlDuration)
                    .map_err(|_| E::custom("duration must be a non-negative, finite number"))
            }

            fn visit_str<E>(self, v: &str) -> Result<Self::Value, E>
            where
                E: serde::de::Error,
            {
                let d = humantime::parse_duration(v.trim()).map_err(E::custom)?;
                Ok(YamlDuration(d))
            }
        }

        deserializer.deserialize_any(V)
    }
}
