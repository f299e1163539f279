use std::sync::Arc;
use std::time::{Duration, Instant, SystemTime};

use bytes::Bytes;
use pubload_core::{
    Blocking, BlockingTask, LatencyMetric, MetricsRecorder, Task, TaskContext, TaskError,
};
use tracing::debug;

use crate::broker::{Broker, BrokerError, Publisher, Subscriber};

pub const DEFAULT_PROJECT: &str = "pubload";
pub const DEFAULT_TOPIC: &str = "load-test";
pub const DEFAULT_GROUP_ID: &str = "subscriber";
pub const DEFAULT_BATCH_SIZE: usize = 10;
pub const DEFAULT_MESSAGE_SIZE: usize = 1000;
pub const DEFAULT_MAX_POLL_RECORDS: usize = 500;
pub const DEFAULT_POLL_TIMEOUT: Duration = Duration::from_millis(100);

impl From<BrokerError> for TaskError {
    fn from(err: BrokerError) -> Self {
        match err {
            BrokerError::Backpressure { .. } => TaskError::transient(err.to_string()),
            _ => TaskError::fatal(err.to_string()),
        }
    }
}

/// What each worker does against the broker.
#[derive(
    Debug,
    Clone,
    Copy,
    Default,
    PartialEq,
    Eq,
    strum::Display,
    strum::EnumString,
    strum::IntoStaticStr,
)]
#[strum(serialize_all = "snake_case")]
pub enum BackendMode {
    /// Every worker publishes one batch per tick.
    #[default]
    Publish,
    /// Every worker polls once per tick.
    Subscribe,
    /// Odd workers publish, even workers poll the same topic.
    Pubsub,
}

impl BackendMode {
    pub fn latency_metric(self) -> LatencyMetric {
        match self {
            Self::Publish => LatencyMetric::PublishAckLatency,
            Self::Subscribe | Self::Pubsub => LatencyMetric::EndToEndLatency,
        }
    }
}

#[derive(Debug, Clone)]
pub struct BrokerParams {
    pub broker: Arc<Broker>,
    pub mode: BackendMode,
    pub project: String,
    pub topic: String,
    pub group_id: String,
    pub batch_size: usize,
    pub message_size: usize,
    pub max_poll_records: usize,
    pub poll_timeout: Duration,
}

impl BrokerParams {
    pub fn new(broker: Arc<Broker>, mode: BackendMode) -> Self {
        Self {
            broker,
            mode,
            project: DEFAULT_PROJECT.to_string(),
            topic: DEFAULT_TOPIC.to_string(),
            group_id: DEFAULT_GROUP_ID.to_string(),
            batch_size: DEFAULT_BATCH_SIZE,
            message_size: DEFAULT_MESSAGE_SIZE,
            max_poll_records: DEFAULT_MAX_POLL_RECORDS,
            poll_timeout: DEFAULT_POLL_TIMEOUT,
        }
    }

    pub fn validate(&self) -> Result<(), BrokerError> {
        let invalid = |msg: &str| Err(BrokerError::InvalidParams(msg.to_string()));
        if self.project.is_empty() {
            return invalid("`project` must not be empty");
        }
        if self.topic.is_empty() {
            return invalid("`topic` must not be empty");
        }
        if self.group_id.is_empty() {
            return invalid("`group_id` must not be empty");
        }
        if self.batch_size == 0 {
            return invalid("`batch_size` must be a positive integer");
        }
        if self.max_poll_records == 0 {
            return invalid("`max_poll_records` must be a positive integer");
        }
        Ok(())
    }
}

/// Publishes one batch per invocation and records publish-ack latency for it.
#[derive(Debug)]
pub struct PublisherTask {
    publisher: Publisher,
    recorder: Option<MetricsRecorder>,
    payload: Bytes,
    batch_size: usize,
}

impl PublisherTask {
    /// With `recorder == None` the task only produces load.
    pub fn new(
        publisher: Publisher,
        recorder: Option<MetricsRecorder>,
        batch_size: usize,
        message_size: usize,
    ) -> Self {
        Self {
            publisher,
            recorder,
            payload: Bytes::from(vec![b'A'; message_size]),
            batch_size,
        }
    }
}

impl Task for PublisherTask {
    async fn run(&mut self) -> Result<(), TaskError> {
        let batch = vec![self.payload.clone(); self.batch_size];
        let started = Instant::now();
        let ack = self.publisher.publish(batch).await?;
        if let Some(recorder) = &self.recorder {
            recorder.record(started.elapsed(), ack.count as u64);
        }
        Ok(())
    }
}

/// Polls once per invocation; counts the records and records `now - published_at`
/// for each of them.
#[derive(Debug)]
pub struct SubscriberTask {
    subscriber: Subscriber,
    recorder: MetricsRecorder,
    max_records: usize,
    poll_timeout: Duration,
}

impl SubscriberTask {
    pub fn new(
        subscriber: Subscriber,
        recorder: MetricsRecorder,
        max_records: usize,
        poll_timeout: Duration,
    ) -> Self {
        Self {
            subscriber,
            recorder,
            max_records,
            poll_timeout,
        }
    }
}

impl BlockingTask for SubscriberTask {
    fn run(&mut self) -> Result<(), TaskError> {
        let records = self.subscriber.poll(self.max_records, self.poll_timeout)?;
        self.recorder.add_messages(records.len() as u64);

        let now = SystemTime::now();
        for record in &records {
            let latency = now
                .duration_since(record.published_at)
                .unwrap_or(Duration::ZERO);
            self.recorder.record_latency(latency);
        }
        Ok(())
    }

    fn shutdown(&mut self) {
        debug!(
            worker_id = self.recorder.worker_id(),
            group = self.subscriber.group(),
            "leaving subscription"
        );
        self.subscriber.unsubscribe();
    }
}

#[derive(Debug)]
pub enum BrokerTask {
    Publish(PublisherTask),
    Subscribe(Blocking<SubscriberTask>),
}

impl Task for BrokerTask {
    async fn run(&mut self) -> Result<(), TaskError> {
        match self {
            Self::Publish(task) => task.run().await,
            Self::Subscribe(task) => task.run().await,
        }
    }

    async fn shutdown(&mut self) {
        match self {
            Self::Publish(task) => task.shutdown().await,
            Self::Subscribe(task) => task.shutdown().await,
        }
    }
}

/// Task factory for [`pubload_core::LoadTestRunner`].
pub async fn build_task(ctx: TaskContext<BrokerParams>) -> Result<BrokerTask, BrokerError> {
    let params = &ctx.params;
    params.validate()?;

    let publish = match params.mode {
        BackendMode::Publish => true,
        BackendMode::Subscribe => false,
        BackendMode::Pubsub => {
            if ctx.worker_count < 2 {
                return Err(BrokerError::InvalidParams(
                    "`pubsub` mode needs at least 2 workers".to_string(),
                ));
            }
            ctx.worker_id % 2 == 1
        }
    };

    if publish {
        let publisher = params.broker.publisher(&params.project, &params.topic)?;
        // In pubsub mode only the subscribers report.
        let recorder = (params.mode == BackendMode::Publish).then(|| ctx.recorder.clone());
        return Ok(BrokerTask::Publish(PublisherTask::new(
            publisher,
            recorder,
            params.batch_size,
            params.message_size,
        )));
    }

    let subscriber = params
        .broker
        .subscribe(&params.project, &params.topic, &params.group_id)?;
    Ok(BrokerTask::Subscribe(Blocking::new(SubscriberTask::new(
        subscriber,
        ctx.recorder.clone(),
        params.max_poll_records,
        params.poll_timeout,
    ))))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::broker::BrokerConfig;
    use pubload_core::MetricsAggregator;

    fn ctx(
        params: BrokerParams,
        agg: &MetricsAggregator,
        worker_id: u64,
        worker_count: u64,
    ) -> TaskContext<BrokerParams> {
        TaskContext {
            worker_id,
            worker_count,
            rate_share: 1.0,
            params: Arc::new(params),
            recorder: agg.recorder(worker_id),
        }
    }

    #[test]
    fn backpressure_is_transient_everything_else_fatal() {
        let bp: TaskError = BrokerError::Backpressure {
            topic: "t".to_string(),
            group: "g".to_string(),
            capacity: 1,
        }
        .into();
        assert!(!bp.is_fatal());

        let closed: TaskError = BrokerError::Closed.into();
        assert!(closed.is_fatal());
    }

    #[test]
    fn mode_names_and_metrics() {
        assert_eq!("pubsub".parse::<BackendMode>().ok(), Some(BackendMode::Pubsub));
        assert_eq!(BackendMode::Subscribe.to_string(), "subscribe");
        assert_eq!(
            BackendMode::Publish.latency_metric(),
            LatencyMetric::PublishAckLatency
        );
        assert_eq!(
            BackendMode::Pubsub.latency_metric(),
            LatencyMetric::EndToEndLatency
        );
    }

    #[test]
    fn invalid_params_are_rejected() {
        let broker = Arc::new(Broker::default());
        let mut params = BrokerParams::new(broker, BackendMode::Publish);
        params.batch_size = 0;
        assert!(matches!(
            params.validate(),
            Err(BrokerError::InvalidParams(m)) if m.contains("batch_size")
        ));
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn publisher_records_ack_latency_per_message() -> anyhow::Result<()> {
        let broker = Arc::new(Broker::new(BrokerConfig {
            ack_delay: Duration::from_millis(5),
            ..BrokerConfig::default()
        }));
        let _sub = broker.subscribe(DEFAULT_PROJECT, DEFAULT_TOPIC, "g")?;
        let agg = MetricsAggregator::new(LatencyMetric::PublishAckLatency);

        let mut params = BrokerParams::new(broker.clone(), BackendMode::Publish);
        params.batch_size = 4;
        params.message_size = 16;
        let mut task = build_task(ctx(params, &agg, 1, 1)).await?;
        task.run().await?;
        task.run().await?;

        let snap = agg.snapshot();
        assert_eq!(snap.messages_total, 8);
        let latency = snap
            .latency
            .unwrap_or_else(|| panic!("expected latency"));
        assert_eq!(latency.count, 8);
        assert!(latency.min.is_some_and(|ms| ms >= 5.0), "{latency:?}");

        let stats = broker
            .topic_stats(DEFAULT_PROJECT, DEFAULT_TOPIC)
            .unwrap_or_else(|| panic!("topic missing"));
        assert_eq!(stats.published, 8);
        Ok(())
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn subscriber_counts_polls_and_records_end_to_end_latency() -> anyhow::Result<()> {
        let broker = Arc::new(Broker::default());
        let agg = MetricsAggregator::default();
        let mut params = BrokerParams::new(broker.clone(), BackendMode::Subscribe);
        params.max_poll_records = 3;
        params.poll_timeout = Duration::from_millis(20);

        let mut task = build_task(ctx(params, &agg, 1, 1)).await?;
        let publisher = broker.publisher(DEFAULT_PROJECT, DEFAULT_TOPIC)?;
        publisher.publish(vec![Bytes::from_static(b"x"); 5]).await?;

        task.run().await?;
        assert_eq!(agg.messages_total(), 3);
        task.run().await?;
        assert_eq!(agg.messages_total(), 5);
        // Empty poll after the timeout.
        task.run().await?;
        assert_eq!(agg.messages_total(), 5);
        assert_eq!(agg.snapshot().latency.map(|l| l.count), Some(5));

        task.shutdown().await;
        let stats = broker
            .topic_stats(DEFAULT_PROJECT, DEFAULT_TOPIC)
            .unwrap_or_else(|| panic!("topic missing"));
        assert!(stats.backlog.is_empty());
        Ok(())
    }

    #[tokio::test]
    async fn pubsub_splits_workers_and_needs_two() -> anyhow::Result<()> {
        let broker = Arc::new(Broker::default());
        let agg = MetricsAggregator::default();
        let params = BrokerParams::new(broker, BackendMode::Pubsub);

        let odd = build_task(ctx(params.clone(), &agg, 1, 2)).await?;
        let even = build_task(ctx(params.clone(), &agg, 2, 2)).await?;
        assert!(matches!(odd, BrokerTask::Publish(_)));
        assert!(matches!(even, BrokerTask::Subscribe(_)));

        let err = build_task(ctx(params, &agg, 1, 1)).await.err();
        assert!(matches!(err, Some(BrokerError::InvalidParams(_))));
        Ok(())
    }

    #[tokio::test]
    async fn closed_broker_fails_construction() {
        let broker = Arc::new(Broker::default());
        broker.close();
        let agg = MetricsAggregator::default();
        let err = build_task(ctx(BrokerParams::new(broker, BackendMode::Subscribe), &agg, 1, 1))
            .await
            .err();
        assert_eq!(err, Some(BrokerError::Closed));
    }
}
