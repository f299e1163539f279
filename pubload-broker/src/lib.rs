//! In-process publish/subscribe broker and the load-test tasks that drive it.

pub mod broker;
pub mod feed;
pub mod task;

pub use broker::{
    Broker, BrokerConfig, BrokerError, DEFAULT_QUEUE_CAPACITY, Message, PublishAck, Publisher,
    Subscriber, TopicStats,
};
pub use feed::{DEFAULT_FEED_RATE, FeedConfig, FeedStats, Feeder};
pub use task::{
    BackendMode, BrokerParams, BrokerTask, DEFAULT_BATCH_SIZE, DEFAULT_GROUP_ID,
    DEFAULT_MAX_POLL_RECORDS, DEFAULT_MESSAGE_SIZE, DEFAULT_POLL_TIMEOUT, DEFAULT_PROJECT,
    DEFAULT_TOPIC, PublisherTask, SubscriberTask, build_task,
};
