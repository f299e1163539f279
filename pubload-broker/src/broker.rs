use std::collections::{BTreeMap, VecDeque};
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Condvar, Mutex, MutexGuard};
use std::time::{Duration, Instant, SystemTime};

use bytes::Bytes;
use dashmap::DashMap;
use tracing::debug;

pub const DEFAULT_QUEUE_CAPACITY: usize = 100_000;

pub type Result<T> = std::result::Result<T, BrokerError>;

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum BrokerError {
    #[error("subscription `{group}` on `{topic}` is full ({capacity} messages)")]
    Backpressure {
        topic: String,
        group: String,
        capacity: usize,
    },

    #[error("batch of {batch} messages exceeds the queue capacity of {capacity}")]
    BatchTooLarge { batch: usize, capacity: usize },

    #[error("broker is closed")]
    Closed,

    #[error("invalid broker parameters: {0}")]
    InvalidParams(String),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct BrokerConfig {
    /// Max messages buffered per subscription before publishes are refused.
    pub queue_capacity: usize,
    /// Simulated time between a publish call and its acknowledgement.
    pub ack_delay: Duration,
}

impl Default for BrokerConfig {
    fn default() -> Self {
        Self {
            queue_capacity: DEFAULT_QUEUE_CAPACITY,
            ack_delay: Duration::ZERO,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Message {
    pub offset: u64,
    pub payload: Bytes,
    pub published_at: SystemTime,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PublishAck {
    pub first_offset: u64,
    pub count: usize,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TopicStats {
    pub published: u64,
    /// Buffered message count per subscription group.
    pub backlog: BTreeMap<String, usize>,
}

/// Topic/subscription broker living in the current process.
///
/// Every subscription group receives each published message once; consumers
/// of the same group compete for its queue.
#[derive(Debug, Default)]
pub struct Broker {
    config: BrokerConfig,
    topics: DashMap<String, Arc<Topic>>,
    closed: AtomicBool,
}

impl Broker {
    pub fn new(config: BrokerConfig) -> Self {
        Self {
            config,
            topics: DashMap::new(),
            closed: AtomicBool::new(false),
        }
    }

    pub fn config(&self) -> BrokerConfig {
        self.config
    }

    pub fn publisher(&self, project: &str, topic: &str) -> Result<Publisher> {
        Ok(Publisher {
            topic: self.topic(project, topic)?,
            ack_delay: self.config.ack_delay,
        })
    }

    /// Joins `group` on the topic, creating the subscription if needed. Only messages
    /// published after the subscription exists are delivered.
    pub fn subscribe(&self, project: &str, topic: &str, group: &str) -> Result<Subscriber> {
        let topic = self.topic(project, topic)?;
        let subscription = topic.join(group, self.config.queue_capacity)?;
        Ok(Subscriber {
            topic,
            subscription,
            joined: true,
        })
    }

    pub fn topic_stats(&self, project: &str, topic: &str) -> Option<TopicStats> {
        let topic = self.topics.get(&topic_name(project, topic))?.clone();
        let backlog = lock(&topic.subscriptions)
            .iter()
            .map(|(group, s)| (group.clone(), lock(&s.queue).messages.len()))
            .collect();
        Some(TopicStats {
            published: topic.next_offset.load(Ordering::Relaxed),
            backlog,
        })
    }

    /// Refuses further publishes and wakes every poller. Buffered messages can
    /// still be drained.
    pub fn close(&self) {
        self.closed.store(true, Ordering::Release);
        for topic in self.topics.iter() {
            topic.close();
        }
    }

    pub fn is_closed(&self) -> bool {
        self.closed.load(Ordering::Acquire)
    }

    fn topic(&self, project: &str, topic: &str) -> Result<Arc<Topic>> {
        if self.is_closed() {
            return Err(BrokerError::Closed);
        }
        let name = topic_name(project, topic);
        let topic = self
            .topics
            .entry(name.clone())
            .or_insert_with(|| {
                debug!(topic = %name, "topic created");
                Arc::new(Topic::new(name))
            })
            .clone();
        Ok(topic)
    }
}

fn topic_name(project: &str, topic: &str) -> String {
    format!("projects/{project}/topics/{topic}")
}

fn lock<T>(m: &Mutex<T>) -> MutexGuard<'_, T> {
    m.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
}

#[derive(Debug)]
struct Topic {
    name: String,
    next_offset: AtomicU64,
    closed: AtomicBool,
    subscriptions: Mutex<BTreeMap<String, Arc<Subscription>>>,
}

impl Topic {
    fn new(name: String) -> Self {
        Self {
            name,
            next_offset: AtomicU64::new(0),
            closed: AtomicBool::new(false),
            subscriptions: Mutex::new(BTreeMap::new()),
        }
    }

    fn join(&self, group: &str, capacity: usize) -> Result<Arc<Subscription>> {
        let mut subs = lock(&self.subscriptions);
        if self.closed.load(Ordering::Acquire) {
            return Err(BrokerError::Closed);
        }
        let sub = subs
            .entry(group.to_string())
            .or_insert_with(|| {
                debug!(topic = %self.name, group, "subscription created");
                Arc::new(Subscription::new(group.to_string(), capacity))
            })
            .clone();
        sub.members.fetch_add(1, Ordering::AcqRel);
        Ok(sub)
    }

    fn leave(&self, sub: &Arc<Subscription>) {
        if sub.members.fetch_sub(1, Ordering::AcqRel) != 1 {
            return;
        }

        let mut subs = lock(&self.subscriptions);
        // A new member may have joined between the decrement and the lock.
        let still_empty = sub.members.load(Ordering::Acquire) == 0;
        let same = subs.get(&sub.group).is_some_and(|s| Arc::ptr_eq(s, sub));
        if still_empty && same {
            subs.remove(&sub.group);
            debug!(topic = %self.name, group = %sub.group, "subscription removed");
        }
    }

    /// Appends `payloads` to every subscription, or to none of them.
    fn append(&self, payloads: Vec<Bytes>) -> Result<PublishAck> {
        if self.closed.load(Ordering::Acquire) {
            return Err(BrokerError::Closed);
        }

        let batch = payloads.len();
        let subs = lock(&self.subscriptions);
        let mut queues: Vec<MutexGuard<'_, Queue>> = Vec::with_capacity(subs.len());
        for sub in subs.values() {
            if batch > sub.capacity {
                return Err(BrokerError::BatchTooLarge {
                    batch,
                    capacity: sub.capacity,
                });
            }
            let queue = lock(&sub.queue);
            if queue.messages.len() + batch > sub.capacity {
                return Err(BrokerError::Backpressure {
                    topic: self.name.clone(),
                    group: sub.group.clone(),
                    capacity: sub.capacity,
                });
            }
            queues.push(queue);
        }

        let first_offset = self.next_offset.fetch_add(batch as u64, Ordering::AcqRel);
        if batch == 0 || queues.is_empty() {
            return Ok(PublishAck {
                first_offset,
                count: batch,
            });
        }

        let published_at = SystemTime::now();
        let messages: Vec<Message> = payloads
            .into_iter()
            .zip(first_offset..)
            .map(|(payload, offset)| Message {
                offset,
                payload,
                published_at,
            })
            .collect();

        for queue in &mut queues {
            queue.messages.extend(messages.iter().cloned());
        }
        drop(queues);

        for sub in subs.values() {
            sub.ready.notify_all();
        }

        Ok(PublishAck {
            first_offset,
            count: batch,
        })
    }

    fn close(&self) {
        self.closed.store(true, Ordering::Release);
        for sub in lock(&self.subscriptions).values() {
            lock(&sub.queue).closed = true;
            sub.ready.notify_all();
        }
    }
}

#[derive(Debug, Default)]
struct Queue {
    messages: VecDeque<Message>,
    closed: bool,
}

#[derive(Debug)]
struct Subscription {
    group: String,
    capacity: usize,
    members: AtomicU64,
    queue: Mutex<Queue>,
    ready: Condvar,
}

impl Subscription {
    fn new(group: String, capacity: usize) -> Self {
        Self {
            group,
            capacity,
            members: AtomicU64::new(0),
            queue: Mutex::new(Queue::default()),
            ready: Condvar::new(),
        }
    }
}

/// Publish handle for one topic. Cheap to clone.
#[derive(Debug, Clone)]
pub struct Publisher {
    topic: Arc<Topic>,
    ack_delay: Duration,
}

impl Publisher {
    pub fn topic(&self) -> &str {
        &self.topic.name
    }

    pub async fn publish(&self, payloads: Vec<Bytes>) -> Result<PublishAck> {
        if !self.ack_delay.is_zero() {
            tokio::time::sleep(self.ack_delay).await;
        }
        self.topic.append(payloads)
    }
}

/// Member of a subscription group. Leaves the group when dropped.
#[derive(Debug)]
pub struct Subscriber {
    topic: Arc<Topic>,
    subscription: Arc<Subscription>,
    joined: bool,
}

impl Subscriber {
    pub fn group(&self) -> &str {
        &self.subscription.group
    }

    /// Blocks until at least one message is available or `timeout` elapses, and
    /// returns up to `max` messages (at least one when any are buffered).
    /// An empty result means the timeout elapsed.
    pub fn poll(&self, max: usize, timeout: Duration) -> Result<Vec<Message>> {
        // A timeout too large to represent waits until a message or close arrives.
        let deadline = Instant::now().checked_add(timeout);
        let sub = &self.subscription;
        let mut queue = lock(&sub.queue);

        loop {
            if !queue.messages.is_empty() {
                let n = max.max(1).min(queue.messages.len());
                return Ok(queue.messages.drain(..n).collect());
            }
            if queue.closed {
                return Err(BrokerError::Closed);
            }

            let Some(deadline) = deadline else {
                queue = sub
                    .ready
                    .wait(queue)
                    .unwrap_or_else(|poisoned| poisoned.into_inner());
                continue;
            };
            let now = Instant::now();
            if now >= deadline {
                return Ok(Vec::new());
            }
            queue = match sub.ready.wait_timeout(queue, deadline - now) {
                Ok((guard, _)) => guard,
                Err(poisoned) => poisoned.into_inner().0,
            };
        }
    }

    /// Leaves the group; the subscription is dropped with its last member.
    pub fn unsubscribe(&mut self) {
        if std::mem::take(&mut self.joined) {
            self.topic.leave(&self.subscription);
        }
    }
}

impl Drop for Subscriber {
    fn drop(&mut self) {
        self.unsubscribe();
    }
}
