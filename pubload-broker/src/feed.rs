use std::time::Duration;

use bytes::Bytes;
use tokio::task::JoinHandle;
use tokio::time::MissedTickBehavior;
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

use crate::broker::{BrokerError, Publisher};

/// Default messages/sec a [`Feeder`] publishes for subscribe-only runs.
pub const DEFAULT_FEED_RATE: f64 = 1000.0;

const MIN_FEED_PERIOD: Duration = Duration::from_millis(1);
const MAX_FEED_PERIOD: Duration = Duration::from_secs(24 * 60 * 60);

/// Background publishing that keeps a topic supplied while only subscribers
/// are measured.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct FeedConfig {
    /// Messages per second.
    pub rate: f64,
    /// Messages per publish call at low rates.
    pub batch_size: usize,
    pub message_size: usize,
}

impl FeedConfig {
    /// Tick period and messages published per tick.
    ///
    /// Batches of `batch_size` are spaced `batch_size / rate` apart; when that
    /// would be shorter than a millisecond, ticks stay 1ms apart and carry more
    /// messages instead.
    pub fn plan(&self) -> Result<(Duration, usize), BrokerError> {
        let invalid = |msg: &str| Err(BrokerError::InvalidParams(msg.to_string()));
        if !self.rate.is_finite() || self.rate <= 0.0 {
            return invalid("`feed_rate` must be a positive, finite number of messages per second");
        }
        if self.batch_size == 0 {
            return invalid("`batch_size` must be a positive integer");
        }

        let secs = self.batch_size as f64 / self.rate;
        if !(secs <= MAX_FEED_PERIOD.as_secs_f64()) {
            return invalid("`feed_rate` is too low: batches would be more than a day apart");
        }
        if secs >= MIN_FEED_PERIOD.as_secs_f64() {
            let period = Duration::try_from_secs_f64(secs).unwrap_or(MAX_FEED_PERIOD);
            return Ok((period, self.batch_size));
        }

        let per_tick = (self.rate * MIN_FEED_PERIOD.as_secs_f64()).round();
        Ok((MIN_FEED_PERIOD, (per_tick as usize).max(1)))
    }
}

#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct FeedStats {
    pub published: u64,
    /// Messages the broker refused (full subscription or oversized batch).
    pub rejected: u64,
}

/// Publishes on a fixed cadence until stopped or the broker closes.
#[derive(Debug)]
pub struct Feeder {
    stop: CancellationToken,
    handle: JoinHandle<FeedStats>,
}

impl Feeder {
    pub fn start(publisher: Publisher, config: FeedConfig) -> Result<Self, BrokerError> {
        let (period, per_tick) = config.plan()?;
        let payload = Bytes::from(vec![b'A'; config.message_size]);
        let stop = CancellationToken::new();

        debug!(topic = publisher.topic(), ?period, per_tick, "feeder started");
        let handle = tokio::spawn(feed(publisher, period, per_tick, payload, stop.clone()));
        Ok(Self { stop, handle })
    }

    pub async fn stop(self) -> FeedStats {
        self.stop.cancel();
        self.handle.await.unwrap_or_else(|err| {
            warn!(%err, "feeder did not exit cleanly");
            FeedStats::default()
        })
    }
}

async fn feed(
    publisher: Publisher,
    period: Duration,
    per_tick: usize,
    payload: Bytes,
    stop: CancellationToken,
) -> FeedStats {
    let mut stats = FeedStats::default();
    let mut interval = tokio::time::interval(period);
    interval.set_missed_tick_behavior(MissedTickBehavior::Delay);

    loop {
        tokio::select! {
            biased;
            _ = stop.cancelled() => break,
            _ = interval.tick() => {}
        }

        let published = tokio::select! {
            biased;
            _ = stop.cancelled() => break,
            res = publisher.publish(vec![payload.clone(); per_tick]) => res,
        };
        match published {
            Ok(ack) => stats.published += ack.count as u64,
            Err(BrokerError::Closed) => {
                debug!(topic = publisher.topic(), "broker closed; feeder stopping");
                break;
            }
            Err(err) => {
                debug!(topic = publisher.topic(), %err, "feed batch rejected");
                stats.rejected += per_tick as u64;
            }
        }
    }

    stats
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::broker::{Broker, BrokerConfig};

    fn config(rate: f64, batch_size: usize) -> FeedConfig {
        FeedConfig {
            rate,
            batch_size,
            message_size: 8,
        }
    }

    #[test]
    fn plan_spaces_batches_over_the_rate() {
        assert_eq!(
            config(100.0, 10).plan(),
            Ok((Duration::from_millis(100), 10))
        );
        // 50k/s in batches of 10 would tick every 200us.
        assert_eq!(config(50_000.0, 10).plan(), Ok((MIN_FEED_PERIOD, 50)));
    }

    #[test]
    fn plan_rejects_unusable_rates() {
        for rate in [0.0, -1.0, f64::NAN, f64::INFINITY, 1e-19] {
            assert!(
                matches!(config(rate, 10).plan(), Err(BrokerError::InvalidParams(_))),
                "rate {rate}"
            );
        }
        assert!(matches!(
            config(10.0, 0).plan(),
            Err(BrokerError::InvalidParams(m)) if m.contains("batch_size")
        ));
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn feeder_supplies_subscriptions_until_stopped() -> anyhow::Result<()> {
        let broker = Broker::default();
        let sub = broker.subscribe("p", "t", "g")?;
        let feeder = Feeder::start(broker.publisher("p", "t")?, config(1000.0, 5))?;

        let received = tokio::task::spawn_blocking(move || sub.poll(100, Duration::from_secs(2)))
            .await??;
        assert!(!received.is_empty());

        let stats = feeder.stop().await;
        assert!(stats.published >= received.len() as u64, "{stats:?}");
        assert_eq!(stats.rejected, 0);

        let published = broker
            .topic_stats("p", "t")
            .map(|s| s.published)
            .unwrap_or_else(|| panic!("topic missing"));
        tokio::time::sleep(Duration::from_millis(20)).await;
        let after = broker.topic_stats("p", "t").map(|s| s.published);
        assert_eq!(after, Some(published), "feeder kept publishing after stop");
        Ok(())
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn full_subscription_counts_rejections() -> anyhow::Result<()> {
        let broker = Broker::new(BrokerConfig {
            queue_capacity: 4,
            ..BrokerConfig::default()
        });
        let _sub = broker.subscribe("p", "t", "g")?;
        let feeder = Feeder::start(broker.publisher("p", "t")?, config(1000.0, 2))?;

        tokio::time::sleep(Duration::from_millis(50)).await;
        let stats = feeder.stop().await;
        assert_eq!(stats.published, 4, "{stats:?}");
        assert!(stats.rejected > 0, "{stats:?}");
        Ok(())
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn closing_the_broker_ends_the_feed() -> anyhow::Result<()> {
        let broker = Broker::default();
        let feeder = Feeder::start(broker.publisher("p", "t")?, config(1000.0, 1))?;
        tokio::time::sleep(Duration::from_millis(10)).await;
        broker.close();

        let stats = tokio::time::timeout(Duration::from_secs(1), feeder.stop())
            .await
            .unwrap_or_else(|_| panic!("feeder did not stop"));
        assert_eq!(stats.rejected, 0);
        Ok(())
    }
}
