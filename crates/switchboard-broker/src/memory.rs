use std::sync::Arc;

use async_trait::async_trait;
use bytes::Bytes;
use dashmap::DashMap;
use switchboard_core::{Broker, BrokerError, Subscription};
use tokio::sync::broadcast;
use tokio_stream::wrappers::errors::BroadcastStreamRecvError;
use tokio_stream::wrappers::BroadcastStream;
use tokio_stream::StreamExt;

const DEFAULT_CAPACITY: usize = 1024;

/// In-process pub/sub hub.
///
/// Clones share one set of topics, so several dispatchers in the same
/// process behave like nodes attached to one Redis-style broadcast channel.
/// Slow subscribers that fall more than `capacity` frames behind skip frames.
#[derive(Clone)]
pub struct MemoryBroker {
    topics: Arc<DashMap<String, broadcast::Sender<Bytes>>>,
    capacity: usize,
}

impl MemoryBroker {
    pub fn new() -> Self {
        Self::with_capacity(DEFAULT_CAPACITY)
    }

    pub fn with_capacity(capacity: usize) -> Self {
        Self {
            topics: Arc::new(DashMap::new()),
            capacity: capacity.max(1),
        }
    }

    /// Live subscriptions on a topic.
    pub fn subscriber_count(&self, topic: &str) -> usize {
        self.topics
            .get(topic)
            .map_or(0, |tx| tx.receiver_count())
    }
}

impl Default for MemoryBroker {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl Broker for MemoryBroker {
    fn name(&self) -> &'static str {
        "memory"
    }

    async fn publish(&self, topic: &str, frame: Bytes) -> Result<(), BrokerError> {
        let Some(tx) = self.topics.get(topic).map(|tx| tx.clone()) else {
            tracing::trace!(topic, "no subscribers, dropping frame");
            return Ok(());
        };
        // Err only means every receiver is gone; pub/sub drops the frame.
        let _ = tx.send(frame);
        Ok(())
    }

    async fn subscribe(&self, topic: &str) -> Result<Subscription, BrokerError> {
        let rx = self
            .topics
            .entry(topic.to_string())
            .or_insert_with(|| broadcast::channel(self.capacity).0)
            .subscribe();
        let owned_topic = topic.to_string();
        let frames = BroadcastStream::new(rx).filter_map(move |item| match item {
            Ok(frame) => Some(frame),
            Err(BroadcastStreamRecvError::Lagged(skipped)) => {
                tracing::warn!(topic = %owned_topic, skipped, "memory subscriber lagged, frames dropped");
                None
            }
        });
        Ok(Subscription::new(topic, frames))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    #[tokio::test]
    async fn every_subscriber_receives_each_publish() {
        let broker = MemoryBroker::new();
        let mut a = broker.subscribe("t").await.unwrap();
        let mut b = broker.clone().subscribe("t").await.unwrap();
        assert_eq!(broker.subscriber_count("t"), 2);

        broker.publish("t", Bytes::from_static(b"hello")).await.unwrap();

        assert_eq!(a.next().await, Some(Bytes::from_static(b"hello")));
        assert_eq!(b.next().await, Some(Bytes::from_static(b"hello")));
    }

    #[tokio::test]
    async fn topics_are_isolated() {
        let broker = MemoryBroker::new();
        let mut other = broker.subscribe("other").await.unwrap();
        let mut mine = broker.subscribe("mine").await.unwrap();

        broker.publish("mine", Bytes::from_static(b"x")).await.unwrap();

        assert_eq!(mine.next().await, Some(Bytes::from_static(b"x")));
        let waited = tokio::time::timeout(Duration::from_millis(20), other.next()).await;
        assert!(waited.is_err());
    }

    #[tokio::test]
    async fn publish_without_subscribers_is_ok() {
        let broker = MemoryBroker::new();
        broker.publish("nobody", Bytes::from_static(b"x")).await.unwrap();
        assert_eq!(broker.subscriber_count("nobody"), 0);
    }

    #[tokio::test]
    async fn lagging_subscriber_skips_and_continues() {
        let broker = MemoryBroker::with_capacity(2);
        let mut sub = broker.subscribe("t").await.unwrap();
        for i in 0..5u8 {
            broker.publish("t", Bytes::from(vec![i])).await.unwrap();
        }
        // Oldest frames were overwritten; the newest two survive.
        assert_eq!(sub.next().await, Some(Bytes::from(vec![3])));
        assert_eq!(sub.next().await, Some(Bytes::from(vec![4])));
    }
}
