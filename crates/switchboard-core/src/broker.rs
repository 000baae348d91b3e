use async_trait::async_trait;
use bytes::Bytes;
use futures::stream::{self, BoxStream};
use futures::{Stream, StreamExt};

use crate::errors::BrokerError;

/// Cross-node pub/sub backend.
///
/// Every subscriber of a topic receives every frame published to it,
/// including frames published by its own node. Publishing is fire-and-forget:
/// `publish` returns once the backend has accepted the frame.
#[async_trait]
pub trait Broker: Send + Sync {
    /// Backend name for logs and health output.
    fn name(&self) -> &'static str;

    /// Whether the backend link is currently usable. Backends without a
    /// network link are always connected.
    fn is_connected(&self) -> bool {
        true
    }

    async fn publish(&self, topic: &str, frame: Bytes) -> Result<(), BrokerError>;

    async fn subscribe(&self, topic: &str) -> Result<Subscription, BrokerError>;
}

/// Stream of raw frames received on one topic.
///
/// Ends when the backend connection goes away.
pub struct Subscription {
    topic: String,
    frames: BoxStream<'static, Bytes>,
}

impl Subscription {
    pub fn new(
        topic: impl Into<String>,
        frames: impl Stream<Item = Bytes> + Send + 'static,
    ) -> Self {
        Self {
            topic: topic.into(),
            frames: frames.boxed(),
        }
    }

    /// A subscription that never yields and never ends.
    pub fn idle(topic: impl Into<String>) -> Self {
        Self::new(topic, stream::pending())
    }

    pub fn topic(&self) -> &str {
        &self.topic
    }

    pub async fn next(&mut self) -> Option<Bytes> {
        self.frames.next().await
    }
}

impl std::fmt::Debug for Subscription {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Subscription")
            .field("topic", &self.topic)
            .finish_non_exhaustive()
    }
}
