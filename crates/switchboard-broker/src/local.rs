use async_trait::async_trait;
use bytes::Bytes;
use switchboard_core::{Broker, BrokerError, Subscription};

/// Broker for single-node deployments.
///
/// Every recipient lives on this node, so publishes have nobody to reach and
/// the subscription stays silent forever.
#[derive(Clone, Copy, Debug, Default)]
pub struct NoopBroker;

#[async_trait]
impl Broker for NoopBroker {
    fn name(&self) -> &'static str {
        "local"
    }

    async fn publish(&self, topic: &str, frame: Bytes) -> Result<(), BrokerError> {
        tracing::trace!(topic, len = frame.len(), "local broker dropped publish");
        Ok(())
    }

    async fn subscribe(&self, topic: &str) -> Result<Subscription, BrokerError> {
        Ok(Subscription::idle(topic))
    }
}
