use std::sync::Arc;

use async_trait::async_trait;
use bytes::Bytes;
use switchboard_core::{Broker, BrokerError, Subscription};
use tokio_util::sync::CancellationToken;

use super::hub::{PeerId, RelayHub};
use super::protocol::RelayFrame;
use super::subscribers::Subscribers;

/// Broker for the node that hosts the relay hub: joins the hub as an
/// in-process peer instead of dialing its own `/relay` endpoint.
pub struct HubPeer {
    hub: RelayHub,
    peer: PeerId,
    subscribers: Arc<Subscribers>,
    cancel: CancellationToken,
}

impl HubPeer {
    pub fn join(hub: &RelayHub) -> Self {
        let (peer, mut inbound) = hub.join();
        let unsub_hub = hub.clone();
        let subscribers = Subscribers::new(move |topic| {
            let unsubscribed = RelayFrame::unsubscribe(topic)
                .encode()
                .and_then(|text| unsub_hub.handle_frame(peer, &text));
            if let Err(e) = unsubscribed {
                tracing::warn!(peer, topic, error = %e, "relay unsub failed");
            }
        });
        let cancel = CancellationToken::new();

        let task_subscribers = Arc::clone(&subscribers);
        let task_cancel = cancel.clone();
        drop(tokio::spawn(async move {
            loop {
                tokio::select! {
                    () = task_cancel.cancelled() => break,
                    next = inbound.recv() => match next {
                        Some(text) => task_subscribers.route(&text),
                        None => break,
                    }
                }
            }
            task_subscribers.clear();
        }));

        Self {
            hub: hub.clone(),
            peer,
            subscribers,
            cancel,
        }
    }

    fn send_frame(&self, frame: &RelayFrame) -> Result<(), BrokerError> {
        if self.cancel.is_cancelled() {
            return Err(BrokerError::Closed);
        }
        let text = frame.encode()?;
        self.hub.handle_frame(self.peer, &text)?;
        Ok(())
    }
}

#[async_trait]
impl Broker for HubPeer {
    fn name(&self) -> &'static str {
        "relay"
    }

    fn is_connected(&self) -> bool {
        !self.cancel.is_cancelled()
    }

    async fn publish(&self, topic: &str, frame: Bytes) -> Result<(), BrokerError> {
        self.send_frame(&RelayFrame::publish(topic, &frame))
    }

    async fn subscribe(&self, topic: &str) -> Result<Subscription, BrokerError> {
        if self.cancel.is_cancelled() {
            return Err(BrokerError::Closed);
        }
        let (subscription, first) = self.subscribers.attach(topic);
        if first {
            self.send_frame(&RelayFrame::Sub {
                topic: topic.to_string(),
            })?;
        }
        Ok(subscription)
    }
}

impl Drop for HubPeer {
    fn drop(&mut self) {
        self.cancel.cancel();
        self.hub.leave(self.peer);
    }
}
