//! Local-first delivery with broker fan-out for recipients held elsewhere.

use std::collections::HashSet;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use bytes::Bytes;
use metrics::counter;
use serde::Serialize;
use switchboard_core::{Broker, Envelope, NodeId, RecipientId, Subscription};
use switchboard_telemetry::metrics as names;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use crate::errors::DispatchError;
use crate::registry::ConnectionRegistry;

/// What one send did on this node.
#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize)]
pub struct SendReport {
    /// Successful sends to connections on this node.
    pub delivered: usize,
    /// Recipients with no connection here, handed to the broker.
    pub unresolved: Vec<RecipientId>,
    /// Whether an envelope was published.
    pub published: bool,
}

/// Fan-out dispatcher for one node.
///
/// Only [`start`](Self::start) builds one, and it subscribes to the shared
/// topic first, so no send can precede the subscription.
pub struct Dispatcher {
    registry: ConnectionRegistry,
    broker: Arc<dyn Broker>,
    topic: String,
    node_id: NodeId,
    cancel: CancellationToken,
    /// Cleared when the pump stops for any reason.
    subscribed: Arc<AtomicBool>,
    pump: parking_lot::Mutex<Option<JoinHandle<()>>>,
}

impl Dispatcher {
    /// Subscribe to `topic` and start redelivering envelopes from it.
    ///
    /// A failed subscription is returned; there is no local-only fallback.
    pub async fn start(
        registry: ConnectionRegistry,
        broker: Arc<dyn Broker>,
        topic: impl Into<String>,
        node_id: NodeId,
    ) -> Result<Self, DispatchError> {
        let topic = topic.into();
        let subscription = broker
            .subscribe(&topic)
            .await
            .map_err(|source| DispatchError::Subscribe {
                topic: topic.clone(),
                source,
            })?;
        info!(topic = %topic, node = %node_id, broker = broker.name(), "subscribed to fan-out topic");

        let cancel = CancellationToken::new();
        let subscribed = Arc::new(AtomicBool::new(true));
        let pump = tokio::spawn(run_pump(
            subscription,
            registry.clone(),
            node_id.clone(),
            Arc::clone(&subscribed),
            cancel.clone(),
        ));

        Ok(Self {
            registry,
            broker,
            topic,
            node_id,
            cancel,
            subscribed,
            pump: parking_lot::Mutex::new(Some(pump)),
        })
    }

    pub fn node_id(&self) -> &NodeId {
        &self.node_id
    }

    pub fn topic(&self) -> &str {
        &self.topic
    }

    pub fn broker_name(&self) -> &'static str {
        self.broker.name()
    }

    pub fn registry(&self) -> &ConnectionRegistry {
        &self.registry
    }

    /// Envelopes from other nodes are still being redelivered here.
    pub fn is_subscribed(&self) -> bool {
        self.subscribed.load(Ordering::Acquire)
    }

    /// The broker link can carry publishes right now.
    pub fn broker_connected(&self) -> bool {
        self.broker.is_connected()
    }

    /// Deliver locally where possible and publish one envelope for the rest.
    ///
    /// Duplicate recipients count once. A publish error is returned, but
    /// the local deliveries already made stand.
    pub async fn send_to(
        &self,
        recipients: &[RecipientId],
        payload: Bytes,
    ) -> Result<SendReport, DispatchError> {
        let mut seen = HashSet::with_capacity(recipients.len());
        let mut report = SendReport::default();
        for recipient in recipients {
            if !seen.insert(recipient) {
                continue;
            }
            let delivered = self.registry.deliver_local(recipient, payload.clone()).await;
            if delivered == 0 {
                report.unresolved.push(recipient.clone());
            }
            report.delivered += delivered;
        }
        if !report.unresolved.is_empty() {
            self.publish(Envelope::targeted(report.unresolved.clone(), payload), "targeted")
                .await?;
            report.published = true;
        }
        debug!(
            delivered = report.delivered,
            unresolved = report.unresolved.len(),
            "targeted send"
        );
        Ok(report)
    }

    /// Deliver to every local connection, then always publish a broadcast.
    pub async fn send_all(&self, payload: Bytes) -> Result<SendReport, DispatchError> {
        let delivered = self.registry.deliver_broadcast_local(payload.clone()).await;
        self.publish(Envelope::broadcast(payload), "broadcast").await?;
        Ok(SendReport {
            delivered,
            unresolved: Vec::new(),
            published: true,
        })
    }

    /// Redeliver an envelope received from the broker. Returns local sends.
    pub async fn on_envelope(&self, envelope: Envelope) -> usize {
        redeliver(&self.registry, &self.node_id, envelope).await
    }

    /// Stop the subscription pump.
    pub async fn shutdown(&self) {
        self.cancel.cancel();
        let pump = self.pump.lock().take();
        if let Some(pump) = pump {
            let _ = pump.await;
        }
    }

    async fn publish(&self, envelope: Envelope, scope: &'static str) -> Result<(), DispatchError> {
        let frame = envelope.with_origin(self.node_id.clone()).encode().map_err(|e| {
            counter!(names::BROKER_ERRORS_TOTAL, "kind" => "codec").increment(1);
            DispatchError::Broker(e.into())
        })?;
        if let Err(e) = self.broker.publish(&self.topic, frame).await {
            counter!(names::BROKER_ERRORS_TOTAL, "kind" => e.error_kind()).increment(1);
            warn!(topic = %self.topic, error = %e, "publish failed");
            return Err(e.into());
        }
        counter!(names::ENVELOPES_PUBLISHED_TOTAL, "scope" => scope).increment(1);
        Ok(())
    }
}

impl Drop for Dispatcher {
    fn drop(&mut self) {
        self.cancel.cancel();
    }
}

async fn run_pump(
    mut subscription: Subscription,
    registry: ConnectionRegistry,
    node_id: NodeId,
    subscribed: Arc<AtomicBool>,
    cancel: CancellationToken,
) {
    loop {
        tokio::select! {
            () = cancel.cancelled() => break,
            next = subscription.next() => {
                let Some(raw) = next else {
                    error!(topic = subscription.topic(), "broker subscription ended, cross-node delivery stopped");
                    break;
                };
                match Envelope::decode(&raw) {
                    Ok(envelope) => {
                        let _ = redeliver(&registry, &node_id, envelope).await;
                    }
                    Err(e) => warn!(topic = subscription.topic(), error = %e, "dropping malformed envelope"),
                }
            }
        }
    }
    subscribed.store(false, Ordering::Release);
    debug!(topic = subscription.topic(), "subscription pump stopped");
}

/// Deliver an envelope to whatever recipients this node holds.
///
/// Envelopes this node published were already delivered here before
/// publishing and are skipped.
async fn redeliver(registry: &ConnectionRegistry, node_id: &NodeId, envelope: Envelope) -> usize {
    if envelope.origin() == Some(node_id) {
        return 0;
    }
    let scope = if envelope.is_broadcast() { "broadcast" } else { "targeted" };
    counter!(names::ENVELOPES_RECEIVED_TOTAL, "scope" => scope).increment(1);

    if envelope.is_broadcast() {
        return registry.deliver_broadcast_local(envelope.payload().clone()).await;
    }
    let mut delivered = 0;
    for recipient in envelope.recipients() {
        delivered += registry
            .deliver_local(recipient, envelope.payload().clone())
            .await;
    }
    delivered
}

#[cfg(test)]
mod tests {
    use std::time::Duration;

    use async_trait::async_trait;
    use switchboard_broker::MemoryBroker;
    use switchboard_core::BrokerError;

    use super::*;
    use crate::registry::testing::RecordingConnection;

    const TOPIC: &str = "switchboard.fanout";

    async fn node(broker: &MemoryBroker, name: &str) -> (ConnectionRegistry, Dispatcher) {
        let registry = ConnectionRegistry::default();
        let dispatcher = Dispatcher::start(
            registry.clone(),
            Arc::new(broker.clone()),
            TOPIC,
            NodeId::from_raw(name),
        )
        .await
        .unwrap();
        (registry, dispatcher)
    }

    async fn wait_for<F: Fn() -> bool>(check: F) {
        for _ in 0..200 {
            if check() {
                return;
            }
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
        panic!("condition not reached");
    }

    struct FailingBroker;

    #[async_trait]
    impl Broker for FailingBroker {
        fn name(&self) -> &'static str {
            "failing"
        }

        async fn publish(&self, topic: &str, _frame: Bytes) -> Result<(), BrokerError> {
            Err(BrokerError::Publish {
                topic: topic.to_string(),
                reason: "unreachable".into(),
            })
        }

        async fn subscribe(&self, topic: &str) -> Result<Subscription, BrokerError> {
            Ok(Subscription::idle(topic))
        }
    }

    /// Subscription ends at once, like a backend that lost its link for good.
    struct EndingBroker;

    #[async_trait]
    impl Broker for EndingBroker {
        fn name(&self) -> &'static str {
            "ending"
        }

        fn is_connected(&self) -> bool {
            false
        }

        async fn publish(&self, _topic: &str, _frame: Bytes) -> Result<(), BrokerError> {
            Err(BrokerError::Closed)
        }

        async fn subscribe(&self, topic: &str) -> Result<Subscription, BrokerError> {
            Ok(Subscription::new(topic, futures::stream::empty()))
        }
    }

    struct UnsubscribableBroker;

    #[async_trait]
    impl Broker for UnsubscribableBroker {
        fn name(&self) -> &'static str {
            "unsubscribable"
        }

        async fn publish(&self, _topic: &str, _frame: Bytes) -> Result<(), BrokerError> {
            Ok(())
        }

        async fn subscribe(&self, topic: &str) -> Result<Subscription, BrokerError> {
            Err(BrokerError::Subscribe {
                topic: topic.to_string(),
                reason: "denied".into(),
            })
        }
    }

    #[tokio::test]
    async fn remote_recipient_reached_through_broker() {
        let broker = MemoryBroker::new();
        let (registry_a, _a) = node(&broker, "node-a").await;
        let (_registry_b, b) = node(&broker, "node-b").await;
        let conn = RecordingConnection::new();
        let _reg = registry_a.register("u1".into(), "t1".into(), conn.clone());

        let report = b
            .send_to(&["u1".into()], Bytes::from_static(b"hello"))
            .await
            .unwrap();

        assert_eq!(report.delivered, 0);
        assert_eq!(report.unresolved, vec![RecipientId::from("u1")]);
        assert!(report.published);
        wait_for(|| !conn.messages().is_empty()).await;
        tokio::time::sleep(Duration::from_millis(20)).await;
        assert_eq!(conn.messages(), vec![Bytes::from_static(b"hello")]);
    }

    #[tokio::test]
    async fn local_recipient_is_not_published() {
        let broker = MemoryBroker::new();
        let (registry, dispatcher) = node(&broker, "node-a").await;
        let mut tap = broker.subscribe(TOPIC).await.unwrap();
        let conn = RecordingConnection::new();
        let _reg = registry.register("u1".into(), "t1".into(), conn.clone());

        let report = dispatcher
            .send_to(&["u1".into(), "u1".into()], Bytes::from_static(b"x"))
            .await
            .unwrap();

        assert_eq!(report.delivered, 1);
        assert!(report.unresolved.is_empty());
        assert!(!report.published);
        assert_eq!(conn.messages().len(), 1);
        let nothing = tokio::time::timeout(Duration::from_millis(50), tap.next()).await;
        assert!(nothing.is_err());
    }

    #[tokio::test]
    async fn only_unresolved_recipients_are_published() {
        let broker = MemoryBroker::new();
        let (registry, dispatcher) = node(&broker, "node-a").await;
        let mut tap = broker.subscribe(TOPIC).await.unwrap();
        let _reg = registry.register("here".into(), "t".into(), RecordingConnection::new());

        let report = dispatcher
            .send_to(&["here".into(), "away".into()], Bytes::from_static(b"x"))
            .await
            .unwrap();

        assert_eq!(report.delivered, 1);
        let raw = tokio::time::timeout(Duration::from_secs(1), tap.next())
            .await
            .unwrap()
            .unwrap();
        let envelope = Envelope::decode(&raw).unwrap();
        assert_eq!(envelope.recipients(), &[RecipientId::from("away")]);
        assert_eq!(envelope.origin(), Some(&NodeId::from_raw("node-a")));
    }

    #[tokio::test]
    async fn send_all_publishes_with_no_local_connections() {
        let broker = MemoryBroker::new();
        let (_registry, dispatcher) = node(&broker, "node-a").await;
        let mut tap = broker.subscribe(TOPIC).await.unwrap();

        let report = dispatcher.send_all(Bytes::from_static(b"all")).await.unwrap();

        assert_eq!(report.delivered, 0);
        assert!(report.published);
        let raw = tokio::time::timeout(Duration::from_secs(1), tap.next())
            .await
            .unwrap()
            .unwrap();
        assert!(Envelope::decode(&raw).unwrap().is_broadcast());
    }

    #[tokio::test]
    async fn broadcast_reaches_every_node_once() {
        let broker = MemoryBroker::new();
        let (registry_a, a) = node(&broker, "node-a").await;
        let (registry_b, _b) = node(&broker, "node-b").await;
        let on_a = RecordingConnection::new();
        let on_b = RecordingConnection::new();
        let _ra = registry_a.register("x".into(), "1".into(), on_a.clone());
        let _rb = registry_b.register("y".into(), "1".into(), on_b.clone());

        let report = a.send_all(Bytes::from_static(b"hi")).await.unwrap();
        assert_eq!(report.delivered, 1);

        wait_for(|| !on_b.messages().is_empty()).await;
        tokio::time::sleep(Duration::from_millis(20)).await;
        assert_eq!(on_a.messages().len(), 1);
        assert_eq!(on_b.messages().len(), 1);
    }

    #[tokio::test]
    async fn own_envelopes_are_skipped() {
        let broker = MemoryBroker::new();
        let (registry, dispatcher) = node(&broker, "node-a").await;
        let _reg = registry.register("u".into(), "t".into(), RecordingConnection::new());

        let own = Envelope::broadcast(Bytes::from_static(b"x")).with_origin(NodeId::from_raw("node-a"));
        assert_eq!(dispatcher.on_envelope(own).await, 0);

        let foreign = Envelope::broadcast(Bytes::from_static(b"x")).with_origin(NodeId::from_raw("node-b"));
        assert_eq!(dispatcher.on_envelope(foreign).await, 1);
    }

    #[tokio::test]
    async fn unknown_ids_in_envelope_are_ignored() {
        let broker = MemoryBroker::new();
        let (registry, dispatcher) = node(&broker, "node-a").await;
        let conn = RecordingConnection::new();
        let _reg = registry.register("u1".into(), "t".into(), conn.clone());

        let envelope = Envelope::targeted(
            vec!["ghost".into(), "u1".into()],
            Bytes::from_static(b"x"),
        );
        assert_eq!(dispatcher.on_envelope(envelope).await, 1);
        assert_eq!(conn.messages().len(), 1);
    }

    #[tokio::test]
    async fn malformed_envelope_does_not_stop_pump() {
        let broker = MemoryBroker::new();
        let (registry, _dispatcher) = node(&broker, "node-a").await;
        let conn = RecordingConnection::new();
        let _reg = registry.register("u1".into(), "t".into(), conn.clone());

        broker.publish(TOPIC, Bytes::from_static(b"garbage")).await.unwrap();
        let good = Envelope::targeted(vec!["u1".into()], Bytes::from_static(b"ok"))
            .encode()
            .unwrap();
        broker.publish(TOPIC, good).await.unwrap();

        wait_for(|| !conn.messages().is_empty()).await;
        assert_eq!(conn.messages(), vec![Bytes::from_static(b"ok")]);
    }

    #[tokio::test]
    async fn publish_failure_surfaces_after_local_delivery() {
        let registry = ConnectionRegistry::default();
        let dispatcher = Dispatcher::start(
            registry.clone(),
            Arc::new(FailingBroker),
            TOPIC,
            NodeId::generate(),
        )
        .await
        .unwrap();
        let conn = RecordingConnection::new();
        let _reg = registry.register("here".into(), "t".into(), conn.clone());

        let err = dispatcher
            .send_to(&["here".into(), "away".into()], Bytes::from_static(b"x"))
            .await
            .unwrap_err();
        assert!(matches!(err, DispatchError::Broker(BrokerError::Publish { .. })));
        assert_eq!(conn.messages().len(), 1);

        let err = dispatcher.send_all(Bytes::from_static(b"y")).await.unwrap_err();
        assert_eq!(err.error_kind(), "publish");
        assert_eq!(conn.messages().len(), 2);
    }

    #[tokio::test]
    async fn subscribe_failure_aborts_start() {
        let result = Dispatcher::start(
            ConnectionRegistry::default(),
            Arc::new(UnsubscribableBroker),
            TOPIC,
            NodeId::generate(),
        )
        .await;
        assert!(matches!(result, Err(DispatchError::Subscribe { .. })));
    }

    #[tokio::test]
    async fn shutdown_stops_redelivery() {
        let broker = MemoryBroker::new();
        let (registry, dispatcher) = node(&broker, "node-a").await;
        let conn = RecordingConnection::new();
        let _reg = registry.register("u1".into(), "t".into(), conn.clone());

        dispatcher.shutdown().await;
        assert_eq!(broker.subscriber_count(TOPIC), 0);

        let env = Envelope::targeted(vec!["u1".into()], Bytes::from_static(b"late"))
            .encode()
            .unwrap();
        broker.publish(TOPIC, env).await.unwrap();
        tokio::time::sleep(Duration::from_millis(20)).await;
        assert!(conn.messages().is_empty());
    }

    #[tokio::test]
    async fn ended_subscription_is_reported() {
        let dispatcher = Dispatcher::start(
            ConnectionRegistry::default(),
            Arc::new(EndingBroker),
            TOPIC,
            NodeId::generate(),
        )
        .await
        .unwrap();
        wait_for(|| !dispatcher.is_subscribed()).await;
        assert!(!dispatcher.broker_connected());
    }

    #[tokio::test]
    async fn live_subscription_is_reported() {
        let broker = MemoryBroker::new();
        let (_registry, dispatcher) = node(&broker, "node-a").await;
        assert!(dispatcher.is_subscribed());
        assert!(dispatcher.broker_connected());
        dispatcher.shutdown().await;
        assert!(!dispatcher.is_subscribed());
    }

    #[tokio::test]
    async fn empty_recipient_list_does_nothing() {
        let broker = MemoryBroker::new();
        let (_registry, dispatcher) = node(&broker, "node-a").await;
        let report = dispatcher.send_to(&[], Bytes::from_static(b"x")).await.unwrap();
        assert_eq!(report, SendReport::default());
    }
}
