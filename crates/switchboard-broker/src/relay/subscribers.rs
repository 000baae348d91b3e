use std::pin::Pin;
use std::sync::{Arc, Weak};
use std::task::{Context, Poll};

use bytes::Bytes;
use dashmap::DashMap;
use futures::Stream;
use switchboard_core::Subscription;
use tokio::sync::mpsc;
use tokio::sync::mpsc::error::TrySendError;
use tokio_stream::wrappers::ReceiverStream;

use super::protocol::RelayFrame;

const SUBSCRIPTION_QUEUE: usize = 1024;

type Unsubscribe = Box<dyn Fn(&str) + Send + Sync>;

/// Local subscriptions of one relay peer, keyed by topic.
///
/// When the last local subscription of a topic is dropped, `unsubscribe` is
/// called so the peer can send `unsub` to the hub.
pub(crate) struct Subscribers {
    topics: DashMap<String, Vec<mpsc::Sender<Bytes>>>,
    unsubscribe: Unsubscribe,
}

impl Subscribers {
    pub(crate) fn new(unsubscribe: impl Fn(&str) + Send + Sync + 'static) -> Arc<Self> {
        Arc::new(Self {
            topics: DashMap::new(),
            unsubscribe: Box::new(unsubscribe),
        })
    }

    /// Add a local subscription. The flag is `true` when the peer was not yet
    /// subscribed to `topic` at the hub.
    pub(crate) fn attach(self: &Arc<Self>, topic: &str) -> (Subscription, bool) {
        let (tx, rx) = mpsc::channel(SUBSCRIPTION_QUEUE);
        let mut senders = self.topics.entry(topic.to_string()).or_default();
        senders.retain(|s| !s.is_closed());
        senders.push(tx);
        let first = senders.len() == 1;
        drop(senders);
        let frames = TopicStream {
            frames: ReceiverStream::new(rx),
            topic: topic.to_string(),
            owner: Arc::downgrade(self),
        };
        (Subscription::new(topic, frames), first)
    }

    /// Topics with at least one live local subscription.
    pub(crate) fn topics(&self) -> Vec<String> {
        self.topics
            .iter()
            .filter(|entry| entry.value().iter().any(|s| !s.is_closed()))
            .map(|entry| entry.key().clone())
            .collect()
    }

    fn detach(&self, topic: &str) {
        if let Some(mut senders) = self.topics.get_mut(topic) {
            senders.retain(|s| !s.is_closed());
        }
        if self
            .topics
            .remove_if(topic, |_, senders| senders.is_empty())
            .is_some()
        {
            tracing::debug!(topic, "last local subscription dropped");
            (self.unsubscribe)(topic);
        }
    }

    /// Hand a `msg` frame received from the hub to every local subscription.
    pub(crate) fn route(&self, text: &str) {
        let frame = match RelayFrame::decode(text) {
            Ok(frame) => frame,
            Err(e) => {
                tracing::warn!(error = %e, "dropping malformed relay frame");
                return;
            }
        };
        let RelayFrame::Msg { topic, .. } = &frame else {
            tracing::debug!(?frame, "ignoring non-msg relay frame");
            return;
        };
        let payload = match frame.payload() {
            Ok(Some(payload)) => payload,
            Ok(None) => return,
            Err(e) => {
                tracing::warn!(topic = %topic, error = %e, "dropping relay frame with bad payload");
                return;
            }
        };
        let Some(mut senders) = self.topics.get_mut(topic) else {
            return;
        };
        senders.retain(|tx| match tx.try_send(payload.clone()) {
            Ok(()) => true,
            Err(TrySendError::Full(_)) => {
                tracing::warn!(topic = %topic, "relay subscription lagging, frame dropped");
                true
            }
            Err(TrySendError::Closed(_)) => false,
        });
    }

    /// Drop every sender, ending all subscription streams.
    pub(crate) fn clear(&self) {
        self.topics.clear();
    }
}

/// Subscription frames that detach from their [`Subscribers`] on drop.
struct TopicStream {
    frames: ReceiverStream<Bytes>,
    topic: String,
    owner: Weak<Subscribers>,
}

impl Stream for TopicStream {
    type Item = Bytes;

    fn poll_next(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Option<Bytes>> {
        Pin::new(&mut self.frames).poll_next(cx)
    }
}

impl Drop for TopicStream {
    fn drop(&mut self) {
        self.frames.close();
        if let Some(owner) = self.owner.upgrade() {
            owner.detach(&self.topic);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::relay::DataEncoding;
    use parking_lot::Mutex;

    fn recording() -> (Arc<Subscribers>, Arc<Mutex<Vec<String>>>) {
        let unsubscribed = Arc::new(Mutex::new(Vec::new()));
        let log = Arc::clone(&unsubscribed);
        let subs = Subscribers::new(move |topic| log.lock().push(topic.to_string()));
        (subs, unsubscribed)
    }

    #[tokio::test]
    async fn route_delivers_to_matching_topic_only() {
        let (subs, _) = recording();
        let (mut a, first_a) = subs.attach("a");
        let (mut b, first_b) = subs.attach("b");
        assert!(first_a && first_b);

        subs.route(
            &RelayFrame::message("a", "x".into(), DataEncoding::Utf8)
                .encode()
                .unwrap(),
        );

        assert_eq!(a.next().await, Some(Bytes::from_static(b"x")));
        subs.clear();
        assert_eq!(b.next().await, None);
    }

    #[test]
    fn second_attach_is_not_first() {
        let (subs, _) = recording();
        let (_a, first) = subs.attach("t");
        let (_b, second) = subs.attach("t");
        assert!(first);
        assert!(!second);
    }

    #[test]
    fn dropped_subscription_is_pruned_on_attach() {
        let (subs, _) = recording();
        let (a, _) = subs.attach("t");
        drop(a);
        let (_b, first) = subs.attach("t");
        assert!(first);
    }

    #[test]
    fn unsubscribes_after_last_local_subscription() {
        let (subs, unsubscribed) = recording();
        let (a, _) = subs.attach("t");
        let (b, _) = subs.attach("t");

        drop(a);
        assert!(unsubscribed.lock().is_empty());
        assert_eq!(subs.topics(), vec!["t".to_string()]);

        drop(b);
        assert_eq!(*unsubscribed.lock(), vec!["t".to_string()]);
        assert!(subs.topics().is_empty());
    }

    #[test]
    fn cleared_topics_do_not_unsubscribe() {
        let (subs, unsubscribed) = recording();
        let (a, _) = subs.attach("t");
        subs.clear();
        drop(a);
        assert!(unsubscribed.lock().is_empty());
    }
}
