use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use bytes::Bytes;
use futures::{SinkExt, StreamExt};
use switchboard_core::{Broker, BrokerError, Subscription};
use tokio::net::TcpStream;
use tokio::sync::{mpsc, watch};
use tokio_tungstenite::tungstenite::Message;
use tokio_tungstenite::{connect_async, MaybeTlsStream, WebSocketStream};
use tokio_util::sync::CancellationToken;

use super::protocol::RelayFrame;
use super::subscribers::Subscribers;

const OUTBOUND_QUEUE: usize = 1024;
const REDIAL_MIN: Duration = Duration::from_millis(100);
const REDIAL_MAX: Duration = Duration::from_secs(5);

type RelaySocket = WebSocketStream<MaybeTlsStream<TcpStream>>;

/// Broker backed by a WebSocket relay hub.
///
/// One link task owns the socket: it writes outbound frames and routes `msg`
/// frames to local subscriptions. When the socket drops the link redials with
/// exponential backoff and re-sends `sub` for every live topic. Subscriptions
/// survive the outage; publishes fail while the link is down.
pub struct RelayBroker {
    url: String,
    outbound: mpsc::Sender<String>,
    subscribers: Arc<Subscribers>,
    connected: watch::Receiver<bool>,
    cancel: CancellationToken,
}

impl std::fmt::Debug for RelayBroker {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RelayBroker")
            .field("url", &self.url)
            .finish_non_exhaustive()
    }
}

impl RelayBroker {
    /// Connect to a relay hub such as `ws://10.0.0.5:9300/relay`.
    ///
    /// Only this first dial is fatal; later outages are redialed.
    pub async fn connect(url: &str) -> Result<Self, BrokerError> {
        let (socket, _response) = connect_async(url)
            .await
            .map_err(|e| BrokerError::Connect {
                url: url.to_string(),
                reason: e.to_string(),
            })?;
        let (outbound, outbound_rx) = mpsc::channel::<String>(OUTBOUND_QUEUE);
        let unsub_tx = outbound.clone();
        let subscribers = Subscribers::new(move |topic| {
            match RelayFrame::unsubscribe(topic).encode() {
                Ok(text) => {
                    if unsub_tx.try_send(text).is_err() {
                        tracing::debug!(topic, "relay outbound queue unavailable, unsub dropped");
                    }
                }
                Err(e) => tracing::warn!(topic, error = %e, "cannot encode relay unsub"),
            }
        });
        let (connected_tx, connected) = watch::channel(true);
        let cancel = CancellationToken::new();

        drop(tokio::spawn(run_link(
            url.to_string(),
            socket,
            outbound_rx,
            Arc::clone(&subscribers),
            connected_tx,
            cancel.clone(),
        )));

        tracing::info!(url, "connected to relay");
        Ok(Self {
            url: url.to_string(),
            outbound,
            subscribers,
            connected,
            cancel,
        })
    }

    /// The broker was dropped or its link task stopped for good.
    pub fn is_closed(&self) -> bool {
        self.cancel.is_cancelled()
    }

    async fn send_frame(&self, frame: &RelayFrame) -> Result<(), BrokerError> {
        let text = frame.encode()?;
        self.outbound
            .send(text)
            .await
            .map_err(|_| BrokerError::Closed)
    }
}

#[async_trait]
impl Broker for RelayBroker {
    fn name(&self) -> &'static str {
        "relay"
    }

    fn is_connected(&self) -> bool {
        !self.is_closed() && *self.connected.borrow()
    }

    async fn publish(&self, topic: &str, frame: Bytes) -> Result<(), BrokerError> {
        if self.is_closed() {
            return Err(BrokerError::Closed);
        }
        if !*self.connected.borrow() {
            return Err(BrokerError::Publish {
                topic: topic.to_string(),
                reason: format!("relay link to {} is down", self.url),
            });
        }
        self.send_frame(&RelayFrame::publish(topic, &frame)).await
    }

    async fn subscribe(&self, topic: &str) -> Result<Subscription, BrokerError> {
        if self.is_closed() {
            return Err(BrokerError::Closed);
        }
        let (subscription, first) = self.subscribers.attach(topic);
        if first {
            self.send_frame(&RelayFrame::Sub {
                topic: topic.to_string(),
            })
            .await
            .map_err(|e| BrokerError::Subscribe {
                topic: topic.to_string(),
                reason: e.to_string(),
            })?;
        }
        Ok(subscription)
    }
}

impl Drop for RelayBroker {
    fn drop(&mut self) {
        self.cancel.cancel();
    }
}

/// Drive sessions until cancelled, redialing after each one drops.
async fn run_link(
    url: String,
    mut socket: RelaySocket,
    mut outbound: mpsc::Receiver<String>,
    subscribers: Arc<Subscribers>,
    connected: watch::Sender<bool>,
    cancel: CancellationToken,
) {
    loop {
        if run_session(&url, socket, &mut outbound, &subscribers, &cancel).await {
            break;
        }
        connected.send_replace(false);
        tracing::warn!(url = %url, "relay link down, redialing");
        match redial(&url, &cancel).await {
            Some(next) => socket = next,
            None => break,
        }
        connected.send_replace(true);
    }
    cancel.cancel();
    connected.send_replace(false);
    subscribers.clear();
}

/// Run one socket until it drops. Returns `true` when the broker is shutting
/// down rather than the link failing.
async fn run_session(
    url: &str,
    socket: RelaySocket,
    outbound: &mut mpsc::Receiver<String>,
    subscribers: &Subscribers,
    cancel: &CancellationToken,
) -> bool {
    let (mut sink, mut source) = socket.split();

    for topic in subscribers.topics() {
        let text = match (RelayFrame::Sub { topic }).encode() {
            Ok(text) => text,
            Err(e) => {
                tracing::warn!(url, error = %e, "cannot encode relay sub");
                continue;
            }
        };
        if let Err(e) = sink.send(Message::Text(text.into())).await {
            tracing::warn!(url, error = %e, "relay resubscribe failed");
            return false;
        }
    }

    loop {
        tokio::select! {
            () = cancel.cancelled() => {
                let _ = sink.send(Message::Close(None)).await;
                return true;
            }
            next = outbound.recv() => {
                let Some(text) = next else { return true };
                if let Err(e) = sink.send(Message::Text(text.into())).await {
                    tracing::warn!(url, error = %e, "relay write failed");
                    return false;
                }
            }
            msg = source.next() => match msg {
                Some(Ok(Message::Text(text))) => subscribers.route(text.as_str()),
                Some(Ok(Message::Close(_))) | None => {
                    tracing::info!(url, "relay connection closed");
                    return false;
                }
                Some(Ok(_)) => {}
                Some(Err(e)) => {
                    tracing::warn!(url, error = %e, "relay read failed");
                    return false;
                }
            }
        }
    }
}

/// Dial until it succeeds or `cancel` fires, doubling the delay up to
/// [`REDIAL_MAX`].
async fn redial(url: &str, cancel: &CancellationToken) -> Option<RelaySocket> {
    let mut delay = REDIAL_MIN;
    loop {
        tokio::select! {
            () = cancel.cancelled() => return None,
            () = tokio::time::sleep(delay) => {}
        }
        tokio::select! {
            () = cancel.cancelled() => return None,
            dialed = connect_async(url) => match dialed {
                Ok((socket, _)) => {
                    tracing::info!(url, "reconnected to relay");
                    return Some(socket);
                }
                Err(e) => {
                    tracing::debug!(url, error = %e, retry_in = ?delay, "relay redial failed");
                    delay = (delay * 2).min(REDIAL_MAX);
                }
            }
        }
    }
}
