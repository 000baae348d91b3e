use std::collections::HashSet;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use dashmap::DashMap;
use switchboard_core::CodecError;
use tokio::sync::mpsc;
use tokio::sync::mpsc::error::TrySendError;

use super::protocol::{DataEncoding, RelayFrame};

const DEFAULT_PEER_QUEUE: usize = 1024;

/// Identifier the hub assigns to each attached peer.
pub type PeerId = u64;

/// Topic fan-out hub for relay peers.
///
/// Transport-agnostic: the host endpoint calls [`join`](Self::join) per
/// socket, feeds inbound text through [`handle_frame`](Self::handle_frame)
/// and writes whatever the returned receiver yields. Every `pub` reaches
/// every subscriber of the topic, the publisher included.
#[derive(Clone)]
pub struct RelayHub {
    inner: Arc<HubInner>,
}

struct HubInner {
    next_peer: AtomicU64,
    peers: DashMap<PeerId, mpsc::Sender<String>>,
    topics: DashMap<String, HashSet<PeerId>>,
    peer_queue: usize,
}

impl RelayHub {
    pub fn new() -> Self {
        Self::with_peer_queue(DEFAULT_PEER_QUEUE)
    }

    pub fn with_peer_queue(peer_queue: usize) -> Self {
        Self {
            inner: Arc::new(HubInner {
                next_peer: AtomicU64::new(1),
                peers: DashMap::new(),
                topics: DashMap::new(),
                peer_queue: peer_queue.max(1),
            }),
        }
    }

    /// Attach a peer. The receiver yields encoded `msg` frames for it.
    pub fn join(&self) -> (PeerId, mpsc::Receiver<String>) {
        let peer = self.inner.next_peer.fetch_add(1, Ordering::Relaxed);
        let (tx, rx) = mpsc::channel(self.inner.peer_queue);
        let _ = self.inner.peers.insert(peer, tx);
        tracing::debug!(peer, "relay peer joined");
        (peer, rx)
    }

    /// Detach a peer and drop all of its subscriptions.
    pub fn leave(&self, peer: PeerId) {
        let _ = self.inner.peers.remove(&peer);
        self.inner.topics.retain(|_, subscribers| {
            let _ = subscribers.remove(&peer);
            !subscribers.is_empty()
        });
        tracing::debug!(peer, "relay peer left");
    }

    /// Apply one inbound text frame from `peer`.
    pub fn handle_frame(&self, peer: PeerId, text: &str) -> Result<(), CodecError> {
        match RelayFrame::decode(text)? {
            RelayFrame::Sub { topic } => {
                let _ = self.inner.topics.entry(topic).or_default().insert(peer);
            }
            RelayFrame::Unsub { topic } => {
                let _ = self
                    .inner
                    .topics
                    .remove_if_mut(&topic, |_, subscribers| {
                        let _ = subscribers.remove(&peer);
                        subscribers.is_empty()
                    });
            }
            RelayFrame::Pub { topic, data, enc } => self.fan_out(&topic, data, enc)?,
            RelayFrame::Msg { topic, .. } => {
                tracing::debug!(peer, topic, "ignoring msg frame sent by peer");
            }
        }
        Ok(())
    }

    /// Detach every peer. Their receivers end once drained.
    pub fn close(&self) {
        let peers = self.inner.peers.len();
        self.inner.peers.clear();
        self.inner.topics.clear();
        tracing::info!(peers, "relay hub closed");
    }

    pub fn peer_count(&self) -> usize {
        self.inner.peers.len()
    }

    pub fn subscriber_count(&self, topic: &str) -> usize {
        self.inner.topics.get(topic).map_or(0, |s| s.len())
    }

    fn fan_out(&self, topic: &str, data: String, enc: DataEncoding) -> Result<(), CodecError> {
        // Snapshot first; the topic shard lock must not be held while sending.
        let subscribers: Vec<PeerId> = match self.inner.topics.get(topic) {
            Some(set) => set.iter().copied().collect(),
            None => return Ok(()),
        };
        let text = RelayFrame::message(topic, data, enc).encode()?;
        for peer in subscribers {
            let Some(tx) = self.inner.peers.get(&peer).map(|tx| tx.clone()) else {
                continue;
            };
            match tx.try_send(text.clone()) {
                Ok(()) => {}
                Err(TrySendError::Full(_)) => {
                    tracing::warn!(peer, topic, "relay peer queue full, frame dropped");
                }
                Err(TrySendError::Closed(_)) => self.leave(peer),
            }
        }
        Ok(())
    }
}

impl Default for RelayHub {
    fn default() -> Self {
        Self::new()
    }
}
