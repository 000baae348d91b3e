//! In-process table of live connections: recipient → token → connection.
//!
//! The registry owns connection lifecycle. Every connection ends exactly once,
//! through whichever comes first of client close, transport error, idle
//! timeout, explicit disconnect, failed send or replacement. The outer map
//! never keeps a recipient with no tokens.

use std::collections::HashMap;
use std::fmt;
use std::sync::atomic::{AtomicU64, AtomicU8, Ordering};
use std::sync::{Arc, OnceLock, Weak};
use std::time::{Duration, Instant};

use bytes::Bytes;
use dashmap::mapref::entry::Entry;
use dashmap::DashMap;
use futures::stream::{self, StreamExt};
use metrics::{counter, gauge, histogram};
use serde::Serialize;
use switchboard_core::{Connection, ConnectionToken, Frame, RecipientId, SendError};
use switchboard_settings::DeliverySettings;
use switchboard_telemetry::metrics as names;
use tracing::{debug, warn};

/// Why a connection left the registry.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum CloseReason {
    ClientClosed,
    TransportError,
    IdleTimeout,
    Disconnected,
    SendFailed,
    HeartbeatFailed,
    Replaced,
    Shutdown,
}

impl CloseReason {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::ClientClosed => "client_closed",
            Self::TransportError => "transport_error",
            Self::IdleTimeout => "idle_timeout",
            Self::Disconnected => "disconnected",
            Self::SendFailed => "send_failed",
            Self::HeartbeatFailed => "heartbeat_failed",
            Self::Replaced => "replaced",
            Self::Shutdown => "shutdown",
        }
    }
}

impl fmt::Display for CloseReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum ConnectionState {
    Connecting,
    Open,
    Closed,
}

const CONNECTING: u8 = 0;
const OPEN: u8 = 1;
const CLOSED: u8 = 2;

/// How deliveries push frames to connections.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct DeliveryConfig {
    /// A send slower than this is a failure.
    pub send_timeout: Duration,
    /// Sends in flight per delivery call. `1` is sequential.
    pub concurrency: usize,
}

impl Default for DeliveryConfig {
    fn default() -> Self {
        Self::from(&DeliverySettings::default())
    }
}

impl From<&DeliverySettings> for DeliveryConfig {
    fn from(settings: &DeliverySettings) -> Self {
        Self {
            send_timeout: settings.send_timeout(),
            concurrency: settings.concurrency.max(1),
        }
    }
}

/// Outcome of one keepalive round.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Serialize)]
pub struct KeepaliveReport {
    pub pinged: usize,
    pub evicted: usize,
}

/// Lifecycle of one registration. CLOSED is absorbing.
struct SlotState {
    state: AtomicU8,
    reason: OnceLock<CloseReason>,
    generation: u64,
    registered_at: Instant,
}

impl SlotState {
    fn new(generation: u64) -> Self {
        Self {
            state: AtomicU8::new(CONNECTING),
            reason: OnceLock::new(),
            generation,
            registered_at: Instant::now(),
        }
    }

    fn state(&self) -> ConnectionState {
        match self.state.load(Ordering::Acquire) {
            CONNECTING => ConnectionState::Connecting,
            OPEN => ConnectionState::Open,
            _ => ConnectionState::Closed,
        }
    }

    fn mark_open(&self) -> bool {
        self.state
            .compare_exchange(CONNECTING, OPEN, Ordering::AcqRel, Ordering::Acquire)
            .is_ok()
    }

    /// `true` for the single caller that moved the slot to CLOSED.
    fn close(&self, reason: CloseReason) -> bool {
        if self.state.swap(CLOSED, Ordering::AcqRel) == CLOSED {
            return false;
        }
        let _ = self.reason.set(reason);
        true
    }
}

#[derive(Clone)]
struct Slot {
    conn: Arc<dyn Connection>,
    state: Arc<SlotState>,
}

/// Snapshot entry used by deliveries.
struct Target {
    recipient: RecipientId,
    token: ConnectionToken,
    slot: Slot,
}

struct RegistryInner {
    recipients: DashMap<RecipientId, HashMap<ConnectionToken, Slot>>,
    next_generation: AtomicU64,
    delivery: DeliveryConfig,
}

impl RegistryInner {
    /// Remove `(recipient, token)` if present and, when `generation` is
    /// given, only if it still holds that registration.
    fn remove(
        &self,
        recipient: &RecipientId,
        token: &ConnectionToken,
        generation: Option<u64>,
        reason: CloseReason,
    ) -> bool {
        let removed = match self.recipients.entry(recipient.clone()) {
            Entry::Occupied(mut bucket) => {
                let matches = bucket.get().get(token).is_some_and(|slot| {
                    generation.map_or(true, |g| slot.state.generation == g)
                });
                if matches {
                    let slot = bucket.get_mut().remove(token);
                    if bucket.get().is_empty() {
                        let _ = bucket.remove();
                    }
                    slot
                } else {
                    None
                }
            }
            Entry::Vacant(_) => None,
        };
        match removed {
            Some(slot) => finish(recipient, token, &slot, reason),
            None => false,
        }
    }
}

/// Close a slot that has left the map. Counts and closes only once.
fn finish(recipient: &RecipientId, token: &ConnectionToken, slot: &Slot, reason: CloseReason) -> bool {
    if !slot.state.close(reason) {
        return false;
    }
    counter!(names::CONNECTIONS_EVICTED_TOTAL, "reason" => reason.as_str()).increment(1);
    gauge!(names::CONNECTIONS_ACTIVE).decrement(1.0);
    histogram!(names::CONNECTION_DURATION_SECONDS)
        .record(slot.state.registered_at.elapsed().as_secs_f64());
    debug!(recipient = %recipient, token = %token, reason = %reason, "connection evicted");
    slot.conn.close();
    true
}

/// Handle to one registry. Clones share the same table.
#[derive(Clone)]
pub struct ConnectionRegistry {
    inner: Arc<RegistryInner>,
}

impl ConnectionRegistry {
    pub fn new(delivery: DeliveryConfig) -> Self {
        Self {
            inner: Arc::new(RegistryInner {
                recipients: DashMap::new(),
                next_generation: AtomicU64::new(1),
                delivery,
            }),
        }
    }

    pub fn delivery(&self) -> DeliveryConfig {
        self.inner.delivery
    }

    /// Insert a connection, replacing any previous one under the same token.
    ///
    /// The replaced connection is closed with [`CloseReason::Replaced`]; its
    /// registration can no longer evict anything.
    pub fn register(
        &self,
        recipient: RecipientId,
        token: ConnectionToken,
        conn: Arc<dyn Connection>,
    ) -> Registration {
        let generation = self.inner.next_generation.fetch_add(1, Ordering::Relaxed);
        let state = Arc::new(SlotState::new(generation));
        let slot = Slot {
            conn,
            state: Arc::clone(&state),
        };
        let replaced = self
            .inner
            .recipients
            .entry(recipient.clone())
            .or_default()
            .insert(token.clone(), slot);

        counter!(names::CONNECTIONS_REGISTERED_TOTAL).increment(1);
        gauge!(names::CONNECTIONS_ACTIVE).increment(1.0);
        debug!(recipient = %recipient, token = %token, generation, "connection registered");

        if let Some(old) = replaced {
            let _ = finish(&recipient, &token, &old, CloseReason::Replaced);
        }

        Registration {
            registry: Arc::downgrade(&self.inner),
            recipient,
            token,
            state,
        }
    }

    /// Remove a connection. Absent pairs are a no-op; returns whether this
    /// call did the removal.
    pub fn evict(&self, recipient: &RecipientId, token: &ConnectionToken) -> bool {
        self.inner
            .remove(recipient, token, None, CloseReason::Disconnected)
    }

    /// Send `payload` to every connection of `recipient` on this node.
    ///
    /// Failing connections are evicted; the rest still receive it. Returns
    /// the number of successful sends, `0` when the recipient is not here.
    pub async fn deliver_local(&self, recipient: &RecipientId, payload: Bytes) -> usize {
        let targets = self.snapshot_recipient(recipient);
        if targets.is_empty() {
            return 0;
        }
        let (delivered, _) = self
            .deliver(targets, Frame::Message(payload), CloseReason::SendFailed)
            .await;
        counter!(names::DELIVERIES_TOTAL, "scope" => "targeted").increment(delivered as u64);
        delivered
    }

    /// Send `payload` to every connection on this node.
    pub async fn deliver_broadcast_local(&self, payload: Bytes) -> usize {
        let targets = self.snapshot_all();
        if targets.is_empty() {
            return 0;
        }
        let (delivered, _) = self
            .deliver(targets, Frame::Message(payload), CloseReason::SendFailed)
            .await;
        counter!(names::DELIVERIES_TOTAL, "scope" => "broadcast").increment(delivered as u64);
        delivered
    }

    /// Send a keepalive frame to every connection, evicting the ones that fail.
    pub async fn keepalive_all(&self) -> KeepaliveReport {
        let targets = self.snapshot_all();
        let pinged = targets.len();
        let (_, evicted) = self
            .deliver(targets, Frame::KeepAlive, CloseReason::HeartbeatFailed)
            .await;
        KeepaliveReport { pinged, evicted }
    }

    /// Close every connection with [`CloseReason::Shutdown`].
    pub fn shutdown(&self) -> usize {
        let recipients: Vec<RecipientId> =
            self.inner.recipients.iter().map(|e| e.key().clone()).collect();
        let mut closed = 0;
        for recipient in recipients {
            let Some((recipient, bucket)) = self.inner.recipients.remove(&recipient) else {
                continue;
            };
            for (token, slot) in bucket {
                if finish(&recipient, &token, &slot, CloseReason::Shutdown) {
                    closed += 1;
                }
            }
        }
        closed
    }

    pub fn connection_count(&self) -> usize {
        self.inner.recipients.iter().map(|e| e.value().len()).sum()
    }

    pub fn recipient_count(&self) -> usize {
        self.inner.recipients.len()
    }

    pub fn contains(&self, recipient: &RecipientId, token: &ConnectionToken) -> bool {
        self.inner
            .recipients
            .get(recipient)
            .is_some_and(|bucket| bucket.contains_key(token))
    }

    /// The connection under `(recipient, token)` and the generation of its
    /// registration.
    pub(crate) fn connection(
        &self,
        recipient: &RecipientId,
        token: &ConnectionToken,
    ) -> Option<(Arc<dyn Connection>, u64)> {
        self.inner.recipients.get(recipient).and_then(|bucket| {
            bucket
                .get(token)
                .map(|slot| (Arc::clone(&slot.conn), slot.state.generation))
        })
    }

    /// Evict `(recipient, token)` only while it still holds `generation`.
    pub(crate) fn evict_generation(
        &self,
        recipient: &RecipientId,
        token: &ConnectionToken,
        generation: u64,
    ) -> bool {
        self.inner
            .remove(recipient, token, Some(generation), CloseReason::Disconnected)
    }

    fn snapshot_recipient(&self, recipient: &RecipientId) -> Vec<Target> {
        let Some(bucket) = self.inner.recipients.get(recipient) else {
            return Vec::new();
        };
        bucket
            .iter()
            .map(|(token, slot)| Target {
                recipient: recipient.clone(),
                token: token.clone(),
                slot: slot.clone(),
            })
            .collect()
    }

    fn snapshot_all(&self) -> Vec<Target> {
        let mut targets = Vec::new();
        for bucket in self.inner.recipients.iter() {
            for (token, slot) in bucket.value() {
                targets.push(Target {
                    recipient: bucket.key().clone(),
                    token: token.clone(),
                    slot: slot.clone(),
                });
            }
        }
        targets
    }

    /// Send `frame` to each target independently. Returns (delivered, evicted).
    ///
    /// Runs on a snapshot: no map guard is held across a send, so evictions
    /// during the round are safe.
    async fn deliver(&self, targets: Vec<Target>, frame: Frame, on_failure: CloseReason) -> (usize, usize) {
        let DeliveryConfig {
            send_timeout,
            concurrency,
        } = self.inner.delivery;
        let inner = &*self.inner;
        let frame = &frame;

        let outcomes: Vec<(bool, bool)> = stream::iter(targets)
            .map(|target| async move {
                let sent = match tokio::time::timeout(send_timeout, target.slot.conn.send(frame.clone())).await {
                    Ok(result) => result,
                    Err(_) => Err(SendError::TimedOut(send_timeout)),
                };
                match sent {
                    Ok(()) => (true, false),
                    Err(e) => {
                        counter!(names::DELIVERY_FAILURES_TOTAL, "kind" => e.error_kind()).increment(1);
                        warn!(
                            recipient = %target.recipient,
                            token = %target.token,
                            frame = frame.kind(),
                            error = %e,
                            "send failed, evicting connection"
                        );
                        let evicted = inner.remove(
                            &target.recipient,
                            &target.token,
                            Some(target.slot.state.generation),
                            on_failure,
                        );
                        (false, evicted)
                    }
                }
            })
            .buffer_unordered(concurrency)
            .collect()
            .await;

        outcomes.iter().fold((0, 0), |(delivered, evicted), &(ok, gone)| {
            (delivered + usize::from(ok), evicted + usize::from(gone))
        })
    }
}

impl Default for ConnectionRegistry {
    fn default() -> Self {
        Self::new(DeliveryConfig::default())
    }
}

/// Handle returned by [`ConnectionRegistry::register`].
///
/// Transports report termination through it. Every signal funnels into one
/// [`terminate`](Self::terminate); only the first one evicts.
#[derive(Clone)]
pub struct Registration {
    registry: Weak<RegistryInner>,
    recipient: RecipientId,
    token: ConnectionToken,
    state: Arc<SlotState>,
}

impl Registration {
    pub fn recipient(&self) -> &RecipientId {
        &self.recipient
    }

    pub fn token(&self) -> &ConnectionToken {
        &self.token
    }

    pub fn state(&self) -> ConnectionState {
        self.state.state()
    }

    pub fn is_closed(&self) -> bool {
        self.state() == ConnectionState::Closed
    }

    pub fn close_reason(&self) -> Option<CloseReason> {
        self.state.reason.get().copied()
    }

    /// CONNECTING → OPEN. No effect once closed.
    pub fn mark_open(&self) -> bool {
        self.state.mark_open()
    }

    /// The client closed the connection.
    pub fn close(&self) -> bool {
        self.terminate(CloseReason::ClientClosed)
    }

    /// The transport failed.
    pub fn error(&self) -> bool {
        self.terminate(CloseReason::TransportError)
    }

    /// The connection sat idle past its deadline.
    pub fn timeout(&self) -> bool {
        self.terminate(CloseReason::IdleTimeout)
    }

    /// Evict this registration, and only this one. Returns `true` for the
    /// call that ended it.
    pub fn terminate(&self, reason: CloseReason) -> bool {
        match self.registry.upgrade() {
            Some(inner) => inner.remove(
                &self.recipient,
                &self.token,
                Some(self.state.generation),
                reason,
            ),
            None => self.state.close(reason),
        }
    }
}

impl fmt::Debug for Registration {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Registration")
            .field("recipient", &self.recipient)
            .field("token", &self.token)
            .field("generation", &self.state.generation)
            .field("state", &self.state())
            .finish()
    }
}
