//! Channel-backed [`Connection`] shared by the WebSocket and SSE transports.

use async_trait::async_trait;
use switchboard_core::{Connection, Frame, SendError};
use tokio::sync::mpsc;
use tokio::sync::mpsc::error::TrySendError;
use tokio_util::sync::CancellationToken;

/// Queues frames for a transport task to write.
///
/// `send` never waits: a full queue means the client is not keeping up, and
/// the registry drops it instead of throttling delivery.
pub struct ChannelConnection {
    tx: mpsc::Sender<Frame>,
    closed: CancellationToken,
}

impl ChannelConnection {
    pub fn new(queue: usize) -> (Self, mpsc::Receiver<Frame>) {
        let (tx, rx) = mpsc::channel(queue.max(1));
        let conn = Self {
            tx,
            closed: CancellationToken::new(),
        };
        (conn, rx)
    }

    /// Cancelled once the registry has let go of this connection.
    pub fn closed(&self) -> CancellationToken {
        self.closed.clone()
    }
}

#[async_trait]
impl Connection for ChannelConnection {
    async fn send(&self, frame: Frame) -> Result<(), SendError> {
        if self.closed.is_cancelled() {
            return Err(SendError::Closed);
        }
        match self.tx.try_send(frame) {
            Ok(()) => Ok(()),
            Err(TrySendError::Full(_)) => Err(SendError::Full),
            Err(TrySendError::Closed(_)) => Err(SendError::Closed),
        }
    }

    fn close(&self) {
        self.closed.cancel();
    }
}
