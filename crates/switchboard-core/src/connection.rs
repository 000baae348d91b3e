use async_trait::async_trait;
use bytes::Bytes;

use crate::errors::SendError;

/// A unit handed to a connection by the registry.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum Frame {
    /// Application payload.
    Message(Bytes),
    /// No-op frame used to test writability and defeat idle timeouts.
    KeepAlive,
    /// Best-effort notice that the server is about to drop the connection.
    Closing,
}

impl Frame {
    pub fn kind(&self) -> &'static str {
        match self {
            Self::Message(_) => "message",
            Self::KeepAlive => "keepalive",
            Self::Closing => "closing",
        }
    }
}

/// One channel to one client, supplied by a transport adapter.
///
/// Termination signals (client close, transport error, idle timeout) flow the
/// other way, through the registration handle the registry returns.
#[async_trait]
pub trait Connection: Send + Sync {
    /// Hand a frame to the transport.
    async fn send(&self, frame: Frame) -> Result<(), SendError>;

    /// Release transport resources. Called exactly once, after eviction.
    fn close(&self) {}
}
