use std::time::Duration;

/// Failure to hand a frame to one connection.
///
/// Every variant is recovered locally by evicting that single connection.
#[derive(Clone, Debug, PartialEq, Eq, thiserror::Error)]
pub enum SendError {
    #[error("connection closed")]
    Closed,
    #[error("send queue full")]
    Full,
    #[error("send timed out after {0:?}")]
    TimedOut(Duration),
    #[error("transport error: {0}")]
    Transport(String),
}

impl SendError {
    /// Short classification string for logging/metrics.
    pub fn error_kind(&self) -> &'static str {
        match self {
            Self::Closed => "closed",
            Self::Full => "full",
            Self::TimedOut(_) => "timed_out",
            Self::Transport(_) => "transport",
        }
    }
}

/// Envelope and relay frame encoding errors.
#[derive(Debug, thiserror::Error)]
pub enum CodecError {
    #[error("malformed json: {0}")]
    Json(#[from] serde_json::Error),
    #[error("malformed base64 payload: {0}")]
    Base64(#[from] base64::DecodeError),
}

/// Errors raised by a broker backend.
#[derive(Debug, thiserror::Error)]
pub enum BrokerError {
    #[error("cannot reach broker at {url}: {reason}")]
    Connect { url: String, reason: String },
    #[error("publish to {topic} failed: {reason}")]
    Publish { topic: String, reason: String },
    #[error("subscribe to {topic} failed: {reason}")]
    Subscribe { topic: String, reason: String },
    #[error("broker connection closed")]
    Closed,
    #[error(transparent)]
    Codec(#[from] CodecError),
}

impl BrokerError {
    pub fn error_kind(&self) -> &'static str {
        match self {
            Self::Connect { .. } => "connect",
            Self::Publish { .. } => "publish",
            Self::Subscribe { .. } => "subscribe",
            Self::Closed => "closed",
            Self::Codec(_) => "codec",
        }
    }
}
