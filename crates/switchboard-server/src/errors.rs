use switchboard_core::BrokerError;
use switchboard_settings::SettingsError;

/// Errors surfaced by the fan-out dispatcher.
#[derive(Debug, thiserror::Error)]
pub enum DispatchError {
    /// Publishing to the broker failed. Local deliveries already made stand.
    #[error("broker publish failed: {0}")]
    Broker(#[from] BrokerError),
    /// The startup subscription could not be established.
    #[error("cannot subscribe to {topic}: {source}")]
    Subscribe {
        topic: String,
        #[source]
        source: BrokerError,
    },
}

impl DispatchError {
    pub fn error_kind(&self) -> &'static str {
        match self {
            Self::Broker(e) => e.error_kind(),
            Self::Subscribe { .. } => "subscribe",
        }
    }
}

/// Errors that stop a node from starting.
#[derive(Debug, thiserror::Error)]
pub enum ServerError {
    #[error("invalid settings: {0}")]
    Settings(#[from] SettingsError),
    #[error("cannot bind {addr}: {source}")]
    Bind {
        addr: String,
        #[source]
        source: std::io::Error,
    },
    #[error("broker unavailable: {0}")]
    Broker(#[from] BrokerError),
    #[error(transparent)]
    Dispatch(#[from] DispatchError),
}
