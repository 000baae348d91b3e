//! Settings structs. All sections deserialize with defaults, so a settings
//! file only needs the keys it overrides.

use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::errors::{Result, SettingsError};

/// Root settings for one switchboard node.
#[derive(Clone, Debug, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct SwitchboardSettings {
    pub server: ServerSettings,
    pub delivery: DeliverySettings,
    pub heartbeat: HeartbeatSettings,
    pub broker: BrokerSettings,
    pub logging: LoggingSettings,
}

impl SwitchboardSettings {
    /// Reject combinations the server cannot start with.
    pub fn validate(&self) -> Result<()> {
        if self.server.send_queue == 0 {
            return Err(SettingsError::invalid("server.sendQueue", "must be at least 1"));
        }
        if self.server.pong_timeout_secs == 0 {
            return Err(SettingsError::invalid(
                "server.pongTimeoutSecs",
                "must be at least 1",
            ));
        }
        if self.delivery.concurrency == 0 {
            return Err(SettingsError::invalid("delivery.concurrency", "must be at least 1"));
        }
        if self.delivery.send_timeout_ms == 0 {
            return Err(SettingsError::invalid("delivery.sendTimeoutMs", "must be at least 1"));
        }
        if self.heartbeat.enabled {
            let interval = self.heartbeat.interval_secs;
            if interval == 0 {
                return Err(SettingsError::invalid("heartbeat.intervalSecs", "must be at least 1"));
            }
            // The pong window must span more than one heartbeat round.
            if self.server.pong_timeout_secs <= interval {
                return Err(SettingsError::invalid(
                    "server.pongTimeoutSecs",
                    format!(
                        "must exceed heartbeat.intervalSecs ({interval}), got {}",
                        self.server.pong_timeout_secs
                    ),
                ));
            }
        }
        if self.broker.topic.trim().is_empty() {
            return Err(SettingsError::invalid("broker.topic", "must not be empty"));
        }
        if self.broker.kind == BrokerKind::Relay
            && self.broker.relay_url.is_none()
            && !self.broker.host_relay
        {
            return Err(SettingsError::invalid(
                "broker.relayUrl",
                "required when broker.kind is relay and this node does not host the relay",
            ));
        }
        Ok(())
    }
}

/// HTTP listener and per-connection transport settings.
#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct ServerSettings {
    /// Bind address.
    pub host: String,
    /// Bind port (`0` picks a free port).
    pub port: u16,
    /// Stable node identifier; generated at startup when absent.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub node_id: Option<String>,
    /// Outbound frame queue per connection.
    pub send_queue: usize,
    /// Close a WebSocket whose last pong is older than this at a keepalive.
    pub pong_timeout_secs: u64,
    /// Maximum lifetime of an SSE stream; `0` keeps streams open indefinitely.
    pub sse_max_lifetime_secs: u64,
}

impl Default for ServerSettings {
    fn default() -> Self {
        Self {
            host: "0.0.0.0".to_string(),
            port: 9300,
            node_id: None,
            send_queue: 256,
            pong_timeout_secs: 90,
            sse_max_lifetime_secs: 0,
        }
    }
}

impl ServerSettings {
    pub fn pong_timeout(&self) -> Duration {
        Duration::from_secs(self.pong_timeout_secs)
    }

    pub fn sse_max_lifetime(&self) -> Option<Duration> {
        (self.sse_max_lifetime_secs > 0).then(|| Duration::from_secs(self.sse_max_lifetime_secs))
    }
}

/// How the registry pushes frames to connections.
#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct DeliverySettings {
    /// A send slower than this counts as a failure and evicts the connection.
    pub send_timeout_ms: u64,
    /// Sends in flight per delivery call; `1` delivers sequentially.
    pub concurrency: usize,
}

impl Default for DeliverySettings {
    fn default() -> Self {
        Self {
            send_timeout_ms: 5_000,
            concurrency: 16,
        }
    }
}

impl DeliverySettings {
    pub fn send_timeout(&self) -> Duration {
        Duration::from_millis(self.send_timeout_ms)
    }
}

#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct HeartbeatSettings {
    pub enabled: bool,
    pub interval_secs: u64,
}

impl Default for HeartbeatSettings {
    fn default() -> Self {
        Self {
            enabled: true,
            interval_secs: 30,
        }
    }
}

impl HeartbeatSettings {
    pub fn interval(&self) -> Duration {
        Duration::from_secs(self.interval_secs)
    }
}

/// Which pub/sub backend carries envelopes between nodes.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum BrokerKind {
    /// Single-node deployment; publishes go nowhere.
    #[default]
    Local,
    /// WebSocket relay hub.
    Relay,
}

impl BrokerKind {
    pub fn parse(val: &str) -> Option<Self> {
        match val.to_lowercase().as_str() {
            "local" => Some(Self::Local),
            "relay" => Some(Self::Relay),
            _ => None,
        }
    }
}

#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct BrokerSettings {
    pub kind: BrokerKind,
    /// Topic shared by every node of the deployment.
    pub topic: String,
    /// Relay hub URL, e.g. `ws://10.0.0.5:9300/relay`.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub relay_url: Option<String>,
    /// Serve the relay hub endpoint on this node.
    pub host_relay: bool,
}

impl Default for BrokerSettings {
    fn default() -> Self {
        Self {
            kind: BrokerKind::Local,
            topic: "switchboard.fanout".to_string(),
            relay_url: None,
            host_relay: false,
        }
    }
}

#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct LoggingSettings {
    /// Default level; `RUST_LOG` takes precedence.
    pub level: String,
    /// Emit JSON lines instead of human-readable output.
    pub json: bool,
}

impl Default for LoggingSettings {
    fn default() -> Self {
        Self {
            level: "info".to_string(),
            json: false,
        }
    }
}
