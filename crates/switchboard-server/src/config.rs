//! Runtime configuration for one node, resolved from settings.

use std::time::Duration;

use switchboard_core::NodeId;
use switchboard_settings::SwitchboardSettings;

use crate::registry::DeliveryConfig;

#[derive(Clone, Debug)]
pub struct ServerConfig {
    pub host: String,
    /// `0` picks a free port.
    pub port: u16,
    pub node_id: NodeId,
    /// Outbound frame queue per connection.
    pub send_queue: usize,
    /// WebSocket peers whose last pong is older than this are timed out.
    pub pong_timeout: Duration,
    pub sse_max_lifetime: Option<Duration>,
    pub delivery: DeliveryConfig,
    /// `None` disables the heartbeat task.
    pub heartbeat_interval: Option<Duration>,
    /// Shared broker topic.
    pub topic: String,
    /// Serve the relay hub on `/relay`.
    pub host_relay: bool,
}

impl ServerConfig {
    pub fn from_settings(settings: &SwitchboardSettings) -> Self {
        let node_id = settings
            .server
            .node_id
            .as_deref()
            .map_or_else(NodeId::generate, NodeId::from_raw);
        Self {
            host: settings.server.host.clone(),
            port: settings.server.port,
            node_id,
            send_queue: settings.server.send_queue,
            pong_timeout: settings.server.pong_timeout(),
            sse_max_lifetime: settings.server.sse_max_lifetime(),
            delivery: DeliveryConfig::from(&settings.delivery),
            heartbeat_interval: settings
                .heartbeat
                .enabled
                .then(|| settings.heartbeat.interval()),
            topic: settings.broker.topic.clone(),
            host_relay: settings.broker.host_relay,
        }
    }

    pub fn bind_addr(&self) -> String {
        format!("{}:{}", self.host, self.port)
    }
}

/// Loopback on an ephemeral port; everything else from settings defaults.
impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            host: "127.0.0.1".into(),
            port: 0,
            ..Self::from_settings(&SwitchboardSettings::default())
        }
    }
}
