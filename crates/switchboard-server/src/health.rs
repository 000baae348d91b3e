//! `/health` endpoint.

use std::time::Instant;

use chrono::{DateTime, Utc};
use serde::Serialize;

/// Health check response body.
#[derive(Debug, Clone, Serialize)]
pub struct HealthResponse {
    /// `"ok"`, or `"degraded"` when cross-node delivery is impaired.
    pub status: String,
    pub node_id: String,
    /// Broker backend name.
    pub broker: String,
    /// The broker link can carry publishes.
    pub broker_connected: bool,
    /// Envelopes from other nodes are being redelivered here.
    pub subscribed: bool,
    pub started_at: DateTime<Utc>,
    pub uptime_secs: u64,
    /// Live connections on this node.
    pub connections: usize,
    /// Distinct recipients with at least one connection here.
    pub recipients: usize,
}

impl HealthResponse {
    pub fn is_ok(&self) -> bool {
        self.broker_connected && self.subscribed
    }
}

/// Live node state fed into [`health_check`].
#[derive(Debug, Clone, Copy)]
pub struct NodeStatus {
    pub connections: usize,
    pub recipients: usize,
    pub broker_connected: bool,
    pub subscribed: bool,
}

pub fn health_check(
    node_id: &str,
    broker: &str,
    started_at: DateTime<Utc>,
    start_time: Instant,
    node: NodeStatus,
) -> HealthResponse {
    let healthy = node.broker_connected && node.subscribed;
    HealthResponse {
        status: if healthy { "ok" } else { "degraded" }.into(),
        node_id: node_id.to_string(),
        broker: broker.to_string(),
        broker_connected: node.broker_connected,
        subscribed: node.subscribed,
        started_at,
        uptime_secs: start_time.elapsed().as_secs(),
        connections: node.connections,
        recipients: node.recipients,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const IDLE: NodeStatus = NodeStatus {
        connections: 0,
        recipients: 0,
        broker_connected: true,
        subscribed: true,
    };

    #[test]
    fn status_is_ok() {
        let resp = health_check("node_a", "local", Utc::now(), Instant::now(), IDLE);
        assert_eq!(resp.status, "ok");
        assert!(resp.is_ok());
        assert_eq!(resp.node_id, "node_a");
        assert_eq!(resp.broker, "local");
    }

    #[test]
    fn lost_broker_link_is_degraded() {
        let node = NodeStatus {
            broker_connected: false,
            ..IDLE
        };
        let resp = health_check("n", "relay", Utc::now(), Instant::now(), node);
        assert_eq!(resp.status, "degraded");
        assert!(!resp.is_ok());
    }

    #[test]
    fn stopped_subscription_is_degraded() {
        let node = NodeStatus {
            subscribed: false,
            ..IDLE
        };
        let resp = health_check("n", "relay", Utc::now(), Instant::now(), node);
        assert_eq!(resp.status, "degraded");
    }

    #[test]
    fn uptime_increases() {
        let start = Instant::now()
            .checked_sub(std::time::Duration::from_secs(60))
            .unwrap();
        let resp = health_check("n", "local", Utc::now(), start, IDLE);
        assert!(resp.uptime_secs >= 59);
    }

    #[test]
    fn serialization() {
        let node = NodeStatus {
            connections: 3,
            recipients: 2,
            ..IDLE
        };
        let resp = health_check("n", "relay", Utc::now(), Instant::now(), node);
        let parsed = serde_json::to_value(&resp).unwrap();
        assert_eq!(parsed["status"], "ok");
        assert_eq!(parsed["connections"], 3);
        assert_eq!(parsed["recipients"], 2);
        assert_eq!(parsed["broker"], "relay");
        assert_eq!(parsed["broker_connected"], true);
        assert_eq!(parsed["subscribed"], true);
        assert!(parsed["started_at"].is_string());
        assert!(parsed["uptime_secs"].is_number());
    }
}
