//! Prometheus recorder and metric names shared across crates.

pub use metrics_exporter_prometheus::PrometheusHandle;
use metrics_exporter_prometheus::{BuildError, PrometheusBuilder};

/// Install the Prometheus metrics recorder (global).
pub fn install_recorder() -> Result<PrometheusHandle, BuildError> {
    let handle = PrometheusBuilder::new().install_recorder()?;
    tracing::info!("prometheus metrics recorder installed");
    Ok(handle)
}

/// Render Prometheus text format from a recorder handle.
pub fn render(handle: &PrometheusHandle) -> String {
    handle.render()
}

/// Connections registered (counter, labels: transport).
pub const CONNECTIONS_REGISTERED_TOTAL: &str = "switchboard_connections_registered_total";
/// Connections evicted (counter, labels: reason).
pub const CONNECTIONS_EVICTED_TOTAL: &str = "switchboard_connections_evicted_total";
/// Live connections on this node (gauge).
pub const CONNECTIONS_ACTIVE: &str = "switchboard_connections_active";
/// Connection lifetime in seconds (histogram).
pub const CONNECTION_DURATION_SECONDS: &str = "switchboard_connection_duration_seconds";
/// Frames accepted by a connection (counter, labels: scope).
pub const DELIVERIES_TOTAL: &str = "switchboard_deliveries_total";
/// Frames a connection failed to accept (counter, labels: kind).
pub const DELIVERY_FAILURES_TOTAL: &str = "switchboard_delivery_failures_total";
/// Envelopes published to the broker (counter, labels: scope).
pub const ENVELOPES_PUBLISHED_TOTAL: &str = "switchboard_envelopes_published_total";
/// Envelopes received from the broker (counter, labels: scope).
pub const ENVELOPES_RECEIVED_TOTAL: &str = "switchboard_envelopes_received_total";
/// Broker publish failures (counter, labels: kind).
pub const BROKER_ERRORS_TOTAL: &str = "switchboard_broker_errors_total";
/// Keepalive rounds completed (counter).
pub const HEARTBEAT_ROUNDS_TOTAL: &str = "switchboard_heartbeat_rounds_total";

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn render_from_local_recorder() {
        // Local recorder; no global install so tests stay independent.
        let handle = PrometheusBuilder::new().build_recorder().handle();
        let output = render(&handle);
        assert!(output.is_empty() || output.contains('#') || output.contains('\n'));
    }

    #[test]
    fn metric_names_are_prefixed_snake_case() {
        let names = [
            CONNECTIONS_REGISTERED_TOTAL,
            CONNECTIONS_EVICTED_TOTAL,
            CONNECTIONS_ACTIVE,
            CONNECTION_DURATION_SECONDS,
            DELIVERIES_TOTAL,
            DELIVERY_FAILURES_TOTAL,
            ENVELOPES_PUBLISHED_TOTAL,
            ENVELOPES_RECEIVED_TOTAL,
            BROKER_ERRORS_TOTAL,
            HEARTBEAT_ROUNDS_TOTAL,
        ];
        for name in names {
            assert!(name.starts_with("switchboard_"), "{name}");
            assert!(
                name.chars().all(|c| c.is_ascii_lowercase() || c == '_'),
                "metric name '{name}' must be snake_case"
            );
        }
    }
}
