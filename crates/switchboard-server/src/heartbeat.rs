//! Periodic keepalive round over every registered connection.

use std::time::Duration;

use metrics::counter;
use switchboard_telemetry::metrics as names;
use tokio::time;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info};

use crate::registry::ConnectionRegistry;

/// Send a keepalive to every connection each `interval` until cancelled.
///
/// Connections whose keepalive fails are evicted by the registry. Returns
/// the number of completed rounds.
pub async fn run_heartbeat(
    registry: ConnectionRegistry,
    interval: Duration,
    cancel: CancellationToken,
) -> u64 {
    let mut ticker = time::interval(interval);
    ticker.set_missed_tick_behavior(time::MissedTickBehavior::Delay);
    // Skip the immediate first tick
    let _ = ticker.tick().await;
    let mut rounds = 0;

    loop {
        tokio::select! {
            _ = ticker.tick() => {
                let report = registry.keepalive_all().await;
                rounds += 1;
                counter!(names::HEARTBEAT_ROUNDS_TOTAL).increment(1);
                if report.evicted > 0 {
                    info!(pinged = report.pinged, evicted = report.evicted, "heartbeat evicted connections");
                } else {
                    debug!(pinged = report.pinged, "heartbeat round");
                }
            }
            () = cancel.cancelled() => {
                debug!(rounds, "heartbeat stopped");
                return rounds;
            }
        }
    }
}
