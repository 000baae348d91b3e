//! Connect and disconnect as transports see them.

use std::sync::Arc;

use switchboard_core::{Connection, ConnectionToken, Frame, RecipientId, SendError};
use tracing::{debug, info};

use crate::registry::{CloseReason, ConnectionRegistry, Registration};

/// Register `conn` and confirm it is writable with one keepalive.
///
/// A connection that cannot take the first frame is evicted at once rather
/// than left half-open.
pub async fn open(
    registry: &ConnectionRegistry,
    recipient: RecipientId,
    token: ConnectionToken,
    conn: Arc<dyn Connection>,
) -> Result<Registration, SendError> {
    let registration = registry.register(recipient, token, Arc::clone(&conn));
    let timeout = registry.delivery().send_timeout;
    let sent = match tokio::time::timeout(timeout, conn.send(Frame::KeepAlive)).await {
        Ok(result) => result,
        Err(_) => Err(SendError::TimedOut(timeout)),
    };
    match sent {
        Ok(()) => {
            let _ = registration.mark_open();
            info!(
                recipient = %registration.recipient(),
                token = %registration.token(),
                "connection opened"
            );
            Ok(registration)
        }
        Err(e) => {
            let _ = registration.terminate(CloseReason::TransportError);
            Err(e)
        }
    }
}

/// Tell the client it is being dropped, then evict it.
///
/// The closing frame is best effort. Unknown pairs succeed without effect;
/// returns whether a connection was removed. A client that reconnects under
/// the same token while the closing frame is in flight keeps its new
/// connection.
pub async fn disconnect(
    registry: &ConnectionRegistry,
    recipient: &RecipientId,
    token: &ConnectionToken,
) -> bool {
    let Some((conn, generation)) = registry.connection(recipient, token) else {
        debug!(recipient = %recipient, token = %token, "disconnect for unknown connection");
        return false;
    };
    let timeout = registry.delivery().send_timeout;
    if let Ok(Err(e)) = tokio::time::timeout(timeout, conn.send(Frame::Closing)).await {
        debug!(recipient = %recipient, token = %token, error = %e, "closing frame not sent");
    }
    let removed = registry.evict_generation(recipient, token, generation);
    if !removed {
        debug!(recipient = %recipient, token = %token, "connection replaced during disconnect");
    }
    removed
}
