//! `/relay`: the relay hub endpoint, mounted when this node hosts the hub.

use axum::extract::ws::{Message, WebSocket, WebSocketUpgrade};
use axum::extract::State;
use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use futures::{SinkExt, StreamExt};
use switchboard_broker::RelayHub;
use tracing::{debug, info, warn};

use crate::server::AppState;

/// GET /relay
pub async fn relay_handler(ws: WebSocketUpgrade, State(state): State<AppState>) -> Response {
    match state.relay_hub {
        Some(hub) => ws.on_upgrade(move |socket| run_relay_peer(socket, hub)),
        None => StatusCode::NOT_FOUND.into_response(),
    }
}

/// Pump one relay peer: inbound text to the hub, hub output to the socket.
async fn run_relay_peer(socket: WebSocket, hub: RelayHub) {
    let (mut ws_tx, mut ws_rx) = socket.split();
    let (peer, mut outbound) = hub.join();
    info!(peer, "relay peer connected");

    loop {
        tokio::select! {
            out = outbound.recv() => {
                let Some(text) = out else { break };
                if ws_tx.send(Message::Text(text.into())).await.is_err() {
                    break;
                }
            }
            msg = ws_rx.next() => match msg {
                Some(Ok(Message::Text(text))) => {
                    if let Err(e) = hub.handle_frame(peer, text.as_str()) {
                        warn!(peer, error = %e, "bad relay frame");
                    }
                }
                Some(Ok(Message::Close(_))) | None => break,
                Some(Ok(_)) => {}
                Some(Err(e)) => {
                    debug!(peer, error = %e, "relay peer read failed");
                    break;
                }
            }
        }
    }

    hub.leave(peer);
    info!(peer, "relay peer disconnected");
}
