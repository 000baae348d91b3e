//! WebSocket sessions: one registered connection per upgraded socket.

use std::sync::Arc;
use std::time::{Duration, Instant};

use axum::extract::ws::{Message, WebSocket, WebSocketUpgrade};
use axum::extract::{Query, State};
use axum::response::Response;
use bytes::Bytes;
use futures::{SinkExt, StreamExt};
use parking_lot::Mutex;
use switchboard_core::{ConnectionToken, Frame, RecipientId};
use tracing::{debug, info, instrument, warn};

use super::ConnectParams;
use crate::api::ApiError;
use crate::connection::ChannelConnection;
use crate::lifecycle;
use crate::server::AppState;

/// How long the writer gets to flush a close frame after the reader stops.
const WRITER_GRACE: Duration = Duration::from_secs(2);

/// GET /ws?recipient=&token=
pub async fn ws_handler(
    ws: WebSocketUpgrade,
    State(state): State<AppState>,
    Query(params): Query<ConnectParams>,
) -> Result<Response, ApiError> {
    let (recipient, token) = params.resolve()?;
    Ok(ws.on_upgrade(move |socket| run_ws_session(socket, state, recipient, token)))
}

/// Text frames carry UTF-8 payloads; anything else goes out as binary.
fn to_message(payload: Bytes) -> Message {
    match std::str::from_utf8(&payload) {
        Ok(text) => Message::Text(text.into()),
        Err(_) => Message::Binary(payload),
    }
}

/// Drive one socket from upgrade to eviction.
///
/// The writer maps frames onto the socket: `KeepAlive` becomes a Ping and
/// times the peer out when its last pong is too old, `Closing` becomes a
/// Close frame. The reader reports client close and read errors.
#[instrument(skip_all, fields(recipient = %recipient, token = %token))]
pub async fn run_ws_session(
    socket: WebSocket,
    state: AppState,
    recipient: RecipientId,
    token: ConnectionToken,
) {
    let (conn, mut frames) = ChannelConnection::new(state.config.send_queue);
    let closed = conn.closed();
    let registration = match lifecycle::open(&state.registry, recipient, token, Arc::new(conn)).await {
        Ok(registration) => registration,
        Err(e) => {
            warn!(error = %e, "websocket rejected");
            return;
        }
    };

    let (mut ws_tx, mut ws_rx) = socket.split();
    let last_seen = Arc::new(Mutex::new(Instant::now()));
    let pong_timeout = state.config.pong_timeout;

    let writer_registration = registration.clone();
    let writer_closed = closed.clone();
    let writer_seen = Arc::clone(&last_seen);
    let mut writer = tokio::spawn(async move {
        loop {
            let frame = tokio::select! {
                biased;
                frame = frames.recv() => frame,
                () = writer_closed.cancelled() => None,
            };
            let message = match frame {
                Some(Frame::Message(payload)) => to_message(payload),
                Some(Frame::KeepAlive) => {
                    let silent_for = writer_seen.lock().elapsed();
                    if silent_for > pong_timeout {
                        warn!(?silent_for, "no pong from client, closing");
                        let _ = writer_registration.timeout();
                        let _ = ws_tx.send(Message::Close(None)).await;
                        break;
                    }
                    Message::Ping(Bytes::new())
                }
                Some(Frame::Closing) | None => {
                    let _ = ws_tx.send(Message::Close(None)).await;
                    break;
                }
            };
            if let Err(e) = ws_tx.send(message).await {
                debug!(error = %e, "websocket write failed");
                let _ = writer_registration.error();
                break;
            }
        }
    });

    loop {
        tokio::select! {
            () = closed.cancelled() => break,
            msg = ws_rx.next() => match msg {
                Some(Ok(Message::Close(_))) | None => {
                    let _ = registration.close();
                    break;
                }
                Some(Ok(Message::Pong(_) | Message::Ping(_))) => {
                    *last_seen.lock() = Instant::now();
                }
                Some(Ok(Message::Text(_) | Message::Binary(_))) => {
                    *last_seen.lock() = Instant::now();
                    debug!("ignoring inbound application frame");
                }
                Some(Err(e)) => {
                    debug!(error = %e, "websocket read failed");
                    let _ = registration.error();
                    break;
                }
            }
        }
    }

    if tokio::time::timeout(WRITER_GRACE, &mut writer).await.is_err() {
        writer.abort();
    }
    info!(reason = ?registration.close_reason(), "websocket session ended");
}
