//! Server-Sent Event streams: one registered connection per response.

use std::convert::Infallible;
use std::sync::Arc;

use axum::extract::{Query, State};
use axum::response::sse::{Event, Sse};
use futures::stream::{self, BoxStream, StreamExt};
use switchboard_core::Frame;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tracing::debug;

use super::ConnectParams;
use crate::api::ApiError;
use crate::connection::ChannelConnection;
use crate::lifecycle;
use crate::registry::Registration;
use crate::server::AppState;

pub type EventStream = BoxStream<'static, Result<Event, Infallible>>;

/// GET /sse?recipient=&token=
pub async fn sse_handler(
    State(state): State<AppState>,
    Query(params): Query<ConnectParams>,
) -> Result<Sse<EventStream>, ApiError> {
    let (recipient, token) = params.resolve()?;
    let (conn, frames) = ChannelConnection::new(state.config.send_queue);
    let closed = conn.closed();
    let registration = lifecycle::open(&state.registry, recipient, token, Arc::new(conn)).await?;

    if let Some(lifetime) = state.config.sse_max_lifetime {
        let registration = registration.clone();
        let closed = closed.clone();
        drop(tokio::spawn(async move {
            tokio::select! {
                () = tokio::time::sleep(lifetime) => {
                    let _ = registration.timeout();
                }
                () = closed.cancelled() => {}
            }
        }));
    }

    Ok(Sse::new(event_stream(frames, closed, registration)))
}

struct StreamState {
    frames: mpsc::Receiver<Frame>,
    closed: CancellationToken,
    _guard: CloseOnDrop,
    done: bool,
}

/// Reports the client going away once axum drops the response stream.
struct CloseOnDrop(Registration);

impl Drop for CloseOnDrop {
    fn drop(&mut self) {
        if self.0.close() {
            debug!(recipient = %self.0.recipient(), token = %self.0.token(), "sse client went away");
        }
    }
}

fn event_stream(
    frames: mpsc::Receiver<Frame>,
    closed: CancellationToken,
    registration: Registration,
) -> EventStream {
    let state = StreamState {
        frames,
        closed,
        _guard: CloseOnDrop(registration),
        done: false,
    };
    stream::unfold(state, |mut st| async move {
        if st.done {
            return None;
        }
        let frame = tokio::select! {
            biased;
            frame = st.frames.recv() => frame,
            () = st.closed.cancelled() => None,
        };
        let event = match frame? {
            Frame::Message(payload) => Event::default().data(sse_data(&payload)),
            Frame::KeepAlive => Event::default().comment("keepalive"),
            Frame::Closing => {
                st.done = true;
                Event::default().event("close").data("")
            }
        };
        Some((Ok(event), st))
    })
    .boxed()
}

/// SSE data is line-oriented text: invalid UTF-8 is replaced and carriage
/// returns become line breaks.
fn sse_data(payload: &[u8]) -> String {
    String::from_utf8_lossy(payload)
        .replace("\r\n", "\n")
        .replace('\r', "\n")
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::registry::{CloseReason, ConnectionRegistry};
    use bytes::Bytes;
    use switchboard_core::Connection;

    #[test]
    fn sse_data_normalizes_line_breaks() {
        assert_eq!(sse_data(b"a\r\nb\rc"), "a\nb\nc");
        assert_eq!(sse_data(&[0x68, 0xff]), "h\u{fffd}");
    }

    #[tokio::test]
    async fn stream_ends_after_closing_frame() {
        let registry = ConnectionRegistry::default();
        let (conn, frames) = ChannelConnection::new(8);
        let closed = conn.closed();
        let conn = Arc::new(conn);
        let reg = registry.register("u".into(), "t".into(), conn.clone());
        let mut events = event_stream(frames, closed, reg.clone());

        conn.send(Frame::Message(Bytes::from_static(b"hi"))).await.unwrap();
        conn.send(Frame::Closing).await.unwrap();

        assert!(events.next().await.is_some());
        assert!(events.next().await.is_some());
        assert!(events.next().await.is_none());
        drop(events);
        assert_eq!(reg.close_reason(), Some(CloseReason::ClientClosed));
    }

    #[tokio::test]
    async fn dropping_stream_evicts_connection() {
        let registry = ConnectionRegistry::default();
        let (conn, frames) = ChannelConnection::new(8);
        let closed = conn.closed();
        let reg = registry.register("u".into(), "t".into(), Arc::new(conn));
        let events = event_stream(frames, closed, reg.clone());

        drop(events);

        assert!(!registry.contains(&"u".into(), &"t".into()));
        assert_eq!(reg.close_reason(), Some(CloseReason::ClientClosed));
    }

    #[tokio::test]
    async fn eviction_ends_stream() {
        let registry = ConnectionRegistry::default();
        let (conn, frames) = ChannelConnection::new(8);
        let closed = conn.closed();
        let reg = registry.register("u".into(), "t".into(), Arc::new(conn));
        let mut events = event_stream(frames, closed, reg.clone());

        assert!(registry.evict(&"u".into(), &"t".into()));

        assert!(events.next().await.is_none());
        assert_eq!(reg.close_reason(), Some(CloseReason::Disconnected));
    }
}
