//! # switchboard-server
//!
//! Live connection registry and cross-node fan-out over axum.
//!
//! - Registry: recipient → token → connection, with concurrent delivery and eviction
//! - Dispatcher: local delivery plus one broker publish per send
//! - Transports: `WebSocket` and Server-Sent Event connections, relay hub endpoint
//! - HTTP API: send, broadcast, disconnect, health, metrics
//! - Heartbeat sweeps and graceful shutdown via `CancellationToken`

#![deny(unsafe_code)]

pub mod api;
pub mod config;
pub mod connection;
pub mod dispatcher;
pub mod errors;
pub mod health;
pub mod heartbeat;
pub mod lifecycle;
pub mod registry;
pub mod server;
pub mod shutdown;
pub mod transport;

pub use config::ServerConfig;
pub use connection::ChannelConnection;
pub use dispatcher::{Dispatcher, SendReport};
pub use errors::{DispatchError, ServerError};
pub use registry::{CloseReason, ConnectionRegistry, ConnectionState, DeliveryConfig, Registration};
pub use server::{build_router, connect_broker, AppState, ServerHandle, SwitchboardServer};
pub use shutdown::ShutdownCoordinator;
