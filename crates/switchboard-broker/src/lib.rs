//! Broker backends for cross-node envelope fan-out.
//!
//! - [`NoopBroker`]: single-node deployments; publishes go nowhere.
//! - [`MemoryBroker`]: in-process hub shared by several dispatchers.
//! - [`RelayBroker`]: client of a WebSocket relay hub ([`RelayHub`]) that
//!   forwards every publish to every subscriber of the topic.
//! - [`HubPeer`]: the hosting node's own attachment to its [`RelayHub`].

pub mod local;
pub mod memory;
pub mod relay;

pub use local::NoopBroker;
pub use memory::MemoryBroker;
pub use relay::{DataEncoding, HubPeer, RelayBroker, RelayFrame, RelayHub};
