//! WebSocket relay: a hub any node can host, the broker client that talks to
//! it over the network, and the in-process peer used by the hosting node.

mod client;
mod hub;
mod peer;
mod protocol;
mod subscribers;

pub use client::RelayBroker;
pub use hub::{PeerId, RelayHub};
pub use peer::HubPeer;
pub use protocol::{DataEncoding, RelayFrame};
