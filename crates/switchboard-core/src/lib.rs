//! Shared vocabulary for the switchboard crates: identifiers, frames,
//! envelopes, and the two seams every backend plugs into (`Connection` and
//! `Broker`).

pub mod broker;
pub mod connection;
pub mod envelope;
pub mod errors;
pub mod ids;

pub use broker::{Broker, Subscription};
pub use connection::{Connection, Frame};
pub use envelope::Envelope;
pub use errors::{BrokerError, CodecError, SendError};
pub use ids::{ConnectionToken, NodeId, RecipientId};
