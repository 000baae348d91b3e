//! The unit published to the broker: a target set (or broadcast marker) plus
//! an opaque payload.
//!
//! On the wire an envelope is a JSON object with the payload base64-encoded:
//!
//! ```json
//! {"origin":"node_…","recipients":["u1","u2"],"payload":"aGVsbG8="}
//! ```
//!
//! An absent or empty `recipients` list means broadcast.

use base64::engine::general_purpose::STANDARD;
use base64::Engine;
use bytes::Bytes;
use serde::{Deserialize, Serialize};

use crate::errors::CodecError;
use crate::ids::{NodeId, RecipientId};

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Envelope {
    origin: Option<NodeId>,
    recipients: Vec<RecipientId>,
    payload: Bytes,
}

#[derive(Serialize, Deserialize)]
struct WireEnvelope {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    origin: Option<NodeId>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    recipients: Vec<RecipientId>,
    payload: String,
}

impl Envelope {
    /// Envelope addressed to a specific set of recipients.
    ///
    /// An empty `recipients` list produces a broadcast envelope.
    pub fn targeted(recipients: Vec<RecipientId>, payload: Bytes) -> Self {
        Self {
            origin: None,
            recipients,
            payload,
        }
    }

    /// Envelope delivered to every connection on every node.
    pub fn broadcast(payload: Bytes) -> Self {
        Self {
            origin: None,
            recipients: Vec::new(),
            payload,
        }
    }

    /// Stamp the publishing node.
    #[must_use]
    pub fn with_origin(mut self, origin: NodeId) -> Self {
        self.origin = Some(origin);
        self
    }

    pub fn origin(&self) -> Option<&NodeId> {
        self.origin.as_ref()
    }

    pub fn recipients(&self) -> &[RecipientId] {
        &self.recipients
    }

    pub fn payload(&self) -> &Bytes {
        &self.payload
    }

    pub fn is_broadcast(&self) -> bool {
        self.recipients.is_empty()
    }

    pub fn encode(&self) -> Result<Bytes, CodecError> {
        let wire = WireEnvelope {
            origin: self.origin.clone(),
            recipients: self.recipients.clone(),
            payload: STANDARD.encode(&self.payload),
        };
        Ok(Bytes::from(serde_json::to_vec(&wire)?))
    }

    pub fn decode(raw: &[u8]) -> Result<Self, CodecError> {
        let wire: WireEnvelope = serde_json::from_slice(raw)?;
        let payload = STANDARD.decode(wire.payload.as_bytes())?;
        Ok(Self {
            origin: wire.origin,
            recipients: wire.recipients,
            payload: Bytes::from(payload),
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn empty_recipient_list_is_broadcast() {
        let env = Envelope::targeted(Vec::new(), Bytes::from_static(b"x"));
        assert!(env.is_broadcast());
        assert!(Envelope::broadcast(Bytes::new()).is_broadcast());
    }

    #[test]
    fn targeted_envelope_keeps_recipients() {
        let env = Envelope::targeted(
            vec!["u1".into(), "u2".into()],
            Bytes::from_static(b"hello"),
        )
        .with_origin(NodeId::from_raw("node_a"));
        let decoded = Envelope::decode(&env.encode().unwrap()).unwrap();
        assert_eq!(decoded, env);
        assert!(!decoded.is_broadcast());
        assert_eq!(decoded.origin().map(NodeId::as_str), Some("node_a"));
    }

    #[test]
    fn broadcast_omits_recipients_on_the_wire() {
        let raw = Envelope::broadcast(Bytes::from_static(b"hi")).encode().unwrap();
        let value: serde_json::Value = serde_json::from_slice(&raw).unwrap();
        assert!(value.get("recipients").is_none());
        assert!(value.get("origin").is_none());
        assert_eq!(value["payload"], "aGk=");
    }

    #[test]
    fn binary_payload_survives_encoding() {
        let payload = Bytes::from(vec![0u8, 159, 146, 150, 255]);
        let env = Envelope::broadcast(payload.clone());
        let decoded = Envelope::decode(&env.encode().unwrap()).unwrap();
        assert_eq!(decoded.payload(), &payload);
    }

    #[test]
    fn decode_accepts_missing_optional_fields() {
        let env = Envelope::decode(br#"{"payload":"eA=="}"#).unwrap();
        assert!(env.is_broadcast());
        assert!(env.origin().is_none());
        assert_eq!(env.payload(), &Bytes::from_static(b"x"));
    }

    #[test]
    fn decode_rejects_bad_base64() {
        let err = Envelope::decode(br#"{"payload":"@@@"}"#).unwrap_err();
        assert!(matches!(err, CodecError::Base64(_)));
    }

    #[test]
    fn decode_rejects_garbage() {
        let err = Envelope::decode(b"not json").unwrap_err();
        assert!(matches!(err, CodecError::Json(_)));
    }
}
