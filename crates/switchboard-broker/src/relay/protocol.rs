use base64::engine::general_purpose::STANDARD;
use base64::Engine;
use bytes::Bytes;
use serde::{Deserialize, Serialize};
use switchboard_core::CodecError;

/// How `data` carries the published bytes.
///
/// UTF-8 frames (every encoded envelope) travel as plain text; anything else
/// is base64 with `"enc":"base64"`.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum DataEncoding {
    #[default]
    Utf8,
    Base64,
}

impl DataEncoding {
    fn is_utf8(&self) -> bool {
        *self == Self::Utf8
    }
}

/// One relay protocol message, carried as a JSON text frame.
///
/// Peers send `sub`, `unsub` and `pub`; the hub sends `msg`.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "op", rename_all = "lowercase")]
pub enum RelayFrame {
    Sub {
        topic: String,
    },
    Unsub {
        topic: String,
    },
    Pub {
        topic: String,
        data: String,
        #[serde(default, skip_serializing_if = "DataEncoding::is_utf8")]
        enc: DataEncoding,
    },
    Msg {
        topic: String,
        data: String,
        #[serde(default, skip_serializing_if = "DataEncoding::is_utf8")]
        enc: DataEncoding,
    },
}

impl RelayFrame {
    pub fn publish(topic: &str, frame: &[u8]) -> Self {
        let (data, enc) = match std::str::from_utf8(frame) {
            Ok(text) => (text.to_owned(), DataEncoding::Utf8),
            Err(_) => (STANDARD.encode(frame), DataEncoding::Base64),
        };
        Self::Pub {
            topic: topic.to_string(),
            data,
            enc,
        }
    }

    pub fn message(topic: &str, data: String, enc: DataEncoding) -> Self {
        Self::Msg {
            topic: topic.to_string(),
            data,
            enc,
        }
    }

    pub fn unsubscribe(topic: &str) -> Self {
        Self::Unsub {
            topic: topic.to_string(),
        }
    }

    pub fn encode(&self) -> Result<String, CodecError> {
        Ok(serde_json::to_string(self)?)
    }

    pub fn decode(text: &str) -> Result<Self, CodecError> {
        Ok(serde_json::from_str(text)?)
    }

    /// Decode the payload of a `pub` or `msg` frame.
    pub fn payload(&self) -> Result<Option<Bytes>, CodecError> {
        match self {
            Self::Pub { data, enc, .. } | Self::Msg { data, enc, .. } => Ok(Some(match enc {
                DataEncoding::Utf8 => Bytes::copy_from_slice(data.as_bytes()),
                DataEncoding::Base64 => Bytes::from(STANDARD.decode(data.as_bytes())?),
            })),
            Self::Sub { .. } | Self::Unsub { .. } => Ok(None),
        }
    }
}
