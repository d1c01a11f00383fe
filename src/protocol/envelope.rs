//! Control conduit envelopes.
//!
//! # Format
//!
//! ```json
//! { "type": "push",    "id": 1, "payload": "aGVsbG8=" }
//! { "type": "reply",   "id": 1, "payload": "d29ybGQ=" }
//! { "type": "abandon", "id": 1 }
//! ```
//!
//! Payloads are opaque bytes carried as standard base64.

// ============================================================================
// Imports
// ============================================================================

use serde::{Deserialize, Serialize};

use crate::error::{Error, Result};
use crate::identifiers::RequestId;

// ============================================================================
// Envelope
// ============================================================================

/// One message on the control conduit.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "lowercase")]
pub enum Envelope {
    /// Host → runtime: a request awaiting one reply.
    Push {
        /// Correlation id.
        id: RequestId,
        /// Request body.
        #[serde(with = "base64_payload")]
        payload: Vec<u8>,
    },

    /// Runtime → host: the answer to a push.
    Reply {
        /// Id of the push being answered.
        id: RequestId,
        /// Reply body.
        #[serde(with = "base64_payload")]
        payload: Vec<u8>,
    },

    /// Host → runtime: the caller stopped waiting for a push.
    Abandon {
        /// Id of the abandoned push.
        id: RequestId,
    },
}

impl Envelope {
    /// Returns the correlation id.
    #[inline]
    #[must_use]
    pub fn id(&self) -> RequestId {
        match self {
            Self::Push { id, .. } | Self::Reply { id, .. } | Self::Abandon { id } => *id,
        }
    }

    /// Returns the wire name of the variant.
    #[must_use]
    pub fn kind(&self) -> &'static str {
        match self {
            Self::Push { .. } => "push",
            Self::Reply { .. } => "reply",
            Self::Abandon { .. } => "abandon",
        }
    }

    /// Serializes to wire bytes.
    ///
    /// # Errors
    ///
    /// Returns [`Error::Json`] if serialization fails.
    pub fn encode(&self) -> Result<Vec<u8>> {
        Ok(serde_json::to_vec(self)?)
    }

    /// Parses wire bytes.
    ///
    /// # Errors
    ///
    /// Returns [`Error::Protocol`] if `bytes` is not a valid envelope.
    pub fn decode(bytes: &[u8]) -> Result<Self> {
        serde_json::from_slice(bytes)
            .map_err(|e| Error::protocol(format!("Malformed envelope: {e}")))
    }
}

// ============================================================================
// Payload Encoding
// ============================================================================

mod base64_payload {
    use base64::Engine as _;
    use base64::engine::general_purpose::STANDARD;
    use serde::{Deserialize, Deserializer, Serializer, de};

    pub fn serialize<S: Serializer>(bytes: &[u8], serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_str(&STANDARD.encode(bytes))
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(deserializer: D) -> Result<Vec<u8>, D::Error> {
        let text = String::deserialize(deserializer)?;
        STANDARD.decode(text).map_err(de::Error::custom)
    }
}

// ============================================================================
// Tests
// ============================================================================

#[cfg(test)]
mod tests {
    use super::*;

    use serde_json::{Value, json};

    #[test]
    fn test_push_wire_format() {
        let envelope = Envelope::Push {
            id: RequestId::new(3),
            payload: b"hello".to_vec(),
        };
        let value: Value = serde_json::from_slice(&envelope.encode().unwrap()).unwrap();
        assert_eq!(
            value,
            json!({ "type": "push", "id": 3, "payload": "aGVsbG8=" })
        );
    }

    #[test]
    fn test_abandon_has_no_payload() {
        let bytes = br#"{"type":"abandon","id":9}"#;
        let envelope = Envelope::decode(bytes).unwrap();
        assert_eq!(envelope, Envelope::Abandon { id: RequestId::new(9) });
        assert_eq!(envelope.kind(), "abandon");
    }

    #[test]
    fn test_reply_decodes_payload() {
        let bytes = br#"{"type":"reply","id":2,"payload":"d29ybGQ="}"#;
        let Envelope::Reply { id, payload } = Envelope::decode(bytes).unwrap() else {
            panic!("expected reply");
        };
        assert_eq!(id.as_u64(), 2);
        assert_eq!(payload, b"world");
    }

    #[test]
    fn test_unknown_type_is_protocol_error() {
        let err = Envelope::decode(br#"{"type":"ping","id":1}"#).unwrap_err();
        assert!(matches!(err, Error::Protocol { .. }));
    }

    #[test]
    fn test_invalid_base64_is_protocol_error() {
        let err = Envelope::decode(br#"{"type":"reply","id":1,"payload":"@@"}"#).unwrap_err();
        assert!(matches!(err, Error::Protocol { .. }));
    }

    #[test]
    fn test_non_json_is_protocol_error() {
        assert!(Envelope::decode(&[0xff, 0x00]).is_err());
    }
}
