//! Message envelope exchanged with connected clients.
//!
//! Every frame on a client connection carries exactly one JSON envelope:
//!
//! ```text
//! {"msgType": 1, "data": "..."}
//! ```
//!
//! `msgType` values:
//! - `1`: liveness ping
//! - `2`: liveness pong
//! - `3`: test / application payload
//!
//! Any other value decodes as [`MsgType::Other`] and is passed through
//! untouched, so peers can introduce new types without breaking the hub.

// Rust guideline compliant 2026-02

use bytes::Bytes;
use serde::{Deserialize, Serialize};

/// Message type discriminator.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(from = "u8", into = "u8")]
pub enum MsgType {
    /// Liveness check. The receiver answers with exactly one [`MsgType::Pong`].
    Ping,
    /// Liveness reply.
    Pong,
    /// Test / application payload.
    Test,
    /// Reserved for future types; carries the raw wire value.
    Other(u8),
}

impl From<u8> for MsgType {
    fn from(value: u8) -> Self {
        match value {
            1 => Self::Ping,
            2 => Self::Pong,
            3 => Self::Test,
            other => Self::Other(other),
        }
    }
}

impl From<MsgType> for u8 {
    fn from(value: MsgType) -> Self {
        match value {
            MsgType::Ping => 1,
            MsgType::Pong => 2,
            MsgType::Test => 3,
            MsgType::Other(other) => other,
        }
    }
}

/// A single message on the wire.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Envelope {
    /// Type discriminator.
    pub msg_type: MsgType,
    /// Opaque payload; empty when the sender omitted it.
    #[serde(default)]
    pub data: String,
}

impl Envelope {
    /// Create an envelope with the given type and payload.
    #[must_use]
    pub fn new(msg_type: MsgType, data: impl Into<String>) -> Self {
        Self {
            msg_type,
            data: data.into(),
        }
    }

    /// Liveness ping with no payload.
    #[must_use]
    pub fn ping() -> Self {
        Self::new(MsgType::Ping, String::new())
    }

    /// Liveness pong with no payload.
    #[must_use]
    pub fn pong() -> Self {
        Self::new(MsgType::Pong, String::new())
    }

    /// Test message carrying `data`.
    #[must_use]
    pub fn test(data: impl Into<String>) -> Self {
        Self::new(MsgType::Test, data)
    }

    /// Encode into a wire frame.
    ///
    /// The returned [`Bytes`] is reference counted, so one encoding can be
    /// handed to any number of outboxes without copying.
    #[must_use]
    pub fn encode(&self) -> Bytes {
        let payload = serde_json::to_vec(self).expect("envelope serialization cannot fail");
        Bytes::from(payload)
    }

    /// Decode a wire frame.
    ///
    /// # Errors
    ///
    /// Returns [`DecodeError`] if the frame is not a valid JSON envelope.
    pub fn decode(frame: &[u8]) -> Result<Self, DecodeError> {
        serde_json::from_slice(frame).map_err(DecodeError)
    }
}

/// A frame could not be decoded into an [`Envelope`].
///
/// Always recoverable: the frame is discarded and the connection stays up.
#[derive(Debug)]
pub struct DecodeError(serde_json::Error);

impl std::fmt::Display for DecodeError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "Malformed envelope: {}", self.0)
    }
}

impl std::error::Error for DecodeError {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        Some(&self.0)
    }
}
