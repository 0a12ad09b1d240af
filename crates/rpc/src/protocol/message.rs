//! Envelopes carried inside frames, and the payload encoding tag.

use std::collections::HashMap;

use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// Payload encoding negotiated per call.
///
/// The transport never interprets payload bytes; the tag exists so both ends
/// and the HTTP/WebSocket boundary agree on how payloads were produced.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum Encoding {
    /// Compact binary messages (`application/protobuf`).
    Protobuf,
    /// JSON fallback (`application/json`).
    Json,
}

impl Encoding {
    /// Content type announced for this encoding.
    #[must_use]
    pub const fn content_type(self) -> &'static str {
        match self {
            Self::Protobuf => "application/protobuf",
            Self::Json => "application/json",
        }
    }

    /// Map a `Content-Type` header value to an encoding, ignoring any
    /// parameters after `;`.
    #[must_use]
    pub fn from_content_type(value: &str) -> Option<Self> {
        let mime = value.split(';').next().unwrap_or_default().trim();
        match mime {
            "application/protobuf" => Some(Self::Protobuf),
            "application/json" => Some(Self::Json),
            _ => None,
        }
    }
}

/// Opens a new call on a connection.
#[derive(Debug, Serialize, Deserialize)]
pub struct OpenEnvelope {
    /// Call id, unique per connection.
    pub id: Uuid,
    /// Full method path, `/package.Service/Method`.
    pub method: String,
    /// Payload encoding for every message of this call.
    pub encoding: Encoding,
    /// Caller metadata propagated to the handler.
    pub metadata: HashMap<String, String>,
}

/// A message on an open call.
#[derive(Debug, Serialize, Deserialize)]
pub struct DataEnvelope {
    /// Call this message belongs to.
    pub id: Uuid,
    /// Opaque message payload.
    pub payload: Vec<u8>,
}

/// Ends one direction of a call.
///
/// Sent by the client to signal it is done sending, and by the server to end
/// the call; a populated `error` reports the call as failed.
#[derive(Debug, Serialize, Deserialize)]
pub struct CloseEnvelope {
    /// Call being closed.
    pub id: Uuid,
    /// Failure report, if the call did not complete normally.
    pub error: Option<ErrorInfo>,
}

/// Error information attached to a failed call.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ErrorInfo {
    /// Machine-readable error code.
    pub code: String,
    /// Human-readable error message.
    pub message: String,
}
