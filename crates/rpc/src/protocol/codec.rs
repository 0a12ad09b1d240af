//! Envelope serialization helpers.

use bytes::Bytes;
use serde::Serialize;
use serde::de::DeserializeOwned;

use crate::error::CodecError;

/// Encode an envelope for the wire.
///
/// # Errors
///
/// Returns [`CodecError::SerializationFailed`] when the value cannot be
/// encoded.
pub fn encode<T: Serialize>(value: &T) -> Result<Bytes, CodecError> {
    bincode::serialize(value)
        .map(Bytes::from)
        .map_err(|e| CodecError::SerializationFailed(e.to_string()))
}

/// Decode an envelope from frame payload bytes.
///
/// # Errors
///
/// Returns [`CodecError::DeserializationFailed`] when the bytes do not parse.
pub fn decode<T: DeserializeOwned>(bytes: &[u8]) -> Result<T, CodecError> {
    bincode::deserialize(bytes).map_err(|e| CodecError::DeserializationFailed(e.to_string()))
}
