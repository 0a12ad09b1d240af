//! Wire framing for the binary RPC protocol.
//!
//! Every frame is `[len: u32][type: u8][crc32: u32][payload]`. The payload is
//! a bincode envelope (see [`super::message`]); the checksum covers the
//! payload only.

use std::io;

use bytes::{Buf, BufMut, Bytes, BytesMut};
use tokio_util::codec::{Decoder, Encoder};

use crate::error::ProtocolError;

/// Maximum frame payload size accepted by default.
pub const MAX_FRAME_SIZE: usize = 4 * 1024 * 1024;

/// Frame header size: 4 bytes length + 1 byte type + 4 bytes checksum.
pub const FRAME_HEADER_SIZE: usize = 9;

/// Kind of frame on the wire.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum FrameType {
    /// Opens a new call; payload is an `OpenEnvelope`.
    Open = 0x01,
    /// A message on an open call; payload is a `DataEnvelope`.
    Data = 0x02,
    /// Ends one direction of a call; payload is a `CloseEnvelope`.
    Close = 0x03,
    /// Liveness probe, echoed back verbatim by the server.
    Ping = 0x04,
}

impl TryFrom<u8> for FrameType {
    type Error = ProtocolError;

    fn try_from(value: u8) -> std::result::Result<Self, ProtocolError> {
        match value {
            0x01 => Ok(Self::Open),
            0x02 => Ok(Self::Data),
            0x03 => Ok(Self::Close),
            0x04 => Ok(Self::Ping),
            _ => Err(ProtocolError::InvalidFrame(format!(
                "unknown frame type: {value:#x}"
            ))),
        }
    }
}

/// A single frame on the wire.
#[derive(Debug, Clone)]
pub struct Frame {
    /// Kind of this frame.
    pub frame_type: FrameType,
    /// Frame payload.
    pub payload: Bytes,
    /// Payload checksum; zero disables verification for this frame.
    pub checksum: u32,
}

impl Frame {
    /// Create a frame with a computed payload checksum.
    #[must_use]
    pub fn new(frame_type: FrameType, payload: Bytes) -> Self {
        let checksum = crc32fast::hash(&payload);
        Self {
            frame_type,
            payload,
            checksum,
        }
    }

    /// Verify the checksum, if one is present.
    ///
    /// # Errors
    ///
    /// Returns [`ProtocolError::ChecksumMismatch`] when the payload does not
    /// hash to the recorded value.
    pub fn verify_checksum(&self) -> std::result::Result<(), ProtocolError> {
        if self.checksum != 0 {
            let actual = crc32fast::hash(&self.payload);
            if self.checksum != actual {
                return Err(ProtocolError::ChecksumMismatch {
                    expected: self.checksum,
                    actual,
                });
            }
        }
        Ok(())
    }
}

/// Encoder/decoder for [`Frame`]s.
pub struct FrameCodec {
    max_frame_size: usize,
}

impl FrameCodec {
    /// Create a codec with the default size limit.
    #[must_use]
    pub const fn new() -> Self {
        Self {
            max_frame_size: MAX_FRAME_SIZE,
        }
    }

    /// Override the maximum payload size.
    #[must_use]
    pub const fn with_max_frame_size(mut self, size: usize) -> Self {
        self.max_frame_size = size;
        self
    }
}

impl Default for FrameCodec {
    fn default() -> Self {
        Self::new()
    }
}

impl Decoder for FrameCodec {
    type Item = Frame;
    type Error = io::Error;

    fn decode(
        &mut self,
        buf: &mut BytesMut,
    ) -> std::result::Result<Option<Self::Item>, Self::Error> {
        if buf.len() < FRAME_HEADER_SIZE {
            return Ok(None);
        }

        let mut header = &buf[..FRAME_HEADER_SIZE];
        let payload_len = header.get_u32() as usize;
        let frame_type_byte = header.get_u8();
        let checksum = header.get_u32();

        if payload_len > self.max_frame_size {
            return Err(io::Error::new(
                io::ErrorKind::InvalidData,
                ProtocolError::FrameTooLarge {
                    size: payload_len,
                    max: self.max_frame_size,
                },
            ));
        }

        let frame_len = FRAME_HEADER_SIZE + payload_len;
        if buf.len() < frame_len {
            buf.reserve(frame_len - buf.len());
            return Ok(None);
        }

        let frame_type = FrameType::try_from(frame_type_byte)
            .map_err(|e| io::Error::new(io::ErrorKind::InvalidData, e))?;

        buf.advance(FRAME_HEADER_SIZE);
        let payload = buf.split_to(payload_len).freeze();

        let frame = Frame {
            frame_type,
            payload,
            checksum,
        };
        frame
            .verify_checksum()
            .map_err(|e| io::Error::new(io::ErrorKind::InvalidData, e))?;

        Ok(Some(frame))
    }
}

impl Encoder<Frame> for FrameCodec {
    type Error = io::Error;

    fn encode(&mut self, frame: Frame, buf: &mut BytesMut) -> std::result::Result<(), Self::Error> {
        let payload_len = frame.payload.len();

        if payload_len > self.max_frame_size {
            return Err(io::Error::new(
                io::ErrorKind::InvalidData,
                ProtocolError::FrameTooLarge {
                    size: payload_len,
                    max: self.max_frame_size,
                },
            ));
        }

        buf.reserve(FRAME_HEADER_SIZE + payload_len);

        #[allow(clippy::cast_possible_truncation)]
        buf.put_u32(payload_len as u32);
        buf.put_u8(frame.frame_type as u8);
        buf.put_u32(frame.checksum);
        buf.put(frame.payload);

        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn frame_roundtrip() {
        let mut codec = FrameCodec::new();
        let mut buf = BytesMut::new();

        let frame = Frame::new(FrameType::Data, Bytes::from_static(b"payload bytes"));
        codec.encode(frame.clone(), &mut buf).unwrap();

        let decoded = codec.decode(&mut buf).unwrap().unwrap();
        assert_eq!(decoded.frame_type, frame.frame_type);
        assert_eq!(decoded.payload, frame.payload);
        assert_eq!(decoded.checksum, frame.checksum);
        assert!(buf.is_empty());
    }

    #[test]
    fn partial_frame_waits_for_more_data() {
        let mut codec = FrameCodec::new();
        let mut buf = BytesMut::new();

        buf.put_u32(64);
        buf.put_u8(FrameType::Open as u8);
        // Checksum and payload still missing.

        assert!(codec.decode(&mut buf).unwrap().is_none());
    }

    #[test]
    fn corrupt_checksum_is_rejected() {
        let mut codec = FrameCodec::new();
        let mut buf = BytesMut::new();

        let payload = b"tampered";
        #[allow(clippy::cast_possible_truncation)]
        buf.put_u32(payload.len() as u32);
        buf.put_u8(FrameType::Data as u8);
        buf.put_u32(0xdead_beef);
        buf.put_slice(payload);

        assert!(codec.decode(&mut buf).is_err());
    }

    #[test]
    fn oversized_frame_is_rejected() {
        let mut codec = FrameCodec::new().with_max_frame_size(8);
        let mut buf = BytesMut::new();

        buf.put_u32(9);
        buf.put_u8(FrameType::Data as u8);
        buf.put_u32(0);

        assert!(codec.decode(&mut buf).is_err());
    }
}
