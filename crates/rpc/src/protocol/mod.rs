//! Wire protocol: framing, envelopes, and the protocol-selection header.

pub mod codec;
pub mod framing;
pub mod message;

pub use framing::{Frame, FrameCodec, FrameType, MAX_FRAME_SIZE};
pub use message::{CloseEnvelope, DataEnvelope, Encoding, ErrorInfo, OpenEnvelope};

/// Header bytes sent by HTTP-aware clients immediately after connecting.
///
/// The server's demultiplexer routes connections that lead with this
/// sequence to the native RPC path; everything else is treated as HTTP.
pub const PROTOCOL_HEADER: [u8; 4] = *b"FRPC";
