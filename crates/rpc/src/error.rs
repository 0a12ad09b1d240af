//! Error types for the RPC transport.

use std::io;

use http::StatusCode;
use thiserror::Error;

/// Result type alias for RPC operations.
pub type Result<T> = std::result::Result<T, Error>;

/// Main error type for RPC operations.
#[derive(Debug, Error)]
pub enum Error {
    /// Connection-related errors.
    #[error("connection error: {0}")]
    Connection(#[from] ConnectionError),

    /// Protocol-level errors.
    #[error("protocol error: {0}")]
    Protocol(#[from] ProtocolError),

    /// Envelope encode/decode errors.
    #[error("codec error: {0}")]
    Codec(#[from] CodecError),

    /// TLS configuration errors.
    #[error("tls error: {0}")]
    Tls(#[from] TlsError),

    /// Connection pool errors (capacity, teardown).
    #[error("pool error: {0}")]
    Pool(#[from] ferrule_pool::Error),

    /// The shared rate limiter refused the call.
    #[error("rate: limit exceeded")]
    RateLimited,

    /// No credentials were supplied for an authenticated call.
    #[error("missing credentials")]
    MissingCredentials,

    /// Supplied credentials failed validation.
    #[error("invalid credentials")]
    InvalidCredentials,

    /// A contained fault (panic) or other unexpected internal failure.
    #[error("internal error: {0}")]
    Internal(String),

    /// The remote side reported the call failed.
    #[error("remote error: {code}: {message}")]
    Remote {
        /// Machine-readable error code.
        code: String,
        /// Human-readable message from the remote side.
        message: String,
    },

    /// The call's context was cancelled.
    #[error("call cancelled")]
    Cancelled,

    /// The client has been closed.
    #[error("client is closed")]
    ClientClosed,

    /// The server was started more than once or after being stopped.
    #[error("server already started or stopped")]
    AlreadyStarted,

    /// No service is registered for the requested name.
    #[error("unknown service: {0}")]
    UnknownService(String),

    /// Generic I/O error, surfaced unmodified.
    #[error("I/O error: {0}")]
    Io(#[from] io::Error),
}

impl Error {
    /// Machine-readable code used in HTTP/WebSocket error bodies.
    #[must_use]
    pub const fn code(&self) -> &'static str {
        match self {
            Self::Connection(_) => "CONNECTION_ERROR",
            Self::Protocol(ProtocolError::UnsupportedContentType(_)) => "UNSUPPORTED_CONTENT_TYPE",
            Self::Protocol(ProtocolError::InvalidConnectionType(_)) => "INVALID_CONNECTION_TYPE",
            Self::Protocol(ProtocolError::InvalidMethod(_)) | Self::UnknownService(_) => {
                "NOT_FOUND"
            }
            Self::Protocol(_) | Self::Codec(_) => "PROTOCOL_ERROR",
            Self::Tls(_) => "TLS_ERROR",
            Self::Pool(_) => "POOL_ERROR",
            Self::RateLimited => "RATE_LIMITED",
            Self::MissingCredentials => "MISSING_CREDENTIALS",
            Self::InvalidCredentials => "INVALID_CREDENTIALS",
            Self::Remote { .. } => "REMOTE_ERROR",
            Self::Cancelled => "CANCELLED",
            Self::ClientClosed | Self::AlreadyStarted => "UNAVAILABLE",
            Self::Internal(_) => "INTERNAL_ERROR",
            Self::Io(_) => "TRANSPORT_ERROR",
        }
    }

    /// HTTP status attached at the bridge/proxy boundary.
    #[must_use]
    pub const fn http_status(&self) -> StatusCode {
        match self {
            Self::Protocol(ProtocolError::UnsupportedContentType(_)) => {
                StatusCode::UNSUPPORTED_MEDIA_TYPE
            }
            Self::Protocol(ProtocolError::InvalidConnectionType(_)) => StatusCode::BAD_REQUEST,
            Self::Protocol(ProtocolError::InvalidMethod(_)) | Self::UnknownService(_) => {
                StatusCode::NOT_FOUND
            }
            Self::MissingCredentials | Self::InvalidCredentials => StatusCode::UNAUTHORIZED,
            Self::RateLimited => StatusCode::TOO_MANY_REQUESTS,
            _ => StatusCode::INTERNAL_SERVER_ERROR,
        }
    }
}

/// Connection-specific errors.
#[derive(Debug, Error)]
pub enum ConnectionError {
    /// Failed to establish a connection.
    #[error("failed to connect to {addr}: {source}")]
    ConnectFailed {
        /// The address we tried to connect to.
        addr: String,
        /// The underlying error.
        #[source]
        source: io::Error,
    },

    /// Connection closed while a call was still in flight.
    #[error("connection closed")]
    Closed,
}

/// Protocol-level errors.
#[derive(Debug, Error)]
pub enum ProtocolError {
    /// Invalid frame received.
    #[error("invalid frame: {0}")]
    InvalidFrame(String),

    /// Frame exceeds the configured size limit.
    #[error("frame size {size} exceeds maximum {max}")]
    FrameTooLarge {
        /// Size of the offending frame.
        size: usize,
        /// Maximum allowed size.
        max: usize,
    },

    /// Frame checksum verification failed.
    #[error("checksum mismatch: expected {expected:08x}, got {actual:08x}")]
    ChecksumMismatch {
        /// Expected checksum.
        expected: u32,
        /// Actual checksum.
        actual: u32,
    },

    /// The request carried a content type no encoding maps to.
    #[error("unsupported content type: {0}")]
    UnsupportedContentType(String),

    /// The connection is not of the kind the operation requires.
    #[error("invalid connection type: {0}")]
    InvalidConnectionType(String),

    /// Method path does not follow `/package.Service/Method`.
    #[error("invalid method path: {0}")]
    InvalidMethod(String),

    /// A call ended without the expected response message.
    #[error("call closed without a response")]
    MissingResponse,

    /// Message sent on a stream whose send side was already closed.
    #[error("send on closed stream")]
    SendAfterClose,
}

/// Envelope encode/decode errors.
#[derive(Debug, Error)]
pub enum CodecError {
    /// Serialization failed.
    #[error("failed to serialize: {0}")]
    SerializationFailed(String),

    /// Deserialization failed.
    #[error("failed to deserialize: {0}")]
    DeserializationFailed(String),
}

/// TLS configuration errors.
#[derive(Debug, Error)]
pub enum TlsError {
    /// Certificate or key material could not be read.
    #[error("failed to read tls material: {0}")]
    ReadMaterial(String),

    /// PEM contents did not parse to the expected items.
    #[error("invalid pem material: {0}")]
    InvalidPem(String),

    /// A CA certificate could not be parsed or appended to the pool.
    #[error("invalid ca certificate: {0}")]
    InvalidCa(String),

    /// The expected server name is not a valid DNS name or IP address.
    #[error("invalid server name: {0}")]
    InvalidServerName(String),

    /// rustls rejected the assembled configuration.
    #[error("tls configuration rejected: {0}")]
    Build(String),
}
