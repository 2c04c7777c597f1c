//! # Error Types
//!
//! Error handling for the chatwire protocol.
//!
//! Every failure in this crate falls into one of two tiers:
//!
//! - **Recoverable / payload-level**: the payload was bad (corrupt padding,
//!   malformed JSON, an application-defined error response) but the byte
//!   alignment with the peer is still trusted. The connection remains usable
//!   and the logical operation may be retried.
//! - **Fatal / transport-level**: the stream itself failed (I/O error,
//!   truncated frame, handshake failure). Byte alignment can no longer be
//!   guaranteed, so the connection must be closed and discarded; there is
//!   no attempt to resynchronize a corrupted stream.
//!
//! [`ProtocolError::is_fatal`] is the single classifier both sides use when
//! deciding between "surface the error" and "tear the connection down".

use std::io;
use thiserror::Error;

/// Error message constants to reduce allocations in error paths.
/// Static strings are borrowed, avoiding heap allocations for common error cases.
pub mod constants {
    /// Handshake errors
    pub const ERR_HANDSHAKE_KEY_TOO_LARGE: &str = "Peer handshake field exceeds size bound";
    pub const ERR_HANDSHAKE_BAD_KEY: &str = "Peer public key could not be decoded";
    pub const ERR_HANDSHAKE_WRAP_FAILED: &str = "Failed to wrap session key material";
    pub const ERR_HANDSHAKE_UNWRAP_FAILED: &str = "Failed to unwrap peer session key material";
    pub const ERR_HANDSHAKE_BAD_SECRET_LEN: &str = "Unwrapped key material has wrong length";

    /// Framing errors
    pub const ERR_BLOCK_TOO_LARGE: &str = "Block exceeds u16 length prefix";

    /// Dispatch errors
    pub const ERR_MISSING_REQUEST_FIELD: &str = "Request object has no string 'request' field";

    /// Wire error codes sent to the peer
    pub const CODE_MALFORMED_REQUEST: &str = "malformed-request";
    pub const CODE_UNSUPPORTED_REQUEST: &str = "request-not-supported";
    pub const CODE_INTERNAL_ERROR: &str = "internal-error";
}

/// The primary error type for all protocol operations.
#[derive(Error, Debug)]
pub enum ProtocolError {
    /// Transport-level stream failure. Fatal.
    #[error("I/O error: {0}")]
    Io(#[from] io::Error),

    /// The peer closed the stream, or the connection was closed locally. Fatal.
    #[error("Connection closed")]
    ConnectionClosed,

    /// Key exchange failed; the connection was never usable. Fatal.
    #[error("Handshake failed: {0}")]
    Handshake(String),

    /// A declared length prefix exceeded the caller's bound. The body was
    /// never read, so the stream is misaligned by construction. Fatal.
    #[error("Block of {declared} bytes exceeds limit of {limit}")]
    OversizedBlock { declared: usize, limit: usize },

    /// Final-block padding check failed during decryption. The frame was
    /// consumed whole, so byte alignment still holds. Recoverable.
    #[error("Block payload corrupted")]
    CorruptBlock,

    /// Payload decrypted cleanly but is not valid JSON. Recoverable.
    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    /// Payload decrypted cleanly but is not valid UTF-8. Recoverable.
    #[error("Payload is not valid UTF-8")]
    InvalidUtf8,

    /// Request object lacks a string `request` field. Recoverable.
    #[error("Malformed request: {0}")]
    MalformedRequest(String),

    /// No handler is registered under the request name. Recoverable.
    #[error("Request not supported: {0}")]
    UnsupportedRequest(String),

    /// An application-level error response from the peer. Recoverable.
    #[error("Remote error [{code}]: {message}")]
    Remote { code: String, message: String },

    /// A replacement connection could not be established (dial, handshake,
    /// or re-authentication rejected). Never retried automatically.
    #[error("Connection startup failed: {0}")]
    ConnectionStartup(String),

    /// A token could not be decoded from its textual form.
    #[error("Invalid auth token: {0}")]
    InvalidToken(String),

    #[error("Configuration error: {0}")]
    Config(String),

    #[error("{0}")]
    Custom(String),
}

impl ProtocolError {
    /// Whether this error mandates discarding the connection.
    ///
    /// Fatal errors mean the stream's byte alignment (or the connection's
    /// very existence) can no longer be trusted. Everything else leaves the
    /// connection usable.
    pub fn is_fatal(&self) -> bool {
        matches!(
            self,
            Self::Io(_)
                | Self::ConnectionClosed
                | Self::Handshake(_)
                | Self::OversizedBlock { .. }
                | Self::ConnectionStartup(_)
        )
    }
}

/// Type alias for Results using ProtocolError
pub type Result<T> = std::result::Result<T, ProtocolError>;
