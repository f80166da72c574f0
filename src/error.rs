//! Error types
//!
//! Each layer defines its own error enum; [`Error`] aggregates them at the
//! crate boundary and [`Result`] is the crate-wide alias.

use thiserror::Error;

/// Crate-wide result alias
pub type Result<T> = std::result::Result<T, Error>;

/// Top-level error type
#[derive(Debug, Error)]
pub enum Error {
    #[error("i/o error: {0}")]
    Io(#[from] std::io::Error),

    #[error("handshake failed: {0}")]
    Handshake(#[from] HandshakeError),

    #[error("protocol violation: {0}")]
    Protocol(#[from] ProtocolError),

    #[error("message store error: {0}")]
    Store(#[from] StoreError),

    #[error("authentication failed: {0}")]
    Auth(#[from] AuthError),

    #[error("rpc error: {0}")]
    Rpc(#[from] RpcError),
}

/// Errors produced while parsing the HTTP Upgrade handshake
#[derive(Debug, Error)]
pub enum HandshakeError {
    /// Upgrade request carried no `Sec-WebSocket-Key` header
    #[error("missing Sec-WebSocket-Key header")]
    MissingKey,

    /// Request line or header block was not valid HTTP
    #[error("malformed upgrade request")]
    Malformed,
}

/// Wire-level frame codec errors
///
/// Any of these is a protocol violation that closes the connection.
#[derive(Debug, Error)]
pub enum ProtocolError {
    #[error("unknown opcode {0:#x}")]
    UnknownOpcode(u8),

    #[error("continuation frame without an open fragment")]
    UnexpectedContinuation,

    #[error("new data frame while a fragment is open")]
    FragmentInProgress,

    #[error("control frame must not be fragmented")]
    FragmentedControl,

    #[error("declared payload length {0} exceeds limit")]
    PayloadTooLarge(u64),

    #[error("unparsable message envelope: {0}")]
    BadEnvelope(#[source] serde_json::Error),
}

/// Message log / ordered-stream store errors
#[derive(Debug, Error)]
pub enum StoreError {
    #[error("stream store unavailable: {0}")]
    Backend(String),

    #[error("stored payload is not valid message json: {0}")]
    BadPayload(#[source] serde_json::Error),
}

/// Session-identity lookup failures (cookie -> identity)
#[derive(Debug, Error)]
pub enum AuthError {
    #[error("missing or empty sid cookie")]
    MissingCookie,

    #[error("session not found or expired")]
    InvalidSession,

    #[error("identity backend unavailable: {0}")]
    Backend(String),
}

/// Cross-node broadcast RPC errors
#[derive(Debug, Error)]
pub enum RpcError {
    #[error("i/o error: {0}")]
    Io(#[from] std::io::Error),

    #[error("malformed rpc payload: {0}")]
    BadPayload(#[source] serde_json::Error),

    #[error("rpc frame of {0} bytes exceeds limit")]
    OversizedFrame(usize),

    #[error("remote rejected request: {0}")]
    Rejected(String),

    #[error("retries exhausted after {0} attempts")]
    RetriesExhausted(u32),
}
