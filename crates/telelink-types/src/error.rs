//! Error taxonomy for the telelink transport.

use std::fmt;
use std::time::Duration;
use thiserror::Error;

/// Errors raised by the scalar codec.
///
/// Every variant is checked before any byte is written or consumed, so a
/// failed call leaves the buffer and cursor untouched.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum CodecError {
    /// The destination cannot hold the value.
    #[error("Buffer too small: need {needed} bytes, {available} available")]
    BufferTooSmall { needed: usize, available: usize },

    /// The source does not contain enough bytes.
    #[error("Buffer underflow: need {needed} bytes, {available} remaining")]
    BufferUnderflow { needed: usize, available: usize },

    /// An auto-length string has no NUL terminator.
    #[error("String is not NUL-terminated")]
    MissingTerminator,

    /// A string field holds bytes that are not UTF-8.
    #[error("String field is not valid UTF-8")]
    InvalidUtf8,

    /// A field holds a value outside its enumeration.
    #[error("Invalid value {value} for field '{field}'")]
    InvalidValue { field: &'static str, value: u32 },
}

/// Which id space an id belongs to.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum IdKind {
    Type,
    Sender,
}

impl fmt::Display for IdKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            IdKind::Type => f.write_str("type"),
            IdKind::Sender => f.write_str("sender"),
        }
    }
}

/// Error returned by a message handler.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
#[error("{0}")]
pub struct HandlerError(pub String);

impl HandlerError {
    pub fn new(reason: impl Into<String>) -> Self {
        Self(reason.into())
    }
}

/// Top-level error type for the transport.
#[derive(Error, Debug)]
pub enum TransportError {
    /// Encoding or decoding a value failed. Only the current message is lost.
    #[error("Codec error: {0}")]
    Codec(#[from] CodecError),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    /// A frame references an id the peer never described.
    #[error("Unknown remote {kind} id {remote_id}")]
    UnknownRemoteId { kind: IdKind, remote_id: i32 },

    /// A message references an id this process never registered.
    #[error("Unknown local {kind} id {id}")]
    UnknownLocalId { kind: IdKind, id: i32 },

    /// The payload does not fit in a single frame on its channel.
    #[error("Payload too large: {size} bytes (max {max})")]
    PayloadTooLarge { size: usize, max: usize },

    /// The peer's channel was lost.
    #[error("Peer disconnected")]
    Disconnected,

    /// No pong arrived in time. Handled like [`TransportError::Disconnected`].
    #[error("No pong received within {0:?}")]
    PingTimeout(Duration),

    /// Cookie exchange failed (wrong protocol or major version).
    #[error("Handshake failed: {0}")]
    Handshake(String),

    /// A handler rejected a message.
    #[error("Handler failed: {0}")]
    Handler(#[from] HandlerError),

    #[error("Invalid replay rate {0} (must be > 0)")]
    InvalidReplayRate(f32),

    #[error("Log error: {0}")]
    Log(String),

    #[error("Configuration error: {0}")]
    Config(String),

    #[error("Invalid target '{0}'")]
    InvalidTarget(String),

    /// The connection was closed by the application.
    #[error("Connection is closed")]
    Closed,
}

/// Alias for transport results.
pub type TransportResult<T> = Result<T, TransportError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_codec_error_converts() {
        let err: TransportError = CodecError::BufferTooSmall {
            needed: 8,
            available: 3,
        }
        .into();
        assert!(matches!(err, TransportError::Codec(_)));
        assert_eq!(
            err.to_string(),
            "Codec error: Buffer too small: need 8 bytes, 3 available"
        );
    }

    #[test]
    fn test_unknown_remote_id_display() {
        let err = TransportError::UnknownRemoteId {
            kind: IdKind::Sender,
            remote_id: 7,
        };
        assert_eq!(err.to_string(), "Unknown remote sender id 7");
    }
}
