//! Protocol error types

use thiserror::Error;

/// Protocol-level errors
#[derive(Debug, Error)]
pub enum ProtocolError {
    /// JSON encoding or decoding failed
    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    /// Line exceeds maximum allowed size
    #[error("Line too large: {size} bytes (max: {max})")]
    LineTooLarge { size: usize, max: usize },

    /// Line is not valid UTF-8
    #[error("Invalid UTF-8 in message")]
    InvalidUtf8,

    /// Peer closed the stream before a complete line arrived
    #[error("Connection closed by peer")]
    ConnectionClosed,

    /// I/O error during line operations
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}

impl ProtocolError {
    /// Whether this error means the underlying stream is gone
    ///
    /// Transport failures leave the connection unusable; everything else is a
    /// problem with a single message.
    pub fn is_transport(&self) -> bool {
        matches!(self, Self::ConnectionClosed | Self::Io(_))
    }
}

/// Type alias for protocol results
pub type Result<T> = std::result::Result<T, ProtocolError>;
