//! Protocol error types.

use crate::message::MessageId;
use thiserror::Error;

/// Errors raised while framing, decoding or dispatching a message.
///
/// Anything in here that reaches the connection loop is a protocol violation:
/// the stream can no longer be trusted, so the connection is closed.
#[derive(Debug, Error)]
pub enum ProtocolError {
    #[error("frame too large: {size} bytes (max {max})")]
    FrameTooLarge { size: usize, max: usize },

    #[error("invalid length field: {0}")]
    InvalidLength(i64),

    #[error("truncated payload: need {needed} bytes, got {available}")]
    Truncated { needed: usize, available: usize },

    #[error("unknown message id: {0:#06x}")]
    UnknownMessage(MessageId),

    #[error("message {id:#06x} decode failed: {reason}")]
    Decode { id: MessageId, reason: String },

    #[error("codec error: {0}")]
    Codec(#[from] bincode::Error),

    #[error("cipher error: {0}")]
    Cipher(String),

    #[error("invalid frame parameters: {0}")]
    InvalidFrameParams(String),

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("connection closed")]
    ConnectionClosed,
}

impl ProtocolError {
    /// Returns whether the connection must be closed after this error.
    ///
    /// Only a send attempt on an already closed connection is survivable.
    pub fn is_connection_fatal(&self) -> bool {
        !matches!(self, ProtocolError::ConnectionClosed)
    }
}

/// Message registry configuration errors.
#[derive(Debug, Error)]
pub enum RegistryError {
    #[error("message id {id:#06x} already bound to {existing}, cannot bind {attempted}")]
    DuplicateIdentifier {
        id: MessageId,
        existing: &'static str,
        attempted: &'static str,
    },
}

/// Error returned by a message handler.
///
/// Handler failures are application problems: they are logged and reported to
/// the event listener but leave the connection open.
#[derive(Debug, Error)]
pub enum HandlerError {
    #[error("protocol error: {0}")]
    Protocol(#[from] ProtocolError),

    #[error("{0}")]
    Failed(String),
}

impl HandlerError {
    pub fn failed(message: impl Into<String>) -> Self {
        HandlerError::Failed(message.into())
    }
}
