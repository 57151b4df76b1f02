//! Server error types.

use crate::config::ConfigError;
use gamewire_protocol::{ProtocolError, RegistryError};
use thiserror::Error;
use uuid::Uuid;

/// Server errors.
#[derive(Debug, Error)]
pub enum ServerError {
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("protocol error: {0}")]
    Protocol(#[from] ProtocolError),

    #[error("registry error: {0}")]
    Registry(#[from] RegistryError),

    #[error("configuration error: {0}")]
    Config(#[from] ConfigError),

    #[error("connection not found: {0}")]
    ConnectionNotFound(Uuid),

    #[error("server already running")]
    AlreadyRunning,

    #[error("server shutting down")]
    ShuttingDown,
}

impl ServerError {
    /// Returns whether this error is retryable.
    pub fn is_retryable(&self) -> bool {
        matches!(self, ServerError::Io(_))
    }
}
