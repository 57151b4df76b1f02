//! RPC provider error types.

use crate::config::ConfigError;
use gamewire_client::ClientError;
use gamewire_protocol::RegistryError;
use gamewire_server::ServerError;
use thiserror::Error;

/// RPC provider errors.
#[derive(Debug, Error)]
pub enum RpcError {
    #[error("server error: {0}")]
    Server(#[from] ServerError),

    #[error("service center error: {0}")]
    Client(#[from] ClientError),

    #[error("registry error: {0}")]
    Registry(#[from] RegistryError),

    #[error("configuration error: {0}")]
    Config(#[from] ConfigError),

    #[error("invalid service '{service}': {reason}")]
    InvalidService { service: String, reason: String },

    #[error("service '{0}' has more than one implementation")]
    DuplicateService(String),

    #[error("invalid method '{method}' on service '{service}': {reason}")]
    InvalidMethod {
        service: String,
        method: String,
        reason: String,
    },

    #[error("job '{0}' already scheduled")]
    DuplicateJob(String),

    #[error("invalid schedule for job '{job}': {reason}")]
    InvalidSchedule { job: String, reason: String },

    #[error("provider is not connected to a service center")]
    NotServiceCenterMode,
}

impl RpcError {
    /// Whether the error comes from declarations and will not go away on retry.
    pub fn is_configuration(&self) -> bool {
        matches!(
            self,
            RpcError::Registry(_)
                | RpcError::Config(_)
                | RpcError::InvalidService { .. }
                | RpcError::DuplicateService(_)
                | RpcError::InvalidMethod { .. }
                | RpcError::DuplicateJob(_)
                | RpcError::InvalidSchedule { .. }
        )
    }
}
