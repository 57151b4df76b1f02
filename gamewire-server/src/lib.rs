//! # gamewire-server
//!
//! TCP server listener for gamewire.
//!
//! This crate provides:
//! - The accept loop with IP whitelisting and a connection limit
//! - The challenge/echo handshake and its timeout sweep
//! - Heartbeat replies
//! - Dispatch of validated application messages
//! - YAML/env configuration

pub mod config;
pub mod error;
pub mod server;
pub mod session;

pub use config::{Config, ConfigError, HandshakeConfig, NetworkConfig};
pub use error::ServerError;
pub use server::{NoopListener, Server, ServerEventListener, ServerStats};
pub use session::{ValidationRecord, ValidationTable};
