//! # gamewire-client
//!
//! Client connector for gamewire.
//!
//! This crate provides:
//! - Outbound connections with a connect timeout
//! - The client side of the challenge/echo handshake
//! - Periodic heartbeats and server clock tracking
//! - Fixed-interval auto-reconnect

pub mod config;
pub mod connector;
pub mod error;

pub use config::ClientConfig;
pub use connector::{ClientConnector, ClientEventListener, ConnectorState, NoopClientListener};
pub use error::ClientError;
