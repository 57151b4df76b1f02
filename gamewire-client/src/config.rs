//! Connector configuration.

use gamewire_protocol::{AddressPair, FrameParams};
use std::time::Duration;

/// Default connect timeout.
pub const DEFAULT_CONNECT_TIMEOUT: Duration = Duration::from_secs(10);

/// Client connector configuration.
#[derive(Debug, Clone)]
pub struct ClientConfig {
    /// Server to dial and the secret its challenges are sealed with.
    pub address: AddressPair,
    /// Delay between reconnect attempts. Zero disables reconnection.
    pub auto_reconnect: Duration,
    /// Heartbeat period once validated. Zero disables heartbeats.
    pub heartbeat_interval: Duration,
    /// Timeout for a single connect attempt.
    pub connect_timeout: Duration,
    /// Frame layout; must match the server.
    pub codec: FrameParams,
}

impl ClientConfig {
    pub fn new(address: AddressPair) -> Self {
        Self {
            address,
            auto_reconnect: Duration::ZERO,
            heartbeat_interval: Duration::ZERO,
            connect_timeout: DEFAULT_CONNECT_TIMEOUT,
            codec: FrameParams::default(),
        }
    }

    pub fn with_auto_reconnect(mut self, interval: Duration) -> Self {
        self.auto_reconnect = interval;
        self
    }

    pub fn with_heartbeat(mut self, interval: Duration) -> Self {
        self.heartbeat_interval = interval;
        self
    }

    pub fn with_connect_timeout(mut self, timeout: Duration) -> Self {
        self.connect_timeout = timeout;
        self
    }

    pub fn with_codec(mut self, codec: FrameParams) -> Self {
        self.codec = codec;
        self
    }

    pub fn reconnect_enabled(&self) -> bool {
        !self.auto_reconnect.is_zero()
    }
}
