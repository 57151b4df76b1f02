//! Dial address plus the secret used to authenticate on it.

use serde::{Deserialize, Serialize};
use std::fmt;

/// Host, port and shared secret of a remote endpoint.
#[derive(Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct AddressPair {
    pub host: String,
    pub port: u16,
    #[serde(default)]
    pub secret: String,
}

impl AddressPair {
    pub fn new(host: impl Into<String>, port: u16, secret: impl Into<String>) -> Self {
        Self {
            host: host.into(),
            port,
            secret: secret.into(),
        }
    }

    /// Parses a `host:port` string.
    pub fn parse(addr: &str, secret: impl Into<String>) -> Option<Self> {
        let (host, port) = addr.rsplit_once(':')?;
        if host.is_empty() {
            return None;
        }
        let port = port.parse().ok()?;
        Some(Self::new(host.trim_matches(|c| c == '[' || c == ']'), port, secret))
    }

    /// `host:port`, suitable for `TcpStream::connect`.
    pub fn dial_target(&self) -> String {
        if self.host.contains(':') {
            format!("[{}]:{}", self.host, self.port)
        } else {
            format!("{}:{}", self.host, self.port)
        }
    }
}

impl fmt::Display for AddressPair {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.dial_target())
    }
}

// The secret never shows up in logs.
impl fmt::Debug for AddressPair {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("AddressPair")
            .field("host", &self.host)
            .field("port", &self.port)
            .field("secret", &"***")
            .finish()
    }
}
