//! Server configuration.
//!
//! Configuration is loaded in the following order (later overrides earlier):
//! 1. Default values
//! 2. YAML config file (if specified via GAMEWIRE_CONFIG or --config)
//! 3. Environment variables

use gamewire_protocol::FrameParams;
use serde::{Deserialize, Serialize};
use std::collections::HashSet;
use std::net::{IpAddr, Ipv4Addr, SocketAddr};
use std::path::{Path, PathBuf};
use std::time::Duration;
use thiserror::Error;

/// Default listening port.
pub const DEFAULT_PORT: u16 = 8800;

/// Server configuration.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct Config {
    /// Network configuration.
    pub network: NetworkConfig,
    /// Handshake configuration.
    pub handshake: HandshakeConfig,
    /// Frame layout.
    pub codec: FrameParams,
}

impl Config {
    /// Loads configuration from a YAML file.
    pub fn from_file(path: impl AsRef<Path>) -> Result<Self, ConfigError> {
        let path = path.as_ref();
        let content = std::fs::read_to_string(path)
            .map_err(|e| ConfigError::IoError(path.to_path_buf(), e))?;
        serde_yaml::from_str(&content)
            .map_err(|e| ConfigError::ParseError(path.to_path_buf(), e.to_string()))
    }

    /// Applies environment variable overrides to the configuration.
    pub fn apply_env_overrides(&mut self) {
        self.apply_overrides(&|key| std::env::var(key).ok());
    }

    /// Applies overrides from `lookup` (an environment-like key/value source).
    pub fn apply_overrides(&mut self, lookup: &dyn Fn(&str) -> Option<String>) {
        self.network.apply_overrides(lookup);
        self.handshake.apply_overrides(lookup);
    }

    /// Checks the whole configuration.
    pub fn validate(&self) -> Result<(), ConfigError> {
        self.network.validate()?;
        self.handshake.validate()?;
        self.codec
            .validate()
            .map_err(|e| ConfigError::ValidationError(e.to_string()))
    }

    /// Saves configuration to a YAML file.
    pub fn save(&self, path: impl AsRef<Path>) -> Result<(), ConfigError> {
        let path = path.as_ref();
        let content = serde_yaml::to_string(self)
            .map_err(|e| ConfigError::ParseError(path.to_path_buf(), e.to_string()))?;
        std::fs::write(path, content).map_err(|e| ConfigError::IoError(path.to_path_buf(), e))
    }

    pub fn with_bind_addr(mut self, addr: SocketAddr) -> Self {
        self.network.bind_addr = addr;
        self
    }

    pub fn with_secret(mut self, secret: impl Into<String>) -> Self {
        self.handshake.secret = secret.into();
        self
    }

    pub fn with_whitelist<I, S>(mut self, ips: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.network.whitelist = ips.into_iter().map(Into::into).collect();
        self
    }

    pub fn with_validate_timeout(mut self, timeout: Duration) -> Self {
        self.handshake.validate_timeout_ms = timeout.as_millis() as u64;
        self
    }

    pub fn with_sweep_interval(mut self, interval: Duration) -> Self {
        self.handshake.sweep_interval_ms = interval.as_millis() as u64;
        self
    }
}

/// Network configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct NetworkConfig {
    /// Address to bind to.
    #[serde(with = "socket_addr_serde")]
    pub bind_addr: SocketAddr,
    /// Name used in logs.
    pub server_name: String,
    /// Allowed peer IPs. Empty means everyone.
    pub whitelist: Vec<String>,
    /// Maximum concurrent connections.
    pub max_connections: usize,
}

impl Default for NetworkConfig {
    fn default() -> Self {
        Self {
            bind_addr: SocketAddr::new(IpAddr::V4(Ipv4Addr::UNSPECIFIED), DEFAULT_PORT),
            server_name: "gamewire".to_string(),
            whitelist: Vec::new(),
            max_connections: 10_000,
        }
    }
}

impl NetworkConfig {
    fn apply_overrides(&mut self, lookup: &dyn Fn(&str) -> Option<String>) {
        if let Some(addr) = lookup("GAMEWIRE_BIND") {
            if let Ok(parsed) = addr.parse() {
                self.bind_addr = parsed;
            }
        }

        if let Some(name) = lookup("GAMEWIRE_SERVER_NAME") {
            if !name.is_empty() {
                self.server_name = name;
            }
        }

        if let Some(list) = lookup("GAMEWIRE_WHITELIST") {
            self.whitelist = list
                .split(',')
                .map(str::trim)
                .filter(|s| !s.is_empty())
                .map(str::to_string)
                .collect();
        }

        if let Some(max) = lookup("GAMEWIRE_MAX_CONNECTIONS") {
            if let Ok(n) = max.parse() {
                self.max_connections = n;
            }
        }
    }

    fn validate(&self) -> Result<(), ConfigError> {
        if self.max_connections == 0 {
            return Err(ConfigError::ValidationError(
                "max_connections must be greater than zero".to_string(),
            ));
        }
        self.whitelist_ips().map(|_| ())
    }

    /// Parsed whitelist, or `None` when every peer is allowed.
    pub fn whitelist_ips(&self) -> Result<Option<HashSet<IpAddr>>, ConfigError> {
        if self.whitelist.is_empty() {
            return Ok(None);
        }
        self.whitelist
            .iter()
            .map(|ip| {
                ip.parse::<IpAddr>().map_err(|_| {
                    ConfigError::ValidationError(format!("invalid whitelist entry '{}'", ip))
                })
            })
            .collect::<Result<HashSet<_>, _>>()
            .map(Some)
    }
}

/// Handshake configuration.
#[derive(Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct HandshakeConfig {
    /// Shared secret the challenge is sealed with.
    pub secret: String,
    /// How long a connection may stay unvalidated, in milliseconds.
    pub validate_timeout_ms: u64,
    /// How often pending validations are swept, in milliseconds.
    pub sweep_interval_ms: u64,
}

impl Default for HandshakeConfig {
    fn default() -> Self {
        Self {
            secret: String::new(),
            validate_timeout_ms: 20_000,
            sweep_interval_ms: 1_000,
        }
    }
}

impl HandshakeConfig {
    fn apply_overrides(&mut self, lookup: &dyn Fn(&str) -> Option<String>) {
        if let Some(secret) = lookup("GAMEWIRE_SECRET") {
            self.secret = secret;
        }

        if let Some(timeout) = lookup("GAMEWIRE_VALIDATE_TIMEOUT") {
            if let Ok(secs) = timeout.parse::<u64>() {
                self.validate_timeout_ms = secs.saturating_mul(1000);
            }
        }
    }

    fn validate(&self) -> Result<(), ConfigError> {
        if self.validate_timeout_ms == 0 {
            return Err(ConfigError::ValidationError(
                "validate_timeout_ms must be greater than zero".to_string(),
            ));
        }
        if self.sweep_interval_ms == 0 {
            return Err(ConfigError::ValidationError(
                "sweep_interval_ms must be greater than zero".to_string(),
            ));
        }
        Ok(())
    }

    pub fn validate_timeout(&self) -> Duration {
        Duration::from_millis(self.validate_timeout_ms)
    }

    pub fn sweep_interval(&self) -> Duration {
        Duration::from_millis(self.sweep_interval_ms)
    }
}

impl std::fmt::Debug for HandshakeConfig {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("HandshakeConfig")
            .field("secret", &"***")
            .field("validate_timeout_ms", &self.validate_timeout_ms)
            .field("sweep_interval_ms", &self.sweep_interval_ms)
            .finish()
    }
}

/// Configuration error.
#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("failed to read config file '{}': {1}", .0.display())]
    IoError(PathBuf, std::io::Error),

    #[error("failed to parse config file '{}': {1}", .0.display())]
    ParseError(PathBuf, String),

    #[error("configuration validation failed: {0}")]
    ValidationError(String),
}

/// Custom serde module for SocketAddr (to handle as string in YAML).
pub mod socket_addr_serde {
    use serde::{Deserialize, Deserializer, Serializer};
    use std::net::SocketAddr;

    pub fn serialize<S>(addr: &SocketAddr, serializer: S) -> Result<S::Ok, S::Error>
    where
        S: Serializer,
    {
        serializer.serialize_str(&addr.to_string())
    }

    pub fn deserialize<'de, D>(deserializer: D) -> Result<SocketAddr, D::Error>
    where
        D: Deserializer<'de>,
    {
        let s = String::deserialize(deserializer)?;
        s.parse().map_err(serde::de::Error::custom)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;
    use std::io::Write;

    #[test]
    fn test_default_config() {
        let config = Config::default();
        assert_eq!(config.network.bind_addr.port(), DEFAULT_PORT);
        assert_eq!(config.handshake.validate_timeout(), Duration::from_secs(20));
        assert_eq!(config.handshake.sweep_interval(), Duration::from_secs(1));
        assert_eq!(config.codec, FrameParams::default());
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_yaml_file() {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        write!(
            file,
            r#"
network:
  bind_addr: "127.0.0.1:9100"
  server_name: lobby-1
  whitelist: ["127.0.0.1", "10.0.0.7"]
handshake:
  secret: abc
  validate_timeout_ms: 5000
codec:
  max_frame_length: 65536
  length_field_length: 2
  initial_bytes_to_strip: 2
"#
        )
        .unwrap();

        let config = Config::from_file(file.path()).unwrap();
        assert_eq!(config.network.bind_addr.port(), 9100);
        assert_eq!(config.network.server_name, "lobby-1");
        assert_eq!(config.handshake.secret, "abc");
        assert_eq!(config.handshake.sweep_interval_ms, 1000);
        assert_eq!(config.codec.length_field_length, 2);
        assert_eq!(config.codec.length_field_offset, 0);

        let ips = config.network.whitelist_ips().unwrap().unwrap();
        assert!(ips.contains(&"10.0.0.7".parse::<IpAddr>().unwrap()));
        config.validate().unwrap();
    }

    #[test]
    fn test_missing_file() {
        assert!(matches!(
            Config::from_file("/nonexistent/gamewire.yaml"),
            Err(ConfigError::IoError(..))
        ));
    }

    #[test]
    fn test_overrides() {
        let env: HashMap<&str, &str> = [
            ("GAMEWIRE_BIND", "127.0.0.1:7000"),
            ("GAMEWIRE_WHITELIST", "127.0.0.1, ::1,"),
            ("GAMEWIRE_SECRET", "from-env"),
            ("GAMEWIRE_VALIDATE_TIMEOUT", "3"),
            ("GAMEWIRE_MAX_CONNECTIONS", "not-a-number"),
        ]
        .into_iter()
        .collect();

        let mut config = Config::default();
        config.apply_overrides(&|key| env.get(key).map(|v| v.to_string()));

        assert_eq!(config.network.bind_addr.port(), 7000);
        assert_eq!(config.network.whitelist, vec!["127.0.0.1", "::1"]);
        assert_eq!(config.handshake.secret, "from-env");
        assert_eq!(config.handshake.validate_timeout_ms, 3000);
        assert_eq!(config.network.max_connections, 10_000);
    }

    #[test]
    fn test_huge_validate_timeout_saturates() {
        let mut config = Config::default();
        config.apply_overrides(&|key| {
            (key == "GAMEWIRE_VALIDATE_TIMEOUT").then(|| u64::MAX.to_string())
        });
        assert_eq!(config.handshake.validate_timeout_ms, u64::MAX);
        config.validate().unwrap();
    }

    #[test]
    fn test_validation() {
        let bad_ip = Config::default().with_whitelist(["not-an-ip"]);
        assert!(matches!(
            bad_ip.validate(),
            Err(ConfigError::ValidationError(_))
        ));

        let mut zero_sweep = Config::default();
        zero_sweep.handshake.sweep_interval_ms = 0;
        assert!(zero_sweep.validate().is_err());

        let mut bad_codec = Config::default();
        bad_codec.codec.length_field_length = 7;
        assert!(bad_codec.validate().is_err());
    }

    #[test]
    fn test_yaml_roundtrip_hides_nothing_but_debug() {
        let config = Config::default().with_secret("shh");
        let yaml = serde_yaml::to_string(&config).unwrap();
        let parsed: Config = serde_yaml::from_str(&yaml).unwrap();
        assert_eq!(parsed.handshake.secret, "shh");
        assert!(!format!("{:?}", config).contains("shh"));
    }
}
