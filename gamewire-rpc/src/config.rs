//! Provider configuration.
//!
//! Extends the server configuration with a `provider` section. Loaded the
//! same way: defaults, then the YAML file named by `GAMEWIRE_CONFIG` or
//! `--config`, then environment variables.

use gamewire_protocol::AddressPair;
use gamewire_server::Config;
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::time::Duration;

pub use gamewire_server::ConfigError;

/// Provider node configuration.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct ProviderConfig {
    /// Listener serving RPC calls.
    #[serde(flatten)]
    pub server: Config,
    /// Provider identity and service center.
    pub provider: ProviderSection,
}

impl ProviderConfig {
    /// Loads `path`, or the file named by `GAMEWIRE_CONFIG`, or defaults,
    /// then applies environment overrides.
    pub fn load(path: Option<&Path>) -> Result<Self, ConfigError> {
        let file = path
            .map(Path::to_path_buf)
            .or_else(|| std::env::var_os("GAMEWIRE_CONFIG").map(PathBuf::from));

        let mut config = match file {
            Some(file) => Self::from_file(file)?,
            None => Self::default(),
        };
        config.apply_env_overrides();
        Ok(config)
    }

    pub fn from_file(path: impl AsRef<Path>) -> Result<Self, ConfigError> {
        let path = path.as_ref();
        let content = std::fs::read_to_string(path)
            .map_err(|e| ConfigError::IoError(path.to_path_buf(), e))?;
        serde_yaml::from_str(&content)
            .map_err(|e| ConfigError::ParseError(path.to_path_buf(), e.to_string()))
    }

    pub fn apply_env_overrides(&mut self) {
        self.apply_overrides(&|key| std::env::var(key).ok());
    }

    pub fn apply_overrides(&mut self, lookup: &dyn Fn(&str) -> Option<String>) {
        self.server.apply_overrides(lookup);
        self.provider.apply_overrides(lookup);
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        self.server.validate()?;
        self.provider.validate()
    }

    pub fn with_server(mut self, server: Config) -> Self {
        self.server = server;
        self
    }

    pub fn with_provider_id(mut self, id: u32) -> Self {
        self.provider.provider_id = id;
        self
    }

    pub fn with_service_center(mut self, center: ServiceCenterConfig) -> Self {
        self.provider.service_center = Some(center);
        self
    }
}

/// Provider identity.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ProviderSection {
    /// Id announced to the service center.
    pub provider_id: u32,
    /// IP announced to the service center.
    pub advertise_ip: String,
    /// Service center to register with, if any.
    pub service_center: Option<ServiceCenterConfig>,
}

impl Default for ProviderSection {
    fn default() -> Self {
        Self {
            provider_id: 0,
            advertise_ip: "127.0.0.1".to_string(),
            service_center: None,
        }
    }
}

impl ProviderSection {
    fn apply_overrides(&mut self, lookup: &dyn Fn(&str) -> Option<String>) {
        if let Some(id) = lookup("GAMEWIRE_PROVIDER_ID") {
            if let Ok(id) = id.parse() {
                self.provider_id = id;
            }
        }

        if let Some(ip) = lookup("GAMEWIRE_ADVERTISE_IP") {
            if !ip.is_empty() {
                self.advertise_ip = ip;
            }
        }

        if let Some(addr) = lookup("GAMEWIRE_CENTER_ADDR") {
            if let Some(parsed) = AddressPair::parse(&addr, String::new()) {
                let center = self
                    .service_center
                    .get_or_insert_with(ServiceCenterConfig::default);
                center.host = parsed.host;
                center.port = parsed.port;
            }
        }

        if let Some(secret) = lookup("GAMEWIRE_CENTER_SECRET") {
            if let Some(center) = self.service_center.as_mut() {
                center.secret = secret;
            }
        }
    }

    fn validate(&self) -> Result<(), ConfigError> {
        if self.advertise_ip.trim().is_empty() {
            return Err(ConfigError::ValidationError(
                "advertise_ip must not be empty".to_string(),
            ));
        }
        if let Some(center) = &self.service_center {
            if center.host.trim().is_empty() || center.port == 0 {
                return Err(ConfigError::ValidationError(
                    "service_center needs a host and a non-zero port".to_string(),
                ));
            }
        }
        Ok(())
    }
}

/// Service center connection.
#[derive(Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ServiceCenterConfig {
    pub host: String,
    pub port: u16,
    pub secret: String,
    /// Reconnect interval in seconds. Zero disables reconnection.
    pub auto_reconnect_secs: u64,
    /// Heartbeat period in seconds. Zero disables heartbeats.
    pub heartbeat_secs: u64,
}

impl Default for ServiceCenterConfig {
    fn default() -> Self {
        Self {
            host: String::new(),
            port: 0,
            secret: String::new(),
            auto_reconnect_secs: 5,
            heartbeat_secs: 0,
        }
    }
}

impl ServiceCenterConfig {
    pub fn new(host: impl Into<String>, port: u16, secret: impl Into<String>) -> Self {
        Self {
            host: host.into(),
            port,
            secret: secret.into(),
            ..Self::default()
        }
    }

    pub fn address(&self) -> AddressPair {
        AddressPair::new(self.host.clone(), self.port, self.secret.clone())
    }

    pub fn auto_reconnect(&self) -> Duration {
        Duration::from_secs(self.auto_reconnect_secs)
    }

    pub fn heartbeat(&self) -> Duration {
        Duration::from_secs(self.heartbeat_secs)
    }
}

impl std::fmt::Debug for ServiceCenterConfig {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ServiceCenterConfig")
            .field("host", &self.host)
            .field("port", &self.port)
            .field("secret", &"***")
            .field("auto_reconnect_secs", &self.auto_reconnect_secs)
            .field("heartbeat_secs", &self.heartbeat_secs)
            .finish()
    }
}
