//! Node configuration persisted as RON.

use std::path::{Path, PathBuf};
use std::time::Duration;

use serde::{Deserialize, Serialize};
use tandem_net::{EngineConfig, SocketConfig, TransportConfig};

use crate::error::ConfigError;

const FILE_NAME: &str = "config.ron";

/// Top-level node configuration.
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct Config {
    /// Transport settings.
    pub network: NetworkConfig,
    /// Debug/development settings.
    pub debug: DebugConfig,
}

/// Whether the node accepts connections or dials out.
#[derive(Debug, Clone, Copy, Default, Serialize, Deserialize, PartialEq, Eq, clap::ValueEnum)]
#[serde(rename_all = "lowercase")]
pub enum Mode {
    /// Run a server.
    #[default]
    Listen,
    /// Run a client.
    Connect,
}

/// Network configuration.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct NetworkConfig {
    pub mode: Mode,
    /// Address to dial in connect mode, or bind in listen mode.
    pub address: String,
    pub port: u16,
    /// Key a client must present during the handshake.
    pub key: String,
    /// Concurrent stream connections the server admits.
    pub max_connections: usize,
    pub handshake_timeout_ms: u64,
    pub stream: TransportSettings,
    pub datagram: TransportSettings,
    pub socket: SocketConfig,
}

/// Per-transport tunables in plain units.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct TransportSettings {
    pub heartbeat_interval_ms: u64,
    pub timeout_ms: u64,
    /// 0 keeps the platform default.
    pub receive_buffer_size: usize,
    /// 0 keeps the platform default.
    pub send_buffer_size: usize,
    pub max_payload_size: usize,
}

/// Debug/development configuration.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct DebugConfig {
    /// Log level override (e.g., "debug", "info", "warn").
    pub log_level: String,
}

impl Default for NetworkConfig {
    fn default() -> Self {
        let engine = EngineConfig::default();
        Self {
            mode: Mode::Listen,
            address: "127.0.0.1".to_string(),
            port: 7777,
            key: "tandem".to_string(),
            max_connections: engine.max_connections,
            handshake_timeout_ms: engine.handshake_timeout.as_millis() as u64,
            stream: TransportSettings::from(&engine.stream),
            datagram: TransportSettings::from(&engine.datagram),
            socket: engine.socket,
        }
    }
}

impl Default for TransportSettings {
    fn default() -> Self {
        Self::from(&TransportConfig::stream())
    }
}

impl Default for DebugConfig {
    fn default() -> Self {
        Self {
            log_level: "info".to_string(),
        }
    }
}

impl From<&TransportConfig> for TransportSettings {
    fn from(config: &TransportConfig) -> Self {
        Self {
            heartbeat_interval_ms: config.heartbeat_interval.as_millis() as u64,
            timeout_ms: config.timeout.as_millis() as u64,
            receive_buffer_size: config.receive_buffer_size,
            send_buffer_size: config.send_buffer_size,
            max_payload_size: config.max_payload_size,
        }
    }
}

impl TransportSettings {
    fn to_transport_config(&self) -> TransportConfig {
        TransportConfig {
            heartbeat_interval: Duration::from_millis(self.heartbeat_interval_ms),
            timeout: Duration::from_millis(self.timeout_ms),
            receive_buffer_size: self.receive_buffer_size,
            send_buffer_size: self.send_buffer_size,
            max_payload_size: self.max_payload_size,
        }
    }
}

impl NetworkConfig {
    /// Engine settings with every value clamped into its legal range.
    pub fn to_engine_config(&self) -> EngineConfig {
        EngineConfig {
            stream: self.stream.to_transport_config(),
            datagram: self.datagram.to_transport_config(),
            handshake_timeout: Duration::from_millis(self.handshake_timeout_ms),
            max_connections: self.max_connections,
            socket: self.socket.clone(),
        }
        .validated()
    }
}

// --- Load / Save / Reload ---

impl Config {
    /// Per-user config directory, e.g. `~/.config/tandem` on Linux.
    pub fn default_dir() -> Result<PathBuf, ConfigError> {
        dirs::config_dir()
            .map(|dir| dir.join("tandem"))
            .ok_or(ConfigError::NoConfigDir)
    }

    /// Load config from the given directory, or create a default config file.
    pub fn load_or_create(config_dir: &Path) -> Result<Self, ConfigError> {
        let config_path = config_dir.join(FILE_NAME);

        if config_path.exists() {
            let config = Self::read(&config_path)?;
            log::info!("Loaded config from {}", config_path.display());
            Ok(config)
        } else {
            let config = Config::default();
            config.save(config_dir)?;
            log::info!("Created default config at {}", config_path.display());
            Ok(config)
        }
    }

    /// Save config to the given directory as `config.ron`.
    pub fn save(&self, config_dir: &Path) -> Result<(), ConfigError> {
        std::fs::create_dir_all(config_dir).map_err(ConfigError::WriteError)?;

        let pretty = ron::ser::PrettyConfig::new()
            .depth_limit(4)
            .enumerate_arrays(false);
        let serialized =
            ron::ser::to_string_pretty(self, pretty).map_err(ConfigError::SerializeError)?;

        std::fs::write(config_dir.join(FILE_NAME), serialized).map_err(ConfigError::WriteError)
    }

    /// Re-read the file: `Some(new_config)` if it differs from `self`.
    pub fn reload(&self, config_dir: &Path) -> Result<Option<Self>, ConfigError> {
        let new_config = Self::read(&config_dir.join(FILE_NAME))?;
        if &new_config != self {
            log::info!("Config reloaded with changes");
            Ok(Some(new_config))
        } else {
            Ok(None)
        }
    }

    fn read(path: &Path) -> Result<Self, ConfigError> {
        let contents = std::fs::read_to_string(path).map_err(ConfigError::ReadError)?;
        ron::from_str(&contents).map_err(ConfigError::ParseError)
    }
}
