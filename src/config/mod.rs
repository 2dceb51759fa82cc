//! Configuration module
//!
//! Handles loading and saving Duotris configuration.

use serde::{Deserialize, Serialize};
use std::net::{IpAddr, Ipv4Addr};
use std::path::{Path, PathBuf};
use std::time::Duration;
use thiserror::Error;

use crate::discovery::ScanConfig;
use crate::network::NetworkConfig as NetSettings;
use crate::protocol::DEFAULT_PORT;
use crate::session::SessionConfig;

/// Configuration errors
#[derive(Error, Debug)]
pub enum ConfigError {
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Parse error: {0}")]
    Parse(#[from] toml::de::Error),

    #[error("Serialize error: {0}")]
    Serialize(#[from] toml::ser::Error),

    #[error("Config file not found: {0}")]
    NotFound(PathBuf),
}

pub type ConfigResult<T> = Result<T, ConfigError>;

/// Main application configuration
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct Config {
    /// General settings
    #[serde(default)]
    pub general: GeneralConfig,

    /// Network settings
    #[serde(default)]
    pub network: NetworkConfig,

    /// LAN scan settings
    #[serde(default)]
    pub discovery: DiscoveryConfig,

    /// Lobby settings
    #[serde(default)]
    pub lobby: LobbyConfig,

    /// Game settings
    #[serde(default)]
    pub game: GameConfig,
}

/// General configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct GeneralConfig {
    /// Name shown to the other player
    pub name: String,
    /// Enable verbose logging
    #[serde(default)]
    pub verbose: bool,
}

impl Default for GeneralConfig {
    fn default() -> Self {
        Self {
            name: hostname::get()
                .map(|h| h.to_string_lossy().to_string())
                .unwrap_or_else(|_| "player".to_string()),
            verbose: false,
        }
    }
}

/// Network configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct NetworkConfig {
    /// Port to listen on and to dial
    #[serde(default = "default_port")]
    pub port: u16,
    /// Interface to listen on
    #[serde(default = "default_bind_address")]
    pub bind_address: IpAddr,
    /// Connection timeout in ms
    #[serde(default = "default_connect_timeout")]
    pub connect_timeout_ms: u64,
    /// Deadline for requests in ms; unset waits as long as the connection lives
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub request_timeout_ms: Option<u64>,
}

fn default_port() -> u16 {
    DEFAULT_PORT
}

fn default_bind_address() -> IpAddr {
    IpAddr::V4(Ipv4Addr::UNSPECIFIED)
}

fn default_connect_timeout() -> u64 {
    500
}

impl Default for NetworkConfig {
    fn default() -> Self {
        Self {
            port: default_port(),
            bind_address: default_bind_address(),
            connect_timeout_ms: default_connect_timeout(),
            request_timeout_ms: None,
        }
    }
}

/// LAN scan configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DiscoveryConfig {
    /// Connect plus handshake budget per address, in ms
    #[serde(default = "default_probe_timeout")]
    pub probe_timeout_ms: u64,
    /// Larger subnets are only partially scanned
    #[serde(default = "default_max_hosts")]
    pub max_hosts_per_subnet: usize,
    /// Simultaneous probes
    #[serde(default = "default_max_in_flight")]
    pub max_in_flight: usize,
}

fn default_probe_timeout() -> u64 {
    500
}

fn default_max_hosts() -> usize {
    4096
}

fn default_max_in_flight() -> usize {
    1024
}

impl Default for DiscoveryConfig {
    fn default() -> Self {
        Self {
            probe_timeout_ms: default_probe_timeout(),
            max_hosts_per_subnet: default_max_hosts(),
            max_in_flight: default_max_in_flight(),
        }
    }
}

/// Lobby configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LobbyConfig {
    /// Chat lines kept
    #[serde(default = "default_chat_capacity")]
    pub chat_capacity: usize,
}

fn default_chat_capacity() -> usize {
    100
}

impl Default for LobbyConfig {
    fn default() -> Self {
        Self {
            chat_capacity: default_chat_capacity(),
        }
    }
}

/// Game configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct GameConfig {
    /// Upcoming pieces kept in the queue
    #[serde(default = "default_queue_preview")]
    pub queue_preview: usize,
    /// Frames per second of the match loop
    #[serde(default = "default_tick_rate")]
    pub tick_rate: u32,
}

fn default_queue_preview() -> usize {
    3
}

fn default_tick_rate() -> u32 {
    60
}

impl Default for GameConfig {
    fn default() -> Self {
        Self {
            queue_preview: default_queue_preview(),
            tick_rate: default_tick_rate(),
        }
    }
}

impl GameConfig {
    /// Time between match frames
    pub fn frame_interval(&self) -> Duration {
        Duration::from_secs(1) / self.tick_rate.max(1)
    }
}

impl Config {
    /// Load configuration from a file
    pub fn load(path: &Path) -> ConfigResult<Self> {
        if !path.exists() {
            return Err(ConfigError::NotFound(path.to_path_buf()));
        }

        let contents = std::fs::read_to_string(path)?;
        let config: Config = toml::from_str(&contents)?;
        Ok(config)
    }

    /// Load configuration from the default location
    pub fn load_default() -> ConfigResult<Self> {
        let config_paths = [
            dirs::config_dir().map(|p| p.join("duotris/config.toml")),
            Some(PathBuf::from("./duotris.toml")),
            Some(PathBuf::from("./config.toml")),
        ];

        for path in config_paths.iter().flatten() {
            if path.exists() {
                return Self::load(path);
            }
        }

        // Return default config if no file found
        Ok(Self::default())
    }

    /// Save configuration to a file
    pub fn save(&self, path: &Path) -> ConfigResult<()> {
        let contents = toml::to_string_pretty(self)?;

        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)?;
        }

        std::fs::write(path, contents)?;
        Ok(())
    }

    /// Transport settings
    pub fn network_settings(&self) -> NetSettings {
        NetSettings {
            port: self.network.port,
            bind_address: self.network.bind_address,
            connect_timeout_ms: self.network.connect_timeout_ms,
            request_timeout_ms: self.network.request_timeout_ms,
        }
    }

    pub fn scan_settings(&self) -> ScanConfig {
        ScanConfig {
            probe_timeout: Duration::from_millis(self.discovery.probe_timeout_ms),
            max_hosts_per_subnet: self.discovery.max_hosts_per_subnet,
            max_in_flight: self.discovery.max_in_flight,
        }
    }

    pub fn session_settings(&self) -> SessionConfig {
        SessionConfig {
            network: self.network_settings(),
            scan: self.scan_settings(),
            chat_capacity: self.lobby.chat_capacity,
            queue_preview: self.game.queue_preview,
        }
    }
}

/// Generate a sample configuration file
pub fn generate_sample_config() -> ConfigResult<String> {
    let config = Config {
        general: GeneralConfig {
            name: "Player One".to_string(),
            verbose: false,
        },
        network: NetworkConfig {
            request_timeout_ms: Some(10_000),
            ..Default::default()
        },
        ..Default::default()
    };

    Ok(toml::to_string_pretty(&config)?)
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;
    use tempfile::NamedTempFile;

    #[test]
    fn test_default_config() {
        let config = Config::default();
        assert_eq!(config.network.port, DEFAULT_PORT);
        assert_eq!(config.network.request_timeout_ms, None);
        assert_eq!(config.lobby.chat_capacity, 100);
        assert_eq!(config.game.queue_preview, 3);
    }

    #[test]
    fn test_save_and_load() {
        let mut config = Config::default();
        config.general.name = "tester".to_string();
        config.network.port = 5000;
        let file = NamedTempFile::new().unwrap();

        config.save(file.path()).unwrap();

        let loaded = Config::load(file.path()).unwrap();
        assert_eq!(loaded.network.port, 5000);
        assert_eq!(loaded.general.name, "tester");
    }

    #[test]
    fn test_partial_file_uses_defaults() {
        let mut file = NamedTempFile::new().unwrap();
        writeln!(file, "[general]\nname = \"kim\"\n\n[lobby]\nchat_capacity = 5").unwrap();

        let loaded = Config::load(file.path()).unwrap();
        assert_eq!(loaded.general.name, "kim");
        assert_eq!(loaded.lobby.chat_capacity, 5);
        assert_eq!(loaded.network.port, DEFAULT_PORT);
        assert_eq!(loaded.discovery.max_in_flight, 1024);
    }

    #[test]
    fn test_missing_file() {
        let result = Config::load(Path::new("/nonexistent/duotris.toml"));
        assert!(matches!(result, Err(ConfigError::NotFound(_))));
    }

    #[test]
    fn test_sample_config() {
        let sample = generate_sample_config().unwrap();
        let parsed: Config = toml::from_str(&sample).unwrap();
        assert_eq!(parsed.general.name, "Player One");
        assert_eq!(
            parsed.session_settings().network.request_timeout(),
            Some(Duration::from_millis(10_000))
        );
    }

    #[test]
    fn test_frame_interval() {
        let game = GameConfig::default();
        assert_eq!(game.frame_interval(), Duration::from_secs(1) / 60);
    }
}
