use anyhow::{Context, Result};
use cleepbus_network::config::{DEFAULT_DISCOVERY_PORT, DEFAULT_LOCAL_PORT};
use cleepbus_network::queue::DEFAULT_QUEUE_CAPACITY;
use serde::{Deserialize, Serialize};
use std::net::SocketAddr;
use std::path::{Path, PathBuf};
use tracing::info;

/// Process configuration, stored at `~/.cleepbus/config.json`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct BridgeConfig {
    /// Fixed bridge identity. A random one is used per run when unset.
    pub uuid: Option<String>,
    pub debug: bool,
    pub local_channel_enabled: bool,
    /// Port of the local application websocket. `null` disables the channel.
    pub local_channel_port: Option<u16>,
    pub queue_capacity: usize,
    pub mesh_listen_addr: SocketAddr,
    pub discovery_port: u16,
    pub announce_interval_secs: u64,
    pub peer_expiry_secs: u64,
}

impl Default for BridgeConfig {
    fn default() -> Self {
        Self {
            uuid: None,
            debug: false,
            local_channel_enabled: true,
            local_channel_port: Some(DEFAULT_LOCAL_PORT),
            queue_capacity: DEFAULT_QUEUE_CAPACITY,
            mesh_listen_addr: SocketAddr::from(([0, 0, 0, 0], 0)),
            discovery_port: DEFAULT_DISCOVERY_PORT,
            announce_interval_secs: 5,
            peer_expiry_secs: 30,
        }
    }
}

impl BridgeConfig {
    /// Returns the base directory: `~/.cleepbus/`
    pub fn base_dir() -> Result<PathBuf> {
        let home = dirs::home_dir().context("Could not determine home directory")?;
        Ok(home.join(".cleepbus"))
    }

    /// Returns the config file path: `~/.cleepbus/config.json`
    pub fn config_path() -> Result<PathBuf> {
        Ok(Self::base_dir()?.join("config.json"))
    }

    /// Returns the logs directory: `~/.cleepbus/logs/`
    pub fn logs_dir() -> Result<PathBuf> {
        Ok(Self::base_dir()?.join("logs"))
    }

    /// Load the config from its default location. See [`Self::load_or_default`].
    pub fn load() -> Result<(Self, Option<anyhow::Error>)> {
        let path = Self::config_path()?;
        Ok(Self::load_or_default(&path))
    }

    /// Load config from a JSON file. A missing file gives defaults. An
    /// unreadable or corrupt file gives defaults plus the reason, which the
    /// caller reports once logging is up.
    pub fn load_or_default(path: &Path) -> (Self, Option<anyhow::Error>) {
        if !path.exists() {
            return (Self::default(), None);
        }
        let loaded = std::fs::read_to_string(path)
            .with_context(|| format!("Cannot read config file {}", path.display()))
            .and_then(|data| {
                serde_json::from_str::<BridgeConfig>(&data)
                    .with_context(|| format!("Corrupt config file {}", path.display()))
            });
        match loaded {
            Ok(config) => (config, None),
            Err(e) => (Self::default(), Some(e)),
        }
    }

    /// Save the config to a JSON file, creating parent directories.
    pub fn save_to_file(&self, path: &Path) -> Result<()> {
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)
                .with_context(|| format!("Failed to create directory: {}", parent.display()))?;
        }
        let content = serde_json::to_string_pretty(self)?;
        std::fs::write(path, content)
            .with_context(|| format!("Failed to write config: {}", path.display()))?;
        info!("Saved config to {}", path.display());
        Ok(())
    }
}
