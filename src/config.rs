//! Server configuration module
//!
//! Loads `data/server.toml` when present; every field has a default so
//! the server also starts from an empty directory.

use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};

use crate::error::{Result, ServerError};
use crate::game::registry::MAX_PLAYERS;
use crate::game::world::TICK_RATE_MS;

/// Default location of the config file
pub const CONFIG_PATH: &str = "data/server.toml";

/// Server configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ServerConfig {
    /// Server name shown in log output
    #[serde(default = "default_server_name")]
    pub server_name: String,

    /// Game listen port (TCP)
    #[serde(default = "default_port")]
    pub port: u16,

    /// Root of the data tree (saves, accounts, config)
    #[serde(default = "default_data_path")]
    pub data_path: PathBuf,

    /// Player slot count, clamped to the protocol ceiling
    #[serde(default = "default_max_players")]
    pub max_players: usize,

    /// Game tick length in milliseconds
    #[serde(default = "default_tick_rate")]
    pub tick_rate_ms: u64,
}

fn default_server_name() -> String {
    "Oldscape".to_string()
}

fn default_port() -> u16 {
    43594
}

fn default_data_path() -> PathBuf {
    PathBuf::from("data")
}

fn default_max_players() -> usize {
    MAX_PLAYERS
}

fn default_tick_rate() -> u64 {
    TICK_RATE_MS
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            server_name: default_server_name(),
            port: default_port(),
            data_path: default_data_path(),
            max_players: default_max_players(),
            tick_rate_ms: default_tick_rate(),
        }
    }
}

impl ServerConfig {
    /// Load from the default path, falling back to defaults when the
    /// file does not exist
    pub fn load() -> Result<Self> {
        Self::load_from(Path::new(CONFIG_PATH))
    }

    /// Load from an explicit path
    pub fn load_from(path: &Path) -> Result<Self> {
        match std::fs::read_to_string(path) {
            Ok(text) => toml::from_str(&text)
                .map_err(|e| ServerError::Config(format!("{}: {e}", path.display()))),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(Self::default()),
            Err(e) => Err(ServerError::Config(format!("{}: {e}", path.display()))),
        }
    }
}
