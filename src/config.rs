//! # Configuration Management
//!
//! This module handles PeerChat's configuration system, including:
//! - TOML-based configuration files
//! - Listening port and peer persistence location
//! - Transport limits (connect timeout, frame size, pre-handshake buffer)
//!
//! The configuration is stored in a platform-appropriate directory
//! (e.g., `~/.config/peerchat/` on Linux), overridable with the
//! `PEERCHAT_CONFIG_DIR` environment variable.

use anyhow::Result;
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::time::Duration;

use crate::transport::TransportConfig;
use crate::wire::MAX_PAYLOAD_LEN;

/// Environment variable overriding the configuration directory.
pub const CONFIG_DIR_ENV: &str = "PEERCHAT_CONFIG_DIR";

const CONFIG_FILE: &str = "config.toml";
const IDENTITY_FILE: &str = "identity.key";
const PEERS_FILE: &str = "peers.txt";

/// Main configuration structure for a PeerChat node.
#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(default)]
pub struct Config {
    pub listen_port: u16,
    pub peers_file: PathBuf,
    pub connect_timeout_secs: u64,
    pub max_payload_bytes: usize,
    pub max_pending_frames: usize,
    pub max_pending_bytes: usize,

    #[serde(skip)]
    pub config_file_path: PathBuf,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            listen_port: 8080,
            peers_file: PathBuf::from(PEERS_FILE),
            connect_timeout_secs: 10,
            max_payload_bytes: MAX_PAYLOAD_LEN,
            max_pending_frames: 32,
            max_pending_bytes: 1024 * 1024,
            config_file_path: PathBuf::from(CONFIG_FILE),
        }
    }
}

impl Config {
    /// Create and save a default configuration in the user config directory.
    pub async fn init() -> Result<Self> {
        Self::init_in(&Self::config_dir()?).await
    }

    pub async fn init_in(dir: &Path) -> Result<Self> {
        tokio::fs::create_dir_all(dir).await?;

        let config = Self {
            peers_file: dir.join(PEERS_FILE),
            config_file_path: dir.join(CONFIG_FILE),
            ..Self::default()
        };

        config.save().await?;

        Ok(config)
    }

    pub async fn load() -> Result<Self> {
        Self::load_from(&Self::config_dir()?).await
    }

    pub async fn load_from(dir: &Path) -> Result<Self> {
        let config_file = dir.join(CONFIG_FILE);

        if !config_file.exists() {
            anyhow::bail!("PeerChat not initialized. Run 'peerchat init' first.");
        }

        let content = tokio::fs::read_to_string(&config_file).await?;
        let mut config: Config = toml::from_str(&content)?;
        config.config_file_path = config_file;
        config.validate()?;

        Ok(config)
    }

    /// Load the configuration, creating a default one on first run.
    pub async fn load_or_init() -> Result<Self> {
        let dir = Self::config_dir()?;
        if dir.join(CONFIG_FILE).exists() {
            Self::load_from(&dir).await
        } else {
            Self::init_in(&dir).await
        }
    }

    pub async fn save(&self) -> Result<()> {
        let content = toml::to_string_pretty(self)?;
        tokio::fs::write(&self.config_file_path, content).await?;
        Ok(())
    }

    pub fn config_path(&self) -> &Path {
        &self.config_file_path
    }

    pub fn identity_path(&self) -> PathBuf {
        self.base_dir().join(IDENTITY_FILE)
    }

    pub fn transport_config(&self) -> TransportConfig {
        TransportConfig {
            connect_timeout: Duration::from_secs(self.connect_timeout_secs),
            max_payload_len: self.max_payload_bytes,
            max_pending_frames: self.max_pending_frames,
            max_pending_bytes: self.max_pending_bytes,
        }
    }

    fn base_dir(&self) -> PathBuf {
        self.config_file_path
            .parent()
            .map(Path::to_path_buf)
            .unwrap_or_default()
    }

    fn validate(&self) -> Result<()> {
        if self.max_payload_bytes > MAX_PAYLOAD_LEN {
            anyhow::bail!(
                "max_payload_bytes {} exceeds the protocol limit of {} bytes",
                self.max_payload_bytes,
                MAX_PAYLOAD_LEN
            );
        }
        if self.connect_timeout_secs == 0 {
            anyhow::bail!("connect_timeout_secs must be greater than zero");
        }
        Ok(())
    }

    pub fn config_dir() -> Result<PathBuf> {
        if let Some(dir) = std::env::var_os(CONFIG_DIR_ENV) {
            return Ok(PathBuf::from(dir));
        }

        let config_dir = dirs::config_dir()
            .ok_or_else(|| anyhow::anyhow!("Could not determine config directory"))?
            .join("peerchat");

        Ok(config_dir)
    }
}
