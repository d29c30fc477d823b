//! forcectl configuration types and loading

use std::fs;
use std::path::{Path, PathBuf};
use std::time::Duration;

use eyre::{Context, Result};
use serde::{Deserialize, Serialize};
use tracing::debug;

use crate::channel::{DEFAULT_TAG, PARTITION_TAG};
use crate::handler::{DEFAULT_MAX_GRID_NODES, DEFAULT_PROGRESS_EVERY};

/// Main forcectl configuration
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct Config {
    /// Controller loop settings
    pub controller: ControllerConfig,

    /// Socket transport settings
    pub transport: TransportConfig,

    /// Log level (TRACE, DEBUG, INFO, WARN, ERROR)
    #[serde(rename = "log-level", skip_serializing_if = "Option::is_none")]
    pub log_level: Option<String>,
}

/// Which request handler a controller runs
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize, clap::ValueEnum)]
#[serde(rename_all = "lowercase")]
pub enum HandlerMode {
    /// Independent per-atom corrections for `request` messages
    #[default]
    Atoms,
    /// Lattice sampling for `gridRequest` messages
    Grid,
    /// Whole-step `request` batches answered once every peer has reported
    Dependent,
}

/// Controller loop configuration
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ControllerConfig {
    /// Abort after this long without traffic once a peer has registered
    #[serde(rename = "max-idle-ms")]
    pub max_idle_ms: u64,

    /// Longest single wait for the next message
    #[serde(rename = "poll-interval-ms")]
    pub poll_interval_ms: u64,

    /// Requests between progress notifications (0 disables)
    #[serde(rename = "progress-every")]
    pub progress_every: u64,

    /// Partition tag for controller traffic
    #[serde(rename = "partition-tag")]
    pub partition_tag: u32,

    /// Handler to run
    pub mode: HandlerMode,

    /// Largest lattice a grid request may ask for
    #[serde(rename = "max-grid-nodes")]
    pub max_grid_nodes: u64,
}

fn default_max_idle_ms() -> u64 {
    debug!("default_max_idle_ms: called");
    10_000
}

fn default_poll_interval_ms() -> u64 {
    debug!("default_poll_interval_ms: called");
    100
}

impl Default for ControllerConfig {
    fn default() -> Self {
        Self {
            max_idle_ms: default_max_idle_ms(),
            poll_interval_ms: default_poll_interval_ms(),
            progress_every: DEFAULT_PROGRESS_EVERY,
            partition_tag: PARTITION_TAG,
            mode: HandlerMode::default(),
            max_grid_nodes: DEFAULT_MAX_GRID_NODES,
        }
    }
}

impl ControllerConfig {
    pub fn max_idle(&self) -> Duration {
        Duration::from_millis(self.max_idle_ms)
    }

    pub fn poll_interval(&self) -> Duration {
        Duration::from_millis(self.poll_interval_ms)
    }
}

/// Socket transport configuration
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct TransportConfig {
    /// Directory holding partition sockets
    #[serde(rename = "socket-dir")]
    pub socket_dir: PathBuf,

    /// How long the shutdown barrier waits for peers to hang up
    #[serde(rename = "barrier-timeout-ms")]
    pub barrier_timeout_ms: u64,
}

fn default_socket_dir() -> PathBuf {
    debug!("default_socket_dir: called");
    dirs::runtime_dir()
        .or_else(dirs::data_local_dir)
        .unwrap_or_else(|| PathBuf::from("/tmp"))
        .join("forcectl")
}

impl Default for TransportConfig {
    fn default() -> Self {
        Self {
            socket_dir: default_socket_dir(),
            barrier_timeout_ms: 5000,
        }
    }
}

impl TransportConfig {
    pub fn barrier_timeout(&self) -> Duration {
        Duration::from_millis(self.barrier_timeout_ms)
    }
}

impl Config {
    /// Check values that would make the controller misbehave
    pub fn validate(&self) -> Result<()> {
        let c = &self.controller;
        if c.poll_interval_ms == 0 {
            return Err(eyre::eyre!("poll-interval-ms must be greater than zero"));
        }
        if c.max_idle_ms == 0 {
            return Err(eyre::eyre!("max-idle-ms must be greater than zero"));
        }
        if c.partition_tag == DEFAULT_TAG {
            return Err(eyre::eyre!(
                "partition-tag {} collides with the host's default tag",
                DEFAULT_TAG
            ));
        }
        Ok(())
    }

    /// Load configuration with fallback chain
    pub fn load(config_path: Option<&PathBuf>) -> Result<Self> {
        // If explicit config path provided, try to load it
        if let Some(path) = config_path {
            return Self::load_from_file(path).context(format!("Failed to load config from {}", path.display()));
        }

        // Try project-local config: ./forcectl.yml
        let local_config = PathBuf::from("forcectl.yml");
        if local_config.exists() {
            match Self::load_from_file(&local_config) {
                Ok(config) => return Ok(config),
                Err(e) => {
                    tracing::warn!("Failed to load config from {}: {}", local_config.display(), e);
                }
            }
        }

        // Try user config: ~/.config/forcectl/forcectl.yml
        if let Some(config_dir) = dirs::config_dir() {
            let user_config = config_dir.join("forcectl").join("forcectl.yml");
            if user_config.exists() {
                match Self::load_from_file(&user_config) {
                    Ok(config) => return Ok(config),
                    Err(e) => {
                        tracing::warn!("Failed to load config from {}: {}", user_config.display(), e);
                    }
                }
            }
        }

        tracing::info!("No config file found, using defaults");
        Ok(Self::default())
    }

    /// Read just the log level, before logging is set up
    pub fn load_log_level(config_path: Option<&PathBuf>) -> Option<String> {
        Self::load(config_path).ok().and_then(|c| c.log_level)
    }

    fn load_from_file<P: AsRef<Path>>(path: P) -> Result<Self> {
        let content = fs::read_to_string(&path).context("Failed to read config file")?;

        let config: Self = serde_yaml::from_str(&content).context("Failed to parse config file")?;

        tracing::info!("Loaded config from: {}", path.as_ref().display());
        Ok(config)
    }

    /// Render as YAML
    pub fn to_yaml(&self) -> Result<String> {
        serde_yaml::to_string(self).context("Failed to serialize config")
    }
}
