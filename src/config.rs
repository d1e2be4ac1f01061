// src/config.rs
use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use tracing::{debug, info};
use xdg::BaseDirectories;

pub const APP_NAME: &str = "rediacc";
pub const DEFAULT_CONFIG_FILENAME: &str = "config.toml";
pub const DEFAULT_STATE_FILENAME: &str = "plugin-connections.json";
pub const API_BINARY_ENV: &str = "REDIACC_CLI";

// Main configuration structure, mapping to config.toml
#[derive(Deserialize, Serialize, Debug, Clone, Default)]
#[serde(deny_unknown_fields)]
pub struct Config {
    #[serde(default)]
    pub api: ApiConfig,
    #[serde(default)]
    pub tunnel: TunnelConfig,
    #[serde(default)]
    pub paths: PathsConfig,
    #[serde(default)]
    pub logging: LoggingConfig,
}

#[derive(Deserialize, Serialize, Debug, Clone)]
#[serde(deny_unknown_fields)]
pub struct ApiConfig {
    #[serde(default = "default_api_binary")]
    pub binary: String, // rediacc-cli executable, looked up on PATH unless absolute
    #[serde(default = "default_api_timeout_secs")]
    pub timeout_secs: u64,
}

fn default_api_binary() -> String {
    "rediacc-cli".to_string()
}
fn default_api_timeout_secs() -> u64 {
    60
}

impl Default for ApiConfig {
    fn default() -> Self {
        ApiConfig {
            binary: default_api_binary(),
            timeout_secs: default_api_timeout_secs(),
        }
    }
}

#[derive(Deserialize, Serialize, Debug, Clone)]
#[serde(deny_unknown_fields)]
pub struct TunnelConfig {
    #[serde(default = "default_port_range_start")]
    pub port_range_start: u16,
    #[serde(default = "default_port_range_end")]
    pub port_range_end: u16,
    #[serde(default = "default_liveness_wait_ms")]
    pub liveness_wait_ms: u64, // socat bridge: how long a fresh tunnel must survive
    #[serde(default = "default_probe_timeout_secs")]
    pub probe_timeout_secs: u64,
    #[serde(default = "default_connect_timeout_secs")]
    pub connect_timeout_secs: u64,
    #[serde(default = "default_terminate_grace_ms")]
    pub terminate_grace_ms: u64,
    #[serde(default)]
    pub control_dir: Option<String>, // ControlMaster sockets; defaults to $TMPDIR/rediacc-plugin
}

fn default_port_range_start() -> u16 {
    7111
}
fn default_port_range_end() -> u16 {
    9111
}
fn default_liveness_wait_ms() -> u64 {
    2000
}
fn default_probe_timeout_secs() -> u64 {
    5
}
fn default_connect_timeout_secs() -> u64 {
    10
}
fn default_terminate_grace_ms() -> u64 {
    500
}

impl Default for TunnelConfig {
    fn default() -> Self {
        TunnelConfig {
            port_range_start: default_port_range_start(),
            port_range_end: default_port_range_end(),
            liveness_wait_ms: default_liveness_wait_ms(),
            probe_timeout_secs: default_probe_timeout_secs(),
            connect_timeout_secs: default_connect_timeout_secs(),
            terminate_grace_ms: default_terminate_grace_ms(),
            control_dir: None,
        }
    }
}

#[derive(Deserialize, Serialize, Debug, Clone, Default)]
#[serde(deny_unknown_fields)]
pub struct PathsConfig {
    #[serde(default)]
    pub state_file: Option<String>, // Path, can use ~
}

#[derive(Deserialize, Serialize, Debug, Clone)]
#[serde(deny_unknown_fields)]
pub struct LoggingConfig {
    #[serde(default = "default_log_level")]
    pub level: String, // "trace", "debug", "info", "warn", "error"
    #[serde(default = "default_log_dir")]
    pub log_dir: String, // Path, can use ~
    #[serde(default)]
    pub file: bool,
}

fn default_log_level() -> String {
    "warn".to_string()
}
fn default_log_dir() -> String {
    "~/.rediacc/logs".to_string()
}

impl Default for LoggingConfig {
    fn default() -> Self {
        LoggingConfig {
            level: default_log_level(),
            log_dir: default_log_dir(),
            file: false,
        }
    }
}

impl Config {
    /// Loads `config.toml`. An explicit path must exist; the XDG default is
    /// optional and falls back to built-in defaults.
    pub fn load(config_path_override: Option<&Path>) -> Result<Self> {
        let config_path = match config_path_override {
            Some(path) => {
                debug!("Using provided config path override: {}", path.display());
                path.to_path_buf()
            }
            None => {
                let xdg_dirs = BaseDirectories::with_prefix(APP_NAME)?;
                match xdg_dirs.find_config_file(DEFAULT_CONFIG_FILENAME) {
                    Some(path) => path,
                    None => {
                        debug!("No {} found, using defaults", DEFAULT_CONFIG_FILENAME);
                        return Ok(Config::default());
                    }
                }
            }
        };

        info!("Loading configuration from {}", config_path.display());
        let config_str = std::fs::read_to_string(&config_path)
            .with_context(|| format!("Failed to read config file at {}", config_path.display()))?;

        Self::from_toml_str(&config_str)
    }

    pub fn from_toml_str(config_str: &str) -> Result<Self> {
        let config: Config =
            toml::from_str(config_str).with_context(|| "Failed to parse TOML configuration")?;
        if config.tunnel.port_range_start > config.tunnel.port_range_end {
            anyhow::bail!(
                "Invalid port range {}-{}",
                config.tunnel.port_range_start,
                config.tunnel.port_range_end
            );
        }
        Ok(config)
    }

    /// The API binary, honouring the `REDIACC_CLI` environment override.
    pub fn api_binary(&self) -> String {
        std::env::var(API_BINARY_ENV)
            .ok()
            .filter(|value| !value.is_empty())
            .unwrap_or_else(|| self.api.binary.clone())
    }

    pub fn state_file_path(&self) -> Result<PathBuf> {
        if let Some(path) = &self.paths.state_file {
            return Ok(PathBuf::from(shellexpand::tilde(path).into_owned()));
        }
        let xdg_dirs = BaseDirectories::with_prefix(APP_NAME)?;
        Ok(xdg_dirs.get_config_home().join(DEFAULT_STATE_FILENAME))
    }

    pub fn control_dir(&self) -> PathBuf {
        match &self.tunnel.control_dir {
            Some(dir) => PathBuf::from(shellexpand::tilde(dir).into_owned()),
            None => std::env::temp_dir().join("rediacc-plugin"),
        }
    }

    pub fn log_dir(&self) -> PathBuf {
        PathBuf::from(shellexpand::tilde(&self.logging.log_dir).into_owned())
    }
}
