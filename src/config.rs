use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use tracing::{debug, info};

use crate::error::{map_io_err, ToolHostResult};

/// Environment variable that overrides the configured plugin root.
pub const PLUGIN_ROOT_ENV: &str = "TOOLHOST_PLUGIN_ROOT";

/// Server configuration, loaded from `toolhost.toml` when present.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ServerConfig {
    /// Directory scanned for plugin subdirectories.
    #[serde(default = "default_plugin_root")]
    pub plugin_root: PathBuf,

    /// Timeout for one tool execution, in seconds.
    #[serde(default = "default_execution_timeout")]
    pub execution_timeout_secs: u64,

    /// Timeout for one introspection pass, in seconds.
    #[serde(default = "default_introspection_timeout")]
    pub introspection_timeout_secs: u64,

    /// Timeout for a dependency installation, in seconds.
    #[serde(default = "default_install_timeout")]
    pub install_timeout_secs: u64,

    /// Maximum number of retained change-log entries.
    #[serde(default = "default_change_log_capacity")]
    pub change_log_capacity: usize,
}

fn default_plugin_root() -> PathBuf {
    PathBuf::from("plugins")
}

fn default_execution_timeout() -> u64 {
    60
}

fn default_introspection_timeout() -> u64 {
    60
}

fn default_install_timeout() -> u64 {
    600
}

fn default_change_log_capacity() -> usize {
    50
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            plugin_root: default_plugin_root(),
            execution_timeout_secs: default_execution_timeout(),
            introspection_timeout_secs: default_introspection_timeout(),
            install_timeout_secs: default_install_timeout(),
            change_log_capacity: default_change_log_capacity(),
        }
    }
}

/// Per-user fallback config location (`~/.config/toolhost/toolhost.toml`
/// on Linux).
pub fn user_config_path() -> Option<PathBuf> {
    dirs::config_dir().map(|dir| dir.join("toolhost").join("toolhost.toml"))
}

impl ServerConfig {
    /// Load configuration from a TOML file. When the file does not exist,
    /// fall back to the per-user config, then to defaults.
    pub fn load(path: &Path) -> ToolHostResult<Self> {
        if !path.exists() {
            if let Some(user_path) = user_config_path() {
                if user_path.exists() {
                    return Self::load(&user_path);
                }
            }
            debug!("No config file at {}, using defaults", path.display());
            return Ok(Self::default());
        }

        let content = std::fs::read_to_string(path).map_err(map_io_err(path))?;
        let config: ServerConfig = toml::from_str(&content)?;
        info!("Loaded configuration from {}", path.display());
        Ok(config)
    }

    /// Apply overrides from the process environment.
    pub fn apply_env_overrides(mut self) -> Self {
        if let Ok(root) = std::env::var(PLUGIN_ROOT_ENV) {
            if !root.is_empty() {
                self.plugin_root = PathBuf::from(root);
            }
        }
        self
    }
}
