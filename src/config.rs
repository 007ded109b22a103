use crate::virtual_controller::{Backend, Mode};
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};

const CONFIG_FILENAME: &str = "padlink_config.json";

#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("Failed to read {path:?}: {source}")]
    Read {
        path: PathBuf,
        source: std::io::Error,
    },
    #[error("Failed to parse {path:?}: {source}")]
    Parse {
        path: PathBuf,
        source: serde_json::Error,
    },
    #[error("Port must not be 0")]
    InvalidPort,
    #[error("Heartbeat interval must be at least one second")]
    InvalidHeartbeat,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ServerConfig {
    pub host: String,
    pub port: u16,
    /// Controller personality new sessions start with
    pub default_mode: Mode,
    pub backend: Backend,
    /// Seconds between WebSocket pings
    pub heartbeat_secs: u64,
    /// Directory with the browser client, served under the path prefix
    pub web_root: Option<PathBuf>,
    pub show_window: bool,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            host: "0.0.0.0".to_string(),
            port: 35714,
            default_mode: Mode::Ds4,
            backend: Backend::Native,
            heartbeat_secs: 2,
            web_root: None,
            show_window: true,
        }
    }
}

impl ServerConfig {
    /// Config next to the executable, or defaults when missing or broken
    pub fn load() -> Self {
        Self::load_or_init(&Self::config_path())
    }

    /// Load `path`; a missing file is created with the defaults so it can be edited
    pub fn load_or_init(path: &Path) -> Self {
        if !path.exists() {
            log::info!("No config at {:?}, writing defaults", path);
            let config = Self::default();
            if let Err(e) = config.save_to(path) {
                log::warn!("Could not write default config: {:#}", e);
            }
            return config;
        }
        match Self::load_from(path) {
            Ok(config) => {
                log::info!("Loaded config from {:?}", path);
                config
            }
            Err(e) => {
                log::error!("{}, using defaults", e);
                Self::default()
            }
        }
    }

    pub fn load_from(path: &Path) -> Result<Self, ConfigError> {
        let contents = std::fs::read_to_string(path).map_err(|source| ConfigError::Read {
            path: path.to_path_buf(),
            source,
        })?;
        let config: Self =
            serde_json::from_str(&contents).map_err(|source| ConfigError::Parse {
                path: path.to_path_buf(),
                source,
            })?;
        config.validate()?;
        Ok(config)
    }

    pub fn save_to(&self, path: &Path) -> anyhow::Result<()> {
        let contents = serde_json::to_string_pretty(self)?;
        std::fs::write(path, contents)?;
        log::info!("Saved config to {:?}", path);
        Ok(())
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.port == 0 {
            return Err(ConfigError::InvalidPort);
        }
        if self.heartbeat_secs == 0 {
            return Err(ConfigError::InvalidHeartbeat);
        }
        Ok(())
    }

    pub fn config_path() -> PathBuf {
        exe_dir().join(CONFIG_FILENAME)
    }
}

/// Directory holding the executable, falling back to the working directory
pub fn exe_dir() -> PathBuf {
    std::env::current_exe()
        .ok()
        .and_then(|p| p.parent().map(|p| p.to_path_buf()))
        .unwrap_or_else(|| PathBuf::from("."))
}
