//! Configuration file handling

use serde::Deserialize;
use std::path::{Path, PathBuf};

use super::paths;
use super::{Error, Result};

/// Main configuration structure
#[derive(Debug, Deserialize, Default)]
pub struct Config {
    /// HTTP server settings
    #[serde(default)]
    pub server: ServerConfig,

    /// Registry settings
    #[serde(default)]
    pub registry: RegistryConfig,

    /// Engine settings
    #[serde(default)]
    pub engine: EngineConfig,

    /// Scratch storage settings
    #[serde(default)]
    pub storage: StorageConfig,
}

/// HTTP server configuration
#[derive(Debug, Deserialize)]
pub struct ServerConfig {
    /// Bind address for the daemon
    #[serde(default = "default_host")]
    pub host: String,

    /// Bind port for the daemon
    #[serde(default = "default_port")]
    pub port: u16,

    /// Heartbeat event interval during a run, in seconds
    #[serde(default = "default_heartbeat")]
    pub heartbeat_secs: u64,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            host: default_host(),
            port: default_port(),
            heartbeat_secs: default_heartbeat(),
        }
    }
}

fn default_host() -> String {
    "127.0.0.1".to_string()
}
fn default_port() -> u16 {
    4774
}
fn default_heartbeat() -> u64 {
    10
}

/// Registry configuration
#[derive(Debug, Deserialize)]
pub struct RegistryConfig {
    /// Directory scanned for suite manifests at startup
    #[serde(default = "default_manifest_dir")]
    pub manifest_dir: PathBuf,
}

impl Default for RegistryConfig {
    fn default() -> Self {
        Self {
            manifest_dir: default_manifest_dir(),
        }
    }
}

fn default_manifest_dir() -> PathBuf {
    PathBuf::from("tests/suites")
}

/// Engine configuration
#[derive(Debug, Deserialize)]
pub struct EngineConfig {
    /// Command interpreter used to execute test commands
    #[serde(default = "default_shell")]
    pub shell: String,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            shell: default_shell(),
        }
    }
}

fn default_shell() -> String {
    "sh".to_string()
}

impl EngineConfig {
    /// Resolve the configured shell to an executable path
    ///
    /// Absolute and relative paths are taken as-is; bare names are searched
    /// in PATH.
    pub fn resolve_shell(&self) -> Result<PathBuf> {
        let candidate = Path::new(&self.shell);
        if candidate.components().count() > 1 || candidate.is_absolute() {
            return Ok(candidate.to_path_buf());
        }
        which::which(&self.shell).map_err(|_| Error::ShellNotFound(self.shell.clone()))
    }
}

/// Scratch storage configuration
#[derive(Debug, Deserialize, Default)]
pub struct StorageConfig {
    /// Directory whose collections are wiped between runs
    ///
    /// Defaults to the platform data directory when unset.
    #[serde(default)]
    pub data_dir: Option<PathBuf>,
}

impl StorageConfig {
    /// Effective scratch directory
    pub fn effective_data_dir(&self) -> Result<PathBuf> {
        if let Some(dir) = &self.data_dir {
            return Ok(dir.clone());
        }
        paths::default_data_dir()
            .ok_or_else(|| Error::Config("could not determine a scratch data directory".to_string()))
    }
}

impl Config {
    /// Load configuration from the default config file
    ///
    /// Returns default configuration if the file doesn't exist.
    pub fn load() -> Result<Self> {
        if let Some(path) = paths::config_path() {
            if path.exists() {
                return Self::load_from(&path);
            }
        }
        Ok(Self::default())
    }

    /// Load configuration from an explicit path
    pub fn load_from(path: &Path) -> Result<Self> {
        let content = std::fs::read_to_string(path).map_err(|e| Error::FileRead {
            path: path.display().to_string(),
            error: e.to_string(),
        })?;
        toml::from_str(&content).map_err(|e| Error::ConfigParse(e.to_string()))
    }

    /// Base URL of the daemon HTTP surface
    pub fn daemon_url(&self) -> String {
        format!("http://{}:{}", self.server.host, self.server.port)
    }
}
