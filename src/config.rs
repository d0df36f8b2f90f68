//! Configuration file support for finca-migrate
//!
//! Reads from .fincafacil/config.toml

use crate::error::{Error, Result};
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};

/// Directory holding the config file, looked up like git looks up `.git`
pub const CONFIG_DIR: &str = ".fincafacil";

/// Configuration structure
#[derive(Debug, Deserialize, Serialize, Default, Clone)]
pub struct Config {
    /// Database location and connection settings
    #[serde(default)]
    pub database: DatabaseConfig,

    /// Table rebuild settings
    #[serde(default)]
    pub rebuild: RebuildConfig,

    /// Logging settings
    #[serde(default)]
    pub log: LogConfig,

    /// Directory the config file was loaded from (not serialized)
    #[serde(skip)]
    base_dir: Option<PathBuf>,
}

/// Database-related configuration
#[derive(Debug, Deserialize, Serialize, Clone)]
pub struct DatabaseConfig {
    /// Path to the SQLite file, relative to the directory containing `.fincafacil/`
    #[serde(default)]
    pub path: Option<PathBuf>,

    /// How long a connection waits on a locked database
    /// Default: 5000
    #[serde(default = "default_busy_timeout_ms")]
    pub busy_timeout_ms: u64,
}

/// Rebuild-related configuration
#[derive(Debug, Deserialize, Serialize, Clone)]
pub struct RebuildConfig {
    /// Run `PRAGMA foreign_key_check` on the rebuilt table before committing
    /// Default: true
    #[serde(default = "default_true")]
    pub verify_foreign_keys: bool,
}

/// Logging configuration
#[derive(Debug, Deserialize, Serialize, Clone)]
pub struct LogConfig {
    /// tracing filter directive used when FINCAFACIL_LOG is unset
    /// Default: "warn"
    #[serde(default = "default_log_level")]
    pub level: String,
}

fn default_busy_timeout_ms() -> u64 {
    5000
}

fn default_true() -> bool {
    true
}

fn default_log_level() -> String {
    "warn".to_string()
}

impl Default for DatabaseConfig {
    fn default() -> Self {
        Self {
            path: None,
            busy_timeout_ms: default_busy_timeout_ms(),
        }
    }
}

impl Default for RebuildConfig {
    fn default() -> Self {
        Self {
            verify_foreign_keys: true,
        }
    }
}

impl Default for LogConfig {
    fn default() -> Self {
        Self {
            level: default_log_level(),
        }
    }
}

impl Config {
    /// Load config from .fincafacil/config.toml
    /// Returns default config if file doesn't exist
    pub fn load() -> Result<Self> {
        match Self::find_config_path() {
            Some(path) => Self::load_from(&path),
            None => Ok(Self::default()),
        }
    }

    /// Load config from an explicit file
    pub fn load_from(path: &Path) -> Result<Self> {
        let contents = std::fs::read_to_string(path)
            .map_err(|e| Error::Config(format!("{}: {}", path.display(), e)))?;
        let mut config: Config = toml::from_str(&contents)
            .map_err(|e| Error::Config(format!("{}: {}", path.display(), e)))?;
        // .fincafacil/config.toml -> project root
        config.base_dir = path
            .parent()
            .and_then(|dir| dir.parent())
            .map(Path::to_path_buf);
        Ok(config)
    }

    /// Find config.toml by walking up directory tree
    fn find_config_path() -> Option<PathBuf> {
        let current_dir = std::env::current_dir().ok()?;
        let mut dir = current_dir.as_path();

        loop {
            let config_path = dir.join(CONFIG_DIR).join("config.toml");
            if config_path.exists() {
                return Some(config_path);
            }

            match dir.parent() {
                Some(parent) => dir = parent,
                None => break,
            }
        }
        None
    }

    /// Configured database path, resolved against the project root
    pub fn database_path(&self) -> Option<PathBuf> {
        let path = self.database.path.as_ref()?;
        match &self.base_dir {
            Some(base) if path.is_relative() => Some(base.join(path)),
            _ => Some(path.clone()),
        }
    }
}
