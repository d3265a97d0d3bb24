use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};

use crate::error::{GantryError, Result};

/// Top-level Gantry configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EngineConfig {
    /// Directory searched when resolving sub-workflow references by name.
    #[serde(default = "default_workflows_dir")]
    pub workflows_dir: PathBuf,
    /// Directory where per-run log files are written.
    #[serde(default = "default_logs_dir")]
    pub logs_dir: PathBuf,
    /// Default tracing filter when RUST_LOG is unset.
    #[serde(default = "default_log_level")]
    pub log_level: String,
}

fn default_workflows_dir() -> PathBuf {
    PathBuf::from("workflows")
}

fn default_logs_dir() -> PathBuf {
    PathBuf::from("logs")
}

fn default_log_level() -> String {
    "gantry=info,warn".to_string()
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            workflows_dir: default_workflows_dir(),
            logs_dir: default_logs_dir(),
            log_level: default_log_level(),
        }
    }
}

impl EngineConfig {
    /// Load config from a TOML file.
    pub fn load(path: &Path) -> Result<Self> {
        let content = std::fs::read_to_string(path)
            .map_err(|_| GantryError::Config(format!("config file not found: {}", path.display())))?;
        toml::from_str(&content).map_err(|e| GantryError::Config(e.to_string()))
    }

    /// Load config from a TOML file if it exists, otherwise defaults.
    pub fn load_or_default(path: &Path) -> Result<Self> {
        if path.exists() {
            Self::load(path)
        } else {
            Ok(Self::default())
        }
    }
}
