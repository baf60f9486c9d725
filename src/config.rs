//! Repository configuration.
//!
//! Loaded from a TOML file or built in code. The `data` directory is the
//! disk driver's backing root; `index` names the id index file kept inside
//! it (set `index = false` in TOML to disable persistence of ids).

use crate::error::{Result, TreeError};
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};

/// Default id index file name inside the data directory.
pub const DEFAULT_INDEX_FILE: &str = ".treedb-index.json";

/// Index persistence setting.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum IndexSetting {
    /// `false` disables the index (ids regenerate every open).
    Enabled(bool),
    /// A custom file name relative to the data directory.
    File(String),
}

impl Default for IndexSetting {
    fn default() -> Self {
        IndexSetting::Enabled(true)
    }
}

/// Repository configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Config {
    /// Relative or absolute path to the backing data directory.
    pub data: PathBuf,

    /// Id index persistence.
    #[serde(default)]
    pub index: IndexSetting,

    /// Authority listen address for the `serve` binary.
    #[serde(default)]
    pub listen: Option<String>,
}

impl Default for Config {
    fn default() -> Self {
        Config {
            data: PathBuf::from("data"),
            index: IndexSetting::default(),
            listen: None,
        }
    }
}

impl Config {
    /// Load from a TOML file, resolving `data` against the file's directory.
    pub fn load(path: &Path) -> Result<Config> {
        let raw = std::fs::read_to_string(path)?;
        let mut config: Config = toml::from_str(&raw)
            .map_err(|e| TreeError::Config(format!("{}: {}", path.display(), e)))?;
        if config.data.is_relative() {
            if let Some(dir) = path.parent() {
                config.data = dir.join(&config.data);
            }
        }
        Ok(config)
    }

    /// The id index path inside the data directory, or `None` when disabled.
    pub fn index_path(&self) -> Option<PathBuf> {
        match &self.index {
            IndexSetting::Enabled(false) => None,
            IndexSetting::Enabled(true) => Some(self.data.join(DEFAULT_INDEX_FILE)),
            IndexSetting::File(name) => Some(self.data.join(name)),
        }
    }
}
