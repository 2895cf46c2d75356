//! TOML configuration file loading
//!
//! Supports `~/.config/switchyard/config.toml` as a persistent config source.
//! All fields are optional; the file is a partial overlay on top of defaults.

use std::path::{Path, PathBuf};

use serde::Deserialize;

use crate::Result;

/// Top-level TOML configuration file schema
#[derive(Debug, Default, Deserialize)]
pub struct SwitchyardConfigFile {
    /// Working directory holding the instances file and local modules
    #[serde(default)]
    pub workdir: Option<PathBuf>,

    /// Instances file, relative paths resolve against the working directory
    #[serde(default)]
    pub instances_file: Option<PathBuf>,

    /// Module search directories, replacing the defaults
    #[serde(default)]
    pub module_dirs: Option<Vec<PathBuf>>,

    /// Dispatch settings
    #[serde(default)]
    pub dispatch: DispatchFileConfig,

    /// Backend storage settings
    #[serde(default)]
    pub storage: StorageFileConfig,
}

impl SwitchyardConfigFile {
    /// Parse the TOML text of a config file
    ///
    /// # Errors
    ///
    /// Returns [`crate::Error::Toml`] when the text is not a valid config file
    pub fn parse(content: &str) -> Result<Self> {
        Ok(toml::from_str(content)?)
    }
}

/// Dispatch-related configuration
#[derive(Debug, Default, Deserialize)]
pub struct DispatchFileConfig {
    /// Pending items buffered per dispatch before workers wait
    #[serde(default)]
    pub buffer: Option<usize>,
}

/// Storage-related configuration
#[derive(Debug, Default, Deserialize)]
pub struct StorageFileConfig {
    /// JSON file holding every backend's stored values
    #[serde(default)]
    pub file: Option<PathBuf>,
}

/// Load the TOML config file from the standard path
///
/// Returns `SwitchyardConfigFile::default()` if the file doesn't exist or
/// can't be parsed.
pub fn load_config_file() -> SwitchyardConfigFile {
    config_file_path().map_or_else(SwitchyardConfigFile::default, |path| load_from(&path))
}

/// Load a TOML config file from `path`, falling back to defaults
pub fn load_from(path: &Path) -> SwitchyardConfigFile {
    if !path.exists() {
        return SwitchyardConfigFile::default();
    }

    match std::fs::read_to_string(path) {
        Ok(content) => match SwitchyardConfigFile::parse(&content) {
            Ok(config) => {
                tracing::info!(path = %path.display(), "loaded config file");
                config
            }
            Err(e) => {
                tracing::warn!(
                    path = %path.display(),
                    error = %e,
                    "failed to parse config file, using defaults"
                );
                SwitchyardConfigFile::default()
            }
        },
        Err(e) => {
            tracing::warn!(
                path = %path.display(),
                error = %e,
                "failed to read config file"
            );
            SwitchyardConfigFile::default()
        }
    }
}

/// Return the config file path: `~/.config/switchyard/config.toml`
pub fn config_file_path() -> Option<PathBuf> {
    directories::BaseDirs::new().map(|d| d.config_dir().join("switchyard").join("config.toml"))
}
