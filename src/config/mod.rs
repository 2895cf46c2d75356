//! Configuration management for switchyard

pub mod file;

use std::path::{Path, PathBuf};

use crate::dispatch::DEFAULT_BUFFER;
use crate::modules::default_module_dirs;
use crate::{Error, Result};

/// Framework configuration
#[derive(Debug, Clone)]
pub struct Config {
    /// Working directory (instances file, local modules)
    pub workdir: PathBuf,

    /// Path to the instances file
    pub instances_file: PathBuf,

    /// Directories scanned for module descriptors, in priority order
    pub module_dirs: Vec<PathBuf>,

    /// Version every loaded module must declare
    pub framework_version: String,

    /// Pending items buffered per dispatch
    pub dispatch_buffer: usize,

    /// JSON file backing per-backend storage, if any
    pub storage_file: Option<PathBuf>,
}

/// Default working directory: `~/.config/switchyard/`
fn default_workdir() -> PathBuf {
    directories::BaseDirs::new().map_or_else(
        || PathBuf::from(".config/switchyard"),
        |d| d.config_dir().join("switchyard"),
    )
}

impl Config {
    /// Defaults rooted at `workdir`, ignoring files and environment
    #[must_use]
    pub fn for_workdir(workdir: impl Into<PathBuf>) -> Self {
        let workdir = workdir.into();
        Self {
            instances_file: workdir.join("backends"),
            module_dirs: default_module_dirs(&workdir),
            framework_version: env!("CARGO_PKG_VERSION").to_string(),
            dispatch_buffer: DEFAULT_BUFFER,
            storage_file: None,
            workdir,
        }
    }

    /// Load configuration (env > toml > default)
    ///
    /// # Errors
    ///
    /// Returns error if an environment override is malformed
    pub fn load() -> Result<Self> {
        Self::from_file(file::load_config_file())
    }

    /// Apply a parsed config file and the environment on top of defaults
    ///
    /// # Errors
    ///
    /// Returns error if an environment override is malformed
    pub fn from_file(fc: file::SwitchyardConfigFile) -> Result<Self> {
        let workdir = std::env::var("SWITCHYARD_WORKDIR")
            .ok()
            .map(PathBuf::from)
            .or(fc.workdir)
            .unwrap_or_else(default_workdir);

        let mut config = Self::for_workdir(&workdir);

        if let Some(instances_file) = fc.instances_file {
            config.instances_file = resolve(&workdir, instances_file);
        }

        config.module_dirs = match std::env::var("SWITCHYARD_MODULE_PATH") {
            Ok(paths) => std::env::split_paths(&paths)
                .filter(|p| !p.as_os_str().is_empty())
                .collect(),
            Err(_) => fc.module_dirs.map_or(config.module_dirs, |dirs| {
                dirs.into_iter().map(|dir| resolve(&workdir, dir)).collect()
            }),
        };

        config.dispatch_buffer = match std::env::var("SWITCHYARD_DISPATCH_BUFFER") {
            Ok(value) => value.parse().map_err(|_| {
                Error::Config(format!("SWITCHYARD_DISPATCH_BUFFER is not a number: {value}"))
            })?,
            Err(_) => fc.dispatch.buffer.unwrap_or(DEFAULT_BUFFER),
        };
        if config.dispatch_buffer == 0 {
            return Err(Error::Config("dispatch buffer must be at least 1".to_string()));
        }

        config.storage_file = fc.storage.file.map(|path| resolve(&workdir, path));

        tracing::debug!(
            workdir = %config.workdir.display(),
            instances_file = %config.instances_file.display(),
            module_dirs = ?config.module_dirs,
            "configuration loaded"
        );
        Ok(config)
    }
}

fn resolve(base: &Path, path: PathBuf) -> PathBuf {
    if path.is_absolute() {
        path
    } else {
        base.join(path)
    }
}
