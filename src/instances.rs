//! Persisted instance configuration (the "instances file")
//!
//! One INI section per configured instance:
//!
//! ```ini
//! [alpha]
//! _backend = bankmod
//! _enabled = 1
//! login = x
//! password = hunter2
//! ```
//!
//! `_backend` names the module (`_type` is read as a legacy alias), `_enabled`
//! toggles whether the orchestrator loads the entry, and every other key is a
//! module parameter kept verbatim.

use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use std::sync::{Mutex, PoisonError};

use ini::{Ini, ParseOption, Properties};

use crate::persist::write_atomic;
use crate::{Error, Result};

const MODULE_KEY: &str = "_backend";
const LEGACY_MODULE_KEY: &str = "_type";
const ENABLED_KEY: &str = "_enabled";
const RESERVED_KEYS: [&str; 3] = [MODULE_KEY, LEGACY_MODULE_KEY, ENABLED_KEY];

/// One configured instance
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct InstanceConfigEntry {
    /// Instance name, unique in the file
    pub name: String,
    /// Module the instance is created from
    pub module: String,
    /// Module parameters, including private `_` settings
    pub params: BTreeMap<String, String>,
    /// Whether `load_all` includes the instance
    pub enabled: bool,
}

/// File-backed store of [`InstanceConfigEntry`] values
///
/// Every mutation rewrites the file atomically before returning, so a later
/// read never sees a partial write.
#[derive(Debug)]
pub struct InstanceConfigStore {
    path: PathBuf,
    write_lock: Mutex<()>,
}

impl InstanceConfigStore {
    /// Open the instances file at `path`, creating an empty one if needed
    ///
    /// # Errors
    ///
    /// Returns [`Error::WrongPermissions`] if the file is readable by group
    /// or other users, or an IO error if it cannot be created
    pub fn open(path: impl Into<PathBuf>) -> Result<Self> {
        let path = path.into();
        if path.exists() {
            check_permissions(&path)?;
        } else {
            write_atomic(&path, b"")?;
            tracing::info!(path = %path.display(), "created instances file");
        }

        Ok(Self {
            path,
            write_lock: Mutex::new(()),
        })
    }

    /// Location of the instances file
    #[must_use]
    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Every entry that names a module, in file order
    ///
    /// Sections without `_backend` are skipped with a warning.
    ///
    /// # Errors
    ///
    /// Returns error if the file cannot be read or parsed
    pub fn list_entries(&self) -> Result<Vec<InstanceConfigEntry>> {
        let ini = self.read()?;
        let mut entries = Vec::new();
        for (section, props) in &ini {
            let Some(name) = section else { continue };
            match entry_from_section(name, props) {
                Ok(entry) => entries.push(entry),
                Err(e) => tracing::warn!(instance = name, error = %e, "skipping instance"),
            }
        }
        Ok(entries)
    }

    /// Entry for `name`
    ///
    /// # Errors
    ///
    /// Returns [`Error::InstanceNotFound`] if no section has that name and
    /// [`Error::MissingModuleField`] if the section names no module
    pub fn get(&self, name: &str) -> Result<InstanceConfigEntry> {
        validate_name(name)?;
        let ini = self.read()?;
        let props = ini
            .section(Some(name))
            .ok_or_else(|| Error::InstanceNotFound(name.to_string()))?;
        entry_from_section(name, props)
    }

    /// Whether a section named `name` exists
    ///
    /// # Errors
    ///
    /// Returns error if the file cannot be read or parsed
    pub fn exists(&self, name: &str) -> Result<bool> {
        Ok(self.read()?.section(Some(name)).is_some())
    }

    /// Add a new enabled instance
    ///
    /// # Errors
    ///
    /// Returns [`Error::InstanceAlreadyExists`] if the name is taken and
    /// [`Error::InvalidInstanceName`] if it cannot be a section header
    pub fn add(&self, name: &str, module: &str, params: &BTreeMap<String, String>) -> Result<()> {
        validate_name(name)?;
        let _guard = self.write_lock.lock().unwrap_or_else(PoisonError::into_inner);
        let mut ini = self.read()?;
        if ini.section(Some(name)).is_some() {
            return Err(Error::InstanceAlreadyExists(name.to_string()));
        }

        let mut section = ini.with_section(Some(name));
        section.set(MODULE_KEY, module);
        for (key, value) in params {
            if is_module_key(key) {
                continue;
            }
            section.set(key.as_str(), value.as_str());
        }

        self.write(&ini)?;
        tracing::info!(instance = name, module, "added instance");
        Ok(())
    }

    /// Change the module of an existing instance and update its parameters
    ///
    /// Keys present in `params` are replaced; other keys are kept.
    ///
    /// # Errors
    ///
    /// Returns [`Error::InstanceNotFound`] if the instance does not exist
    pub fn edit(&self, name: &str, module: &str, params: &BTreeMap<String, String>) -> Result<()> {
        validate_name(name)?;
        let _guard = self.write_lock.lock().unwrap_or_else(PoisonError::into_inner);
        let mut ini = self.read()?;
        let props = ini
            .section_mut(Some(name))
            .ok_or_else(|| Error::InstanceNotFound(name.to_string()))?;

        props.remove(LEGACY_MODULE_KEY);
        set_value(props, MODULE_KEY, module);
        for (key, value) in params {
            if is_module_key(key) {
                continue;
            }
            set_value(props, key, value);
        }

        self.write(&ini)?;
        tracing::info!(instance = name, module, "edited instance");
        Ok(())
    }

    /// Remove an instance, returning whether it existed
    ///
    /// # Errors
    ///
    /// Returns error if the file cannot be read or written
    pub fn remove(&self, name: &str) -> Result<bool> {
        let _guard = self.write_lock.lock().unwrap_or_else(PoisonError::into_inner);
        let mut ini = self.read()?;
        if ini.delete(Some(name)).is_none() {
            return Ok(false);
        }

        self.write(&ini)?;
        tracing::info!(instance = name, "removed instance");
        Ok(true)
    }

    /// Enable or disable an instance
    ///
    /// # Errors
    ///
    /// Returns [`Error::InstanceNotFound`] if the instance does not exist
    pub fn set_enabled(&self, name: &str, enabled: bool) -> Result<()> {
        validate_name(name)?;
        let _guard = self.write_lock.lock().unwrap_or_else(PoisonError::into_inner);
        let mut ini = self.read()?;
        let props = ini
            .section_mut(Some(name))
            .ok_or_else(|| Error::InstanceNotFound(name.to_string()))?;

        if let Some(module) = props.remove(LEGACY_MODULE_KEY) {
            if !props.contains_key(MODULE_KEY) {
                props.insert(MODULE_KEY, module);
            }
        }
        set_value(props, ENABLED_KEY, if enabled { "1" } else { "0" });

        self.write(&ini)?;
        tracing::info!(instance = name, enabled, "toggled instance");
        Ok(())
    }

    fn read(&self) -> Result<Ini> {
        check_permissions(&self.path)?;
        match std::fs::read_to_string(&self.path) {
            Ok(content) => Ok(Ini::load_from_str_opt(&content, verbatim())?),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(Ini::new()),
            Err(e) => Err(e.into()),
        }
    }

    fn write(&self, ini: &Ini) -> Result<()> {
        let mut buf = Vec::new();
        ini.write_to(&mut buf)?;
        write_atomic(&self.path, &buf)
    }
}

/// Values keep their quotes; only escapes written by `write_to` are undone
fn verbatim() -> ParseOption {
    ParseOption {
        enabled_quote: false,
        ..ParseOption::default()
    }
}

fn entry_from_section(name: &str, props: &Properties) -> Result<InstanceConfigEntry> {
    let module = match (props.get(MODULE_KEY), props.get(LEGACY_MODULE_KEY)) {
        (Some(module), _) => module,
        (None, Some(module)) => {
            tracing::warn!(
                instance = name,
                "\"_type\" is deprecated, it will be rewritten as \"_backend\""
            );
            module
        }
        (None, None) => return Err(Error::MissingModuleField(name.to_string())),
    };

    let params = props
        .iter()
        .filter(|(key, _)| !RESERVED_KEYS.contains(key))
        .map(|(key, value)| (key.to_string(), value.to_string()))
        .collect();

    Ok(InstanceConfigEntry {
        name: name.to_string(),
        module: module.to_string(),
        params,
        enabled: props.get(ENABLED_KEY).is_none_or(is_truthy),
    })
}

fn set_value(props: &mut Properties, key: &str, value: &str) {
    props.remove(key);
    props.insert(key, value);
}

fn is_module_key(key: &str) -> bool {
    key == MODULE_KEY || key == LEGACY_MODULE_KEY
}

/// Whether an `_enabled` value switches the instance on
#[must_use]
pub fn is_truthy(value: &str) -> bool {
    matches!(
        value.trim().to_ascii_lowercase().as_str(),
        "1" | "y" | "true" | "on" | "yes"
    )
}

fn validate_name(name: &str) -> Result<()> {
    let unusable = name.trim().is_empty()
        || name.trim() != name
        || name.contains(['[', ']', '\n', '\r']);
    if unusable {
        return Err(Error::InvalidInstanceName(name.to_string()));
    }
    Ok(())
}

#[cfg(unix)]
fn check_permissions(path: &Path) -> Result<()> {
    use std::os::unix::fs::PermissionsExt;

    match std::fs::metadata(path) {
        Ok(meta) if meta.permissions().mode() & 0o044 != 0 => {
            Err(Error::WrongPermissions(path.to_path_buf()))
        }
        Ok(_) => Ok(()),
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(()),
        Err(e) => Err(e.into()),
    }
}

#[cfg(not(unix))]
fn check_permissions(_path: &Path) -> Result<()> {
    Ok(())
}
