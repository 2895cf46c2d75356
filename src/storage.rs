//! Per-backend key/value storage
//!
//! Modules keep small persistent blobs (last seen message id, cached session
//! tokens) here. Each backend instance only sees its own namespace through
//! [`BackendStorage`].

use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex, PoisonError};

use serde::Serialize;
use serde::de::DeserializeOwned;
use serde_json::{Map, Value};

use crate::Result;
use crate::persist::write_atomic;

/// Storage shared by every backend of an orchestrator
pub trait Storage: Send + Sync {
    /// Read a value from `backend`'s namespace
    fn get(&self, backend: &str, key: &str) -> Option<Value>;

    /// Write a value into `backend`'s namespace
    fn set(&self, backend: &str, key: &str, value: Value);

    /// Remove a value, returning whether it existed
    fn delete(&self, backend: &str, key: &str) -> bool;

    /// Persist `backend`'s namespace
    ///
    /// # Errors
    ///
    /// Returns error if the underlying medium could not be written
    fn save(&self, backend: &str) -> Result<()>;
}

type Namespaces = HashMap<String, Map<String, Value>>;

/// Process-lifetime storage, never persisted
#[derive(Debug, Default)]
pub struct MemoryStorage {
    data: Mutex<Namespaces>,
}

impl MemoryStorage {
    /// Create an empty storage
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }
}

impl Storage for MemoryStorage {
    fn get(&self, backend: &str, key: &str) -> Option<Value> {
        let data = self.data.lock().unwrap_or_else(PoisonError::into_inner);
        data.get(backend).and_then(|ns| ns.get(key)).cloned()
    }

    fn set(&self, backend: &str, key: &str, value: Value) {
        let mut data = self.data.lock().unwrap_or_else(PoisonError::into_inner);
        data.entry(backend.to_string())
            .or_default()
            .insert(key.to_string(), value);
    }

    fn delete(&self, backend: &str, key: &str) -> bool {
        let mut data = self.data.lock().unwrap_or_else(PoisonError::into_inner);
        data.get_mut(backend)
            .and_then(|ns| ns.remove(key))
            .is_some()
    }

    fn save(&self, _backend: &str) -> Result<()> {
        Ok(())
    }
}

/// Storage kept in one JSON document on disk
#[derive(Debug)]
pub struct JsonFileStorage {
    path: PathBuf,
    data: Mutex<Namespaces>,
}

impl JsonFileStorage {
    /// Open the storage file, starting empty if it does not exist yet
    ///
    /// # Errors
    ///
    /// Returns error if the file exists but cannot be read or parsed
    pub fn open(path: impl Into<PathBuf>) -> Result<Self> {
        let path = path.into();
        let data = if path.exists() {
            let content = std::fs::read_to_string(&path)?;
            if content.trim().is_empty() {
                Namespaces::new()
            } else {
                serde_json::from_str(&content)?
            }
        } else {
            Namespaces::new()
        };

        tracing::debug!(path = %path.display(), namespaces = data.len(), "opened storage");
        Ok(Self {
            path,
            data: Mutex::new(data),
        })
    }

    /// Location of the storage file
    #[must_use]
    pub fn path(&self) -> &Path {
        &self.path
    }
}

impl Storage for JsonFileStorage {
    fn get(&self, backend: &str, key: &str) -> Option<Value> {
        let data = self.data.lock().unwrap_or_else(PoisonError::into_inner);
        data.get(backend).and_then(|ns| ns.get(key)).cloned()
    }

    fn set(&self, backend: &str, key: &str, value: Value) {
        let mut data = self.data.lock().unwrap_or_else(PoisonError::into_inner);
        data.entry(backend.to_string())
            .or_default()
            .insert(key.to_string(), value);
    }

    fn delete(&self, backend: &str, key: &str) -> bool {
        let mut data = self.data.lock().unwrap_or_else(PoisonError::into_inner);
        data.get_mut(backend)
            .and_then(|ns| ns.remove(key))
            .is_some()
    }

    // The whole document is rewritten; namespaces of other backends ride along.
    fn save(&self, backend: &str) -> Result<()> {
        let content = {
            let data = self.data.lock().unwrap_or_else(PoisonError::into_inner);
            serde_json::to_vec_pretty(&*data)?
        };
        write_atomic(&self.path, &content)?;
        tracing::debug!(path = %self.path.display(), backend, "saved storage");
        Ok(())
    }
}

/// One backend's view of the shared storage
///
/// Without a configured storage, reads return nothing and writes are
/// dropped, so modules never need to special-case it.
#[derive(Clone)]
pub struct BackendStorage {
    name: String,
    storage: Option<Arc<dyn Storage>>,
}

impl BackendStorage {
    /// Scope `storage` to the instance `name`
    #[must_use]
    pub fn new(name: impl Into<String>, storage: Option<Arc<dyn Storage>>) -> Self {
        Self {
            name: name.into(),
            storage,
        }
    }

    /// Read and decode a value
    #[must_use]
    pub fn get<T: DeserializeOwned>(&self, key: &str) -> Option<T> {
        let value = self.storage.as_ref()?.get(&self.name, key)?;
        match serde_json::from_value(value) {
            Ok(v) => Some(v),
            Err(e) => {
                tracing::warn!(backend = %self.name, key, error = %e, "stored value has unexpected shape");
                None
            }
        }
    }

    /// Read a value, falling back to `default`
    #[must_use]
    pub fn get_or<T: DeserializeOwned>(&self, key: &str, default: T) -> T {
        self.get(key).unwrap_or(default)
    }

    /// Encode and write a value
    ///
    /// # Errors
    ///
    /// Returns error if the value cannot be serialized
    pub fn set<T: Serialize>(&self, key: &str, value: &T) -> Result<()> {
        if let Some(storage) = &self.storage {
            storage.set(&self.name, key, serde_json::to_value(value)?);
        }
        Ok(())
    }

    /// Remove a value
    pub fn delete(&self, key: &str) -> bool {
        self.storage
            .as_ref()
            .is_some_and(|storage| storage.delete(&self.name, key))
    }

    /// Persist this backend's values
    ///
    /// # Errors
    ///
    /// Returns error if the storage could not be written
    pub fn save(&self) -> Result<()> {
        match &self.storage {
            Some(storage) => storage.save(&self.name),
            None => Ok(()),
        }
    }
}

impl std::fmt::Debug for BackendStorage {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("BackendStorage")
            .field("name", &self.name)
            .field("configured", &self.storage.is_some())
            .finish()
    }
}
