//! Error types for switchyard

use std::fmt;
use std::path::PathBuf;
use std::sync::Arc;

use thiserror::Error;

use crate::capabilities::Capability;

/// Result type alias for switchyard operations
pub type Result<T> = std::result::Result<T, Error>;

/// Errors that can occur in switchyard
#[derive(Debug, Error)]
pub enum Error {
    /// Configuration error
    #[error("configuration error: {0}")]
    Config(String),

    /// Module is missing, failed to load, or declares an incompatible version
    #[error("unable to load module \"{module}\": {reason}")]
    ModuleLoad {
        /// Requested module name
        module: String,
        /// Human-readable cause
        reason: String,
    },

    /// An instance with this name is already configured
    #[error("instance already exists: {0}")]
    InstanceAlreadyExists(String),

    /// No instance with this name is configured
    #[error("instance not found: {0}")]
    InstanceNotFound(String),

    /// Instance name cannot be stored as a section header
    #[error("invalid instance name: {0:?}")]
    InvalidInstanceName(String),

    /// Configured instance has neither `_backend` nor `_type`
    #[error("missing \"_backend\" field for configured instance \"{0}\"")]
    MissingModuleField(String),

    /// Instances file is readable by group or other users
    #[error("refusing to use {}: readable by group or other users", .0.display())]
    WrongPermissions(PathBuf),

    /// Parameters rejected by the module's parameter schema
    #[error("backend {instance}: configuration error: {reason}")]
    BackendConfig {
        /// Instance being created
        instance: String,
        /// What was wrong
        reason: String,
    },

    /// Backend does not implement the capability an operation needs
    #[error("backend {backend} does not implement capability {capability}")]
    Unsupported {
        /// Instance name
        backend: String,
        /// Capability the operation needs
        capability: Capability,
    },

    /// Named operation is not known to any capability
    #[error("unknown method: {0}")]
    UnknownMethod(String),

    /// One or more backends failed during a dispatch
    #[error(transparent)]
    Calls(#[from] CallErrors),

    /// IO error
    #[error("io error: {0}")]
    Io(#[from] std::io::Error),

    /// Serialization error
    #[error("serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    /// TOML parsing error
    #[error("toml error: {0}")]
    Toml(#[from] toml::de::Error),

    /// Instances file parsing error
    #[error("instances file error: {0}")]
    Ini(#[from] ini::ParseError),

    /// Atomic file replacement failed
    #[error("persist error: {0}")]
    Persist(#[from] tempfile::PersistError),
}

impl Error {
    /// Build a module load error
    pub fn module_load(module: impl Into<String>, reason: impl fmt::Display) -> Self {
        Self::ModuleLoad {
            module: module.into(),
            reason: reason.to_string(),
        }
    }
}

/// A single backend's failure during a dispatch
#[derive(Debug, Clone)]
pub struct CallError {
    /// Instance name of the failing backend
    pub backend: String,
    /// The error raised by the backend operation
    pub error: Arc<anyhow::Error>,
    /// Full error chain, including a backtrace when one was captured
    pub context: String,
}

impl CallError {
    /// Wrap an operation failure for `backend`
    #[must_use]
    pub fn new(backend: impl Into<String>, error: anyhow::Error) -> Self {
        let context = format!("{error:?}");
        Self {
            backend: backend.into(),
            error: Arc::new(error),
            context,
        }
    }
}

impl fmt::Display for CallError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "backend({}): {:#}", self.backend, self.error)
    }
}

/// Every backend failure collected during one dispatch
#[derive(Debug, Clone, Error)]
pub struct CallErrors {
    errors: Vec<CallError>,
}

impl CallErrors {
    /// Wrap a non-empty list of call errors
    #[must_use]
    pub const fn new(errors: Vec<CallError>) -> Self {
        Self { errors }
    }

    /// Number of failed backends
    #[must_use]
    pub fn len(&self) -> usize {
        self.errors.len()
    }

    /// Whether no failure was recorded
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.errors.is_empty()
    }

    /// Names of the backends that failed, in failure order
    pub fn backends(&self) -> impl Iterator<Item = &str> {
        self.errors.iter().map(|e| e.backend.as_str())
    }

    /// Iterate over the recorded failures
    pub fn iter(&self) -> std::slice::Iter<'_, CallError> {
        self.errors.iter()
    }

    /// Consume into the underlying list
    #[must_use]
    pub fn into_inner(self) -> Vec<CallError> {
        self.errors
    }
}

impl fmt::Display for CallErrors {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "errors during backend calls:")?;
        for error in &self.errors {
            write!(f, "\n  {error}")?;
        }
        Ok(())
    }
}

impl IntoIterator for CallErrors {
    type Item = CallError;
    type IntoIter = std::vec::IntoIter<CallError>;

    fn into_iter(self) -> Self::IntoIter {
        self.errors.into_iter()
    }
}

impl<'a> IntoIterator for &'a CallErrors {
    type Item = &'a CallError;
    type IntoIter = std::slice::Iter<'a, CallError>;

    fn into_iter(self) -> Self::IntoIter {
        self.errors.iter()
    }
}
