//! Module system for switchyard
//!
//! A module is the code for one site: it declares a name, the framework
//! version it targets, its capabilities and a factory for backends. Modules
//! are described on disk by `module.json` descriptors in the module
//! directories, while their code is installed into the [`ModuleRegistry`]
//! under the same name and loaded on first use.

pub mod discovery;
pub mod manifest;
pub mod registry;

use std::fmt;
use std::path::{Path, PathBuf};
use std::sync::Arc;

pub use discovery::{MANIFEST_FILE, default_module_dirs, discover_modules};
pub use manifest::ModuleManifest;
pub use registry::ModuleRegistry;

use crate::backend::{Backend, ParamSpec, Params};
use crate::capabilities::Capability;
use crate::storage::BackendStorage;

/// Code of an installable module
pub trait BackendModule: Send + Sync {
    /// Unique module name
    fn name(&self) -> &str;

    /// Framework version the module was built for
    fn version(&self) -> &str;

    /// Short description
    fn description(&self) -> &str {
        "<unspecified>"
    }

    /// Module maintainer
    fn maintainer(&self) -> &str {
        "<unspecified>"
    }

    /// License identifier
    fn license(&self) -> &str {
        "<unspecified>"
    }

    /// Capabilities every backend of this module implements
    fn capabilities(&self) -> &[Capability];

    /// Parameters accepted in the instances file
    fn params(&self) -> &[ParamSpec] {
        &[]
    }

    /// Create a backend for one configured instance
    ///
    /// # Errors
    ///
    /// Returns error if the parameters are unusable
    fn create_instance(
        &self,
        params: Params,
        storage: BackendStorage,
    ) -> anyhow::Result<Box<dyn Backend>>;
}

/// A loaded, version-checked module
pub struct Module {
    code: Arc<dyn BackendModule>,
    path: Option<PathBuf>,
}

impl Module {
    pub(crate) fn new(code: Arc<dyn BackendModule>, path: Option<PathBuf>) -> Self {
        Self { code, path }
    }

    /// Module name
    #[must_use]
    pub fn name(&self) -> &str {
        self.code.name()
    }

    /// Declared version
    #[must_use]
    pub fn version(&self) -> &str {
        self.code.version()
    }

    /// Short description
    #[must_use]
    pub fn description(&self) -> &str {
        self.code.description()
    }

    /// Maintainer
    #[must_use]
    pub fn maintainer(&self) -> &str {
        self.code.maintainer()
    }

    /// License
    #[must_use]
    pub fn license(&self) -> &str {
        self.code.license()
    }

    /// Declared capabilities
    #[must_use]
    pub fn capabilities(&self) -> &[Capability] {
        self.code.capabilities()
    }

    /// Parameter schema
    #[must_use]
    pub fn params(&self) -> &[ParamSpec] {
        self.code.params()
    }

    /// Directory holding the module's descriptor, if one was discovered
    #[must_use]
    pub fn path(&self) -> Option<&Path> {
        self.path.as_deref()
    }

    /// Whether the module declares `cap`
    #[must_use]
    pub fn has_capability(&self, cap: Capability) -> bool {
        self.capabilities().contains(&cap)
    }

    pub(crate) fn create_instance(
        &self,
        params: Params,
        storage: BackendStorage,
    ) -> anyhow::Result<Box<dyn Backend>> {
        self.code.create_instance(params, storage)
    }
}

impl fmt::Debug for Module {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Module")
            .field("name", &self.name())
            .field("version", &self.version())
            .field("capabilities", &self.capabilities())
            .field("path", &self.path)
            .finish()
    }
}
