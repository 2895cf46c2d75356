//! Module loader and cache

use std::collections::{BTreeSet, HashMap};
use std::fmt;
use std::path::PathBuf;
use std::sync::{Arc, Mutex, PoisonError, RwLock};

use tokio::sync::OnceCell;

use super::discovery::discover_modules;
use super::manifest::ModuleManifest;
use super::{BackendModule, Module};
use crate::capabilities::Capability;
use crate::{Error, Result};

type Installer = Arc<dyn Fn() -> anyhow::Result<Arc<dyn BackendModule>> + Send + Sync>;
type LoadSlot = Arc<OnceCell<std::result::Result<Arc<Module>, String>>>;
type Discovered = HashMap<String, (PathBuf, ModuleManifest)>;

/// Discover, load and cache modules
///
/// Each module is loaded at most once per registry. Concurrent first loads of
/// the same name share one attempt: later callers wait for it and receive its
/// module or its failure. A failed load is not cached, so a later call
/// retries.
pub struct ModuleRegistry {
    expected_version: String,
    module_dirs: Vec<PathBuf>,
    installed: RwLock<HashMap<String, Installer>>,
    discovered: RwLock<Option<Discovered>>,
    loaded: Mutex<HashMap<String, LoadSlot>>,
}

impl ModuleRegistry {
    /// Create a registry accepting modules built for `expected_version`
    #[must_use]
    pub fn new(expected_version: impl Into<String>, module_dirs: Vec<PathBuf>) -> Self {
        Self {
            expected_version: expected_version.into(),
            module_dirs,
            installed: RwLock::new(HashMap::new()),
            discovered: RwLock::new(None),
            loaded: Mutex::new(HashMap::new()),
        }
    }

    /// Framework version modules must declare
    #[must_use]
    pub fn expected_version(&self) -> &str {
        &self.expected_version
    }

    /// Directories scanned for descriptors
    #[must_use]
    pub fn module_dirs(&self) -> &[PathBuf] {
        &self.module_dirs
    }

    /// Install module code under `name`
    ///
    /// `installer` runs on first load; its error is reported as a
    /// [`Error::ModuleLoad`].
    pub fn install<F>(&self, name: impl Into<String>, installer: F)
    where
        F: Fn() -> anyhow::Result<Arc<dyn BackendModule>> + Send + Sync + 'static,
    {
        let name = name.into();
        tracing::debug!(module = %name, "installed module");
        self.installed
            .write()
            .unwrap_or_else(PoisonError::into_inner)
            .insert(name, Arc::new(installer));
    }

    /// Install an already constructed module under its own name
    pub fn install_module(&self, module: Arc<dyn BackendModule>) {
        let name = module.name().to_string();
        self.install(name, move || Ok(Arc::clone(&module)));
    }

    /// Whether code is installed for `name`
    #[must_use]
    pub fn is_installed(&self, name: &str) -> bool {
        self.installed
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .contains_key(name)
    }

    /// Forget discovered descriptors so the next query rescans the directories
    pub fn rescan(&self) {
        *self
            .discovered
            .write()
            .unwrap_or_else(PoisonError::into_inner) = None;
    }

    /// Descriptor of `name`, if one was discovered
    #[must_use]
    pub fn manifest(&self, name: &str) -> Option<ModuleManifest> {
        self.with_discovered(|found| found.get(name).map(|(_, m)| m.clone()))
    }

    /// Every discovered descriptor, sorted by name
    #[must_use]
    pub fn available(&self) -> Vec<ModuleManifest> {
        let mut manifests =
            self.with_discovered(|found| found.values().map(|(_, m)| m.clone()).collect::<Vec<_>>());
        manifests.sort_by(|a, b| a.name.cmp(&b.name));
        manifests
    }

    /// Names known either from descriptors or from installed code
    #[must_use]
    pub fn module_names(&self) -> Vec<String> {
        let mut names: BTreeSet<String> =
            self.with_discovered(|found| found.keys().cloned().collect());
        names.extend(
            self.installed
                .read()
                .unwrap_or_else(PoisonError::into_inner)
                .keys()
                .cloned(),
        );
        names.into_iter().collect()
    }

    /// Return the cached module, loading it on first use
    ///
    /// # Errors
    ///
    /// Returns [`Error::ModuleLoad`] if no code is installed under `name`,
    /// the installer fails, or the module declares another name or an
    /// incompatible version
    pub async fn get_or_load(&self, name: &str) -> Result<Arc<Module>> {
        let slot = {
            let mut loaded = self.loaded.lock().unwrap_or_else(PoisonError::into_inner);
            Arc::clone(loaded.entry(name.to_string()).or_default())
        };

        match slot.get_or_init(|| async { self.load(name) }).await {
            Ok(module) => Ok(Arc::clone(module)),
            Err(reason) => {
                let mut loaded = self.loaded.lock().unwrap_or_else(PoisonError::into_inner);
                if loaded.get(name).is_some_and(|s| Arc::ptr_eq(s, &slot)) {
                    loaded.remove(name);
                }
                Err(Error::module_load(name, reason))
            }
        }
    }

    /// Whether `name` declares `cap`
    ///
    /// Answers from the loaded module or the discovered descriptor when
    /// available, and loads the module otherwise.
    ///
    /// # Errors
    ///
    /// Returns [`Error::ModuleLoad`] if a forced load fails
    pub async fn has_capability(&self, name: &str, cap: Capability) -> Result<bool> {
        if let Some(module) = self.loaded_module(name) {
            return Ok(module.has_capability(cap));
        }
        if let Some(manifest) = self.manifest(name) {
            return Ok(manifest.has_capability(cap));
        }
        Ok(self.get_or_load(name).await?.has_capability(cap))
    }

    /// Load every installed module, logging the ones that fail
    pub async fn load_all_modules(&self) -> Vec<Arc<Module>> {
        let names: Vec<String> = self
            .installed
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .keys()
            .cloned()
            .collect();

        let mut modules = Vec::new();
        for name in names {
            match self.get_or_load(&name).await {
                Ok(module) => modules.push(module),
                Err(e) => tracing::warn!(module = %name, error = %e, "skipping module"),
            }
        }
        modules.sort_by(|a, b| a.name().cmp(b.name()));
        modules
    }

    /// Modules loaded so far
    #[must_use]
    pub fn loaded(&self) -> Vec<Arc<Module>> {
        let loaded = self.loaded.lock().unwrap_or_else(PoisonError::into_inner);
        let mut modules: Vec<Arc<Module>> = loaded
            .values()
            .filter_map(|slot| slot.get().and_then(|r| r.as_ref().ok()).cloned())
            .collect();
        modules.sort_by(|a, b| a.name().cmp(b.name()));
        modules
    }

    fn loaded_module(&self, name: &str) -> Option<Arc<Module>> {
        let loaded = self.loaded.lock().unwrap_or_else(PoisonError::into_inner);
        loaded
            .get(name)
            .and_then(|slot| slot.get())
            .and_then(|r| r.as_ref().ok())
            .cloned()
    }

    fn load(&self, name: &str) -> std::result::Result<Arc<Module>, String> {
        let installer = self
            .installed
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .get(name)
            .cloned()
            .ok_or_else(|| "module is not installed".to_string())?;

        let code = installer().map_err(|e| format!("{e:#}"))?;

        if code.name() != name {
            return Err(format!(
                "installed code declares module name \"{}\"",
                code.name()
            ));
        }
        if code.version() != self.expected_version {
            return Err(format!(
                "module version {} does not match framework version {}",
                code.version(),
                self.expected_version
            ));
        }

        let path = self.with_discovered(|found| found.get(name).map(|(p, _)| p.clone()));
        tracing::info!(
            module = name,
            version = code.version(),
            capabilities = ?code.capabilities(),
            "loaded module"
        );
        Ok(Arc::new(Module::new(code, path)))
    }

    fn with_discovered<R>(&self, f: impl FnOnce(&Discovered) -> R) -> R {
        {
            let guard = self.discovered.read().unwrap_or_else(PoisonError::into_inner);
            if let Some(found) = guard.as_ref() {
                return f(found);
            }
        }

        let mut guard = self
            .discovered
            .write()
            .unwrap_or_else(PoisonError::into_inner);
        let found = guard.get_or_insert_with(|| scan(&self.module_dirs));
        f(found)
    }
}

impl fmt::Debug for ModuleRegistry {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ModuleRegistry")
            .field("expected_version", &self.expected_version)
            .field("module_dirs", &self.module_dirs)
            .finish_non_exhaustive()
    }
}

fn scan(dirs: &[PathBuf]) -> Discovered {
    discover_modules(dirs)
        .into_iter()
        .map(|(path, manifest)| (manifest.name.clone(), (path, manifest)))
        .collect()
}
