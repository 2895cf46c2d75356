//! Owner of every live backend
//!
//! The orchestrator ties the module registry, the instances file, the
//! scheduler and optional storage together. It creates [`BackendInstance`]s
//! from enabled entries, hands them to the dispatch engine, and tears them
//! down again.

use std::collections::{BTreeMap, VecDeque};
use std::fmt;
use std::ops::{Deref, DerefMut};
use std::panic::AssertUnwindSafe;
use std::sync::Arc;
use std::time::Duration;

use anyhow::Context;
use futures::FutureExt;
use futures::future::BoxFuture;
use tokio::sync::{OwnedMutexGuard, RwLock};

use crate::backend::{Backend, BackendInstance};
use crate::capabilities::Capability;
use crate::config::Config;
use crate::dispatch::{DispatchEngine, DispatchHandle, DispatchOptions, Operation, Target};
use crate::instances::{InstanceConfigEntry, InstanceConfigStore};
use crate::modules::ModuleRegistry;
use crate::scheduler::{Scheduler, TaskId};
use crate::storage::{BackendStorage, JsonFileStorage, Storage};
use crate::Result;

/// Which entries [`Orchestrator::load_all`] considers
#[derive(Debug, Clone, Default)]
pub struct LoadFilter {
    capabilities: Option<Vec<Capability>>,
    names: Option<Vec<String>>,
    exclude: Vec<String>,
}

impl LoadFilter {
    /// Every enabled entry
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Only entries whose module declares `capability`
    #[must_use]
    pub fn capability(mut self, capability: Capability) -> Self {
        self.capabilities
            .get_or_insert_with(Vec::new)
            .push(capability);
        self
    }

    /// Only the entry named `name` (repeatable)
    #[must_use]
    pub fn name(mut self, name: impl Into<String>) -> Self {
        self.names.get_or_insert_with(Vec::new).push(name.into());
        self
    }

    /// Never the entry named `name` (repeatable)
    #[must_use]
    pub fn exclude(mut self, name: impl Into<String>) -> Self {
        self.exclude.push(name.into());
        self
    }

    fn admits_name(&self, name: &str) -> bool {
        let included = self
            .names
            .as_ref()
            .is_none_or(|names| names.iter().any(|n| n == name));
        included && !self.exclude.iter().any(|n| n == name)
    }
}

/// Registry, configuration, scheduler and live backends of one process
pub struct Orchestrator {
    config: Config,
    registry: ModuleRegistry,
    instances: InstanceConfigStore,
    scheduler: Scheduler,
    storage: Option<Arc<dyn Storage>>,
    engine: DispatchEngine,
    live: RwLock<BTreeMap<String, Arc<BackendInstance>>>,
}

impl Orchestrator {
    /// Open the instances file and storage named by `config`
    ///
    /// # Errors
    ///
    /// Returns error if the instances file or the storage file cannot be
    /// opened
    pub fn new(config: Config) -> Result<Self> {
        let instances = InstanceConfigStore::open(&config.instances_file)?;
        let storage = match &config.storage_file {
            Some(path) => Some(Arc::new(JsonFileStorage::open(path)?) as Arc<dyn Storage>),
            None => None,
        };
        let registry =
            ModuleRegistry::new(config.framework_version.clone(), config.module_dirs.clone());

        tracing::info!(
            workdir = %config.workdir.display(),
            framework_version = %config.framework_version,
            "orchestrator ready"
        );

        Ok(Self {
            engine: DispatchEngine::new(config.dispatch_buffer),
            config,
            registry,
            instances,
            scheduler: Scheduler::new(),
            storage,
            live: RwLock::new(BTreeMap::new()),
        })
    }

    /// Replace the storage handed to backends created from now on
    #[must_use]
    pub fn with_storage(mut self, storage: Arc<dyn Storage>) -> Self {
        self.storage = Some(storage);
        self
    }

    /// Active configuration
    #[must_use]
    pub const fn config(&self) -> &Config {
        &self.config
    }

    /// Module registry
    #[must_use]
    pub const fn registry(&self) -> &ModuleRegistry {
        &self.registry
    }

    /// Instances file
    #[must_use]
    pub const fn instances(&self) -> &InstanceConfigStore {
        &self.instances
    }

    /// Scheduler for background work
    #[must_use]
    pub const fn scheduler(&self) -> &Scheduler {
        &self.scheduler
    }

    /// Create live backends for every enabled entry admitted by `filter`
    ///
    /// Entries whose module or backend fails to load are skipped with a
    /// warning. An entry already live is unloaded and created again.
    /// Returns the backends created by this call.
    ///
    /// # Errors
    ///
    /// Returns error only if the instances file cannot be read
    pub async fn load_all(
        &self,
        filter: &LoadFilter,
    ) -> Result<BTreeMap<String, Arc<BackendInstance>>> {
        let mut loaded = BTreeMap::new();

        for entry in self.instances.list_entries()? {
            if !entry.enabled || !filter.admits_name(&entry.name) {
                continue;
            }
            if !self.module_admitted(&entry, filter).await {
                continue;
            }

            match self.load_entry(&entry).await {
                Ok(instance) => {
                    loaded.insert(entry.name.clone(), instance);
                }
                Err(e) => tracing::warn!(
                    instance = %entry.name,
                    module = %entry.module,
                    error = %e,
                    "unable to load backend, skipping"
                ),
            }
        }

        Ok(loaded)
    }

    /// Create the live backend for one configured entry, enabled or not
    ///
    /// # Errors
    ///
    /// Returns error if the entry does not exist, its module fails to load,
    /// or the backend rejects its parameters
    pub async fn load(&self, name: &str) -> Result<Arc<BackendInstance>> {
        let entry = self.instances.get(name)?;
        self.load_entry(&entry).await
    }

    async fn module_admitted(&self, entry: &InstanceConfigEntry, filter: &LoadFilter) -> bool {
        let Some(capabilities) = &filter.capabilities else {
            return true;
        };
        for capability in capabilities {
            match self.registry.has_capability(&entry.module, *capability).await {
                Ok(true) => return true,
                Ok(false) => {}
                Err(e) => {
                    tracing::warn!(
                        instance = %entry.name,
                        module = %entry.module,
                        error = %e,
                        "unable to load module, skipping"
                    );
                    return false;
                }
            }
        }
        false
    }

    async fn load_entry(&self, entry: &InstanceConfigEntry) -> Result<Arc<BackendInstance>> {
        self.unload(Some(&[entry.name.as_str()])).await;

        let module = self.registry.get_or_load(&entry.module).await?;
        let storage = BackendStorage::new(&entry.name, self.storage.clone());
        let instance =
            Arc::new(BackendInstance::create(&entry.name, module, &entry.params, storage).await?);

        let replaced = self
            .live
            .write()
            .await
            .insert(entry.name.clone(), Arc::clone(&instance));
        if let Some(replaced) = replaced {
            self.shut_down(&replaced).await;
        }

        tracing::info!(instance = %entry.name, module = %entry.module, "loaded backend");
        Ok(instance)
    }

    /// Deinitialize and drop live backends
    ///
    /// `None` unloads every backend. Names that are not live are ignored, so
    /// unloading twice is harmless. Returns the names actually unloaded.
    pub async fn unload(&self, names: Option<&[&str]>) -> Vec<String> {
        let removed: Vec<Arc<BackendInstance>> = {
            let mut live = self.live.write().await;
            match names {
                None => std::mem::take(&mut *live).into_values().collect(),
                Some(names) => names.iter().filter_map(|name| live.remove(*name)).collect(),
            }
        };

        let mut unloaded = Vec::with_capacity(removed.len());
        for instance in removed {
            self.shut_down(&instance).await;
            unloaded.push(instance.name().to_string());
        }
        unloaded
    }

    async fn shut_down(&self, instance: &BackendInstance) {
        for task in instance.take_polls() {
            self.scheduler.cancel(task);
        }

        // dispatch workers blocked on a slow consumer release the lock
        instance.begin_unload();
        let mut session = instance.lock().await;
        instance.retire();
        match AssertUnwindSafe(session.deinit()).catch_unwind().await {
            Ok(Ok(())) => {}
            Ok(Err(e)) => tracing::warn!(instance = %instance.name(), error = %e, "deinit failed"),
            Err(_) => tracing::error!(instance = %instance.name(), "deinit panicked"),
        }
        drop(session);

        if let Some(storage) = &self.storage {
            if let Err(e) = storage.save(instance.name()) {
                tracing::warn!(instance = %instance.name(), error = %e, "failed to save storage");
            }
        }
        tracing::info!(instance = %instance.name(), "unloaded backend");
    }

    /// Live backend named `name`
    pub async fn get(&self, name: &str) -> Option<Arc<BackendInstance>> {
        self.live.read().await.get(name).cloned()
    }

    /// Snapshot of live backends passing `capabilities`, sorted by name
    pub async fn backends(&self, capabilities: Option<&[Capability]>) -> Vec<Arc<BackendInstance>> {
        self.live
            .read()
            .await
            .values()
            .filter(|instance| instance.matches(capabilities))
            .cloned()
            .collect()
    }

    /// Walk live backends passing `capabilities`, each one locked in turn
    pub async fn iter_backends(&self, capabilities: Option<&[Capability]>) -> BackendIter {
        BackendIter {
            pending: self.backends(capabilities).await.into(),
            current: None,
        }
    }

    /// Run `operation` on the selected backends
    ///
    /// Without explicit targets, backends need the capability the operation
    /// requires and must also pass the capability filter of `options`.
    /// Target names that are not live are ignored with a warning.
    pub async fn dispatch<T, O>(&self, operation: O, options: DispatchOptions<T>) -> DispatchHandle<T>
    where
        T: Send + 'static,
        O: Operation<T> + 'static,
    {
        let targets = self.resolve_targets(&options, operation.capability()).await;
        self.engine.run(targets, operation, options)
    }

    async fn resolve_targets<T>(
        &self,
        options: &DispatchOptions<T>,
        needed: Option<Capability>,
    ) -> Vec<Arc<BackendInstance>> {
        let live = self.live.read().await;
        let selected: Vec<Arc<BackendInstance>> = match &options.targets {
            Some(targets) => targets
                .iter()
                .filter_map(|target| match target {
                    Target::Instance(instance) => Some(Arc::clone(instance)),
                    Target::Name(name) => {
                        let found = live.get(name).cloned();
                        if found.is_none() {
                            tracing::warn!(instance = %name, "dispatch target is not loaded, ignoring");
                        }
                        found
                    }
                })
                .collect(),
            None => live
                .values()
                .filter(|instance| needed.is_none_or(|cap| instance.has_capability(cap)))
                .cloned()
                .collect(),
        };

        selected
            .into_iter()
            .filter(|instance| instance.matches(options.capabilities.as_deref()))
            .collect()
    }

    /// Run `task` against `instance` every `interval`, starting now
    ///
    /// Each run holds the backend's lock. The poll stops when the instance
    /// is unloaded or the returned id is cancelled on the scheduler.
    pub fn poll<F>(&self, instance: &Arc<BackendInstance>, interval: Duration, task: F) -> TaskId
    where
        F: for<'a> Fn(&'a mut dyn Backend) -> BoxFuture<'a, anyhow::Result<()>>
            + Send
            + Sync
            + 'static,
    {
        let task = Arc::new(task);
        let target = Arc::clone(instance);
        let id = self.scheduler.repeat(interval, move || {
            let (target, task) = (Arc::clone(&target), Arc::clone(&task));
            async move {
                let mut session = target.lock_owned().await;
                if target.is_retired() {
                    return Ok(());
                }
                task(&mut **session)
                    .await
                    .with_context(|| format!("poll of {}", target.name()))
            }
        });
        instance.track_poll(id);
        tracing::debug!(instance = %instance.name(), task = %id, ?interval, "polling backend");
        id
    }

    /// Unload every backend and stop the scheduler
    pub async fn deinit(&self) {
        let unloaded = self.unload(None).await;
        self.scheduler.shutdown().await;
        tracing::info!(backends = unloaded.len(), "orchestrator shut down");
    }
}

impl fmt::Debug for Orchestrator {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Orchestrator")
            .field("config", &self.config)
            .field("registry", &self.registry)
            .field("scheduler", &self.scheduler)
            .finish_non_exhaustive()
    }
}

/// Lending iterator returned by [`Orchestrator::iter_backends`]
///
/// Each backend stays locked until the next call to
/// [`next`](Self::next) or until the iterator is dropped.
pub struct BackendIter {
    pending: VecDeque<Arc<BackendInstance>>,
    current: Option<(Arc<BackendInstance>, OwnedMutexGuard<Box<dyn Backend>>)>,
}

impl BackendIter {
    /// Release the previous backend and lock the next one
    pub async fn next(&mut self) -> Option<LockedBackend<'_>> {
        self.current = None;
        loop {
            let instance = self.pending.pop_front()?;
            let session = instance.lock_owned().await;
            if instance.is_retired() {
                tracing::debug!(instance = %instance.name(), "skipping unloaded backend");
                continue;
            }
            let (instance, session) = self.current.insert((instance, session));
            return Some(LockedBackend { instance, session });
        }
    }

    /// Backends not visited yet
    #[must_use]
    pub fn remaining(&self) -> usize {
        self.pending.len()
    }
}

impl fmt::Debug for BackendIter {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("BackendIter")
            .field("remaining", &self.pending.len())
            .field("current", &self.current.as_ref().map(|(i, _)| i.name()))
            .finish()
    }
}

/// A backend held locked by [`BackendIter`]
pub struct LockedBackend<'a> {
    instance: &'a Arc<BackendInstance>,
    session: &'a mut OwnedMutexGuard<Box<dyn Backend>>,
}

impl LockedBackend<'_> {
    /// The locked instance
    #[must_use]
    pub const fn instance(&self) -> &Arc<BackendInstance> {
        self.instance
    }

    /// Instance name
    #[must_use]
    pub fn name(&self) -> &str {
        self.instance.name()
    }
}

impl Deref for LockedBackend<'_> {
    type Target = dyn Backend;

    fn deref(&self) -> &Self::Target {
        &***self.session
    }
}

impl DerefMut for LockedBackend<'_> {
    fn deref_mut(&mut self) -> &mut Self::Target {
        &mut ***self.session
    }
}

impl fmt::Debug for LockedBackend<'_> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_tuple("LockedBackend").field(&self.instance.name()).finish()
    }
}
