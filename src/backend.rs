//! Live backend instances
//!
//! A [`Backend`] is the session-holding object a module creates for one
//! configured instance. The orchestrator wraps it in a [`BackendInstance`],
//! which owns the lock that serializes every access to the session.

use std::collections::{BTreeMap, BTreeSet};
use std::fmt;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex as StdMutex, PoisonError};

use async_trait::async_trait;
use secrecy::SecretString;
use tokio::sync::{Mutex, MutexGuard, OwnedMutexGuard};
use tokio_util::sync::{CancellationToken, WaitForCancellationFuture};

use crate::capabilities::{CapBank, CapMessages, Capability, matches_any};
use crate::modules::Module;
use crate::scheduler::TaskId;
use crate::storage::BackendStorage;
use crate::{Error, Result};

/// Session object created by a module for one instance
///
/// Capabilities are exposed through the `as_*` accessors; the default
/// implementations expose nothing.
#[async_trait]
pub trait Backend: Send {
    /// Called once after creation, before the instance becomes live
    ///
    /// # Errors
    ///
    /// Returns error if the backend cannot start (the instance is skipped)
    async fn init(&mut self) -> anyhow::Result<()> {
        Ok(())
    }

    /// Called once when the instance is unloaded
    ///
    /// # Errors
    ///
    /// Errors are logged by the orchestrator and never propagated
    async fn deinit(&mut self) -> anyhow::Result<()> {
        Ok(())
    }

    /// Banking interface, if implemented
    fn as_bank(&mut self) -> Option<&mut dyn CapBank> {
        None
    }

    /// Messaging interface, if implemented
    fn as_messages(&mut self) -> Option<&mut dyn CapMessages> {
        None
    }
}

/// Declared module parameter
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ParamSpec {
    /// Key in the instances file
    pub key: &'static str,
    /// Human-readable description
    pub description: &'static str,
    /// Whether instantiation fails without it
    pub required: bool,
    /// Value used when the key is absent
    pub default: Option<&'static str>,
    /// Whether the value is a credential
    pub secret: bool,
}

impl ParamSpec {
    /// A parameter that must be configured
    #[must_use]
    pub const fn required(key: &'static str, description: &'static str) -> Self {
        Self {
            key,
            description,
            required: true,
            default: None,
            secret: false,
        }
    }

    /// A parameter that may be omitted
    #[must_use]
    pub const fn optional(key: &'static str, description: &'static str) -> Self {
        Self {
            key,
            description,
            required: false,
            default: None,
            secret: false,
        }
    }

    /// Fill in `value` when the key is absent
    #[must_use]
    pub const fn with_default(mut self, value: &'static str) -> Self {
        self.default = Some(value);
        self.required = false;
        self
    }

    /// Mark the value as a credential
    #[must_use]
    pub const fn secret(mut self) -> Self {
        self.secret = true;
        self
    }
}

/// Validated parameters handed to a module's factory
#[derive(Clone, Default)]
pub struct Params {
    values: BTreeMap<String, String>,
    private: BTreeMap<String, String>,
    secret_keys: BTreeSet<String>,
}

impl Params {
    /// Check `raw` against `schema` for the instance `instance`
    ///
    /// Keys starting with `_` are split off as private settings. Missing
    /// required keys are an error; absent keys with a default get it.
    ///
    /// # Errors
    ///
    /// Returns [`Error::BackendConfig`] if a required parameter is missing
    pub fn resolve(
        instance: &str,
        schema: &[ParamSpec],
        raw: &BTreeMap<String, String>,
    ) -> Result<Self> {
        let mut params = Self::default();
        for (key, value) in raw {
            if key.starts_with('_') {
                params.private.insert(key.clone(), value.clone());
            } else {
                params.values.insert(key.clone(), value.clone());
            }
        }

        for spec in schema {
            if spec.secret {
                params.secret_keys.insert(spec.key.to_string());
            }
            if params.values.contains_key(spec.key) {
                continue;
            }
            if let Some(default) = spec.default {
                params.values.insert(spec.key.to_string(), default.to_string());
            } else if spec.required {
                return Err(Error::BackendConfig {
                    instance: instance.to_string(),
                    reason: format!(
                        "missing parameter \"{}\" ({})",
                        spec.key, spec.description
                    ),
                });
            }
        }

        Ok(params)
    }

    /// Plain parameter value
    #[must_use]
    pub fn get(&self, key: &str) -> Option<&str> {
        self.values.get(key).map(String::as_str)
    }

    /// Credential value, wrapped so it stays out of logs
    #[must_use]
    pub fn secret(&self, key: &str) -> Option<SecretString> {
        self.values
            .get(key)
            .map(|value| SecretString::from(value.clone()))
    }

    /// Private setting such as `_proxy`
    #[must_use]
    pub fn private(&self, key: &str) -> Option<&str> {
        self.private.get(key).map(String::as_str)
    }
}

impl fmt::Debug for Params {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let redacted: BTreeMap<&str, &str> = self
            .values
            .iter()
            .map(|(key, value)| {
                let shown = if self.secret_keys.contains(key) {
                    "[REDACTED]"
                } else {
                    value.as_str()
                };
                (key.as_str(), shown)
            })
            .collect();
        f.debug_struct("Params")
            .field("values", &redacted)
            .field("private", &self.private)
            .finish()
    }
}

/// A live backend owned by an orchestrator
pub struct BackendInstance {
    name: String,
    module: Arc<Module>,
    session: Arc<Mutex<Box<dyn Backend>>>,
    polls: StdMutex<Vec<TaskId>>,
    unloading: CancellationToken,
    retired: AtomicBool,
}

impl BackendInstance {
    /// Instantiate `module` for the configured instance `name`
    ///
    /// Validates parameters, creates the session, checks that every declared
    /// capability is actually implemented, then runs [`Backend::init`].
    ///
    /// # Errors
    ///
    /// Returns [`Error::BackendConfig`] for parameter or init failures and
    /// [`Error::ModuleLoad`] when a declared capability is missing
    pub async fn create(
        name: &str,
        module: Arc<Module>,
        raw: &BTreeMap<String, String>,
        storage: BackendStorage,
    ) -> Result<Self> {
        let params = Params::resolve(name, module.params(), raw)?;
        tracing::debug!(instance = name, module = module.name(), ?params, "creating backend");

        let mut backend = module
            .create_instance(params, storage)
            .map_err(|e| Error::BackendConfig {
                instance: name.to_string(),
                reason: format!("{e:#}"),
            })?;

        for cap in module.capabilities() {
            if !cap.is_implemented_by(backend.as_mut()) {
                return Err(Error::module_load(
                    module.name(),
                    format!("declares capability {cap} but does not implement it"),
                ));
            }
        }

        backend.init().await.map_err(|e| Error::BackendConfig {
            instance: name.to_string(),
            reason: format!("init failed: {e:#}"),
        })?;

        Ok(Self {
            name: name.to_string(),
            module,
            session: Arc::new(Mutex::new(backend)),
            polls: StdMutex::new(Vec::new()),
            unloading: CancellationToken::new(),
            retired: AtomicBool::new(false),
        })
    }

    /// Instance name
    #[must_use]
    pub fn name(&self) -> &str {
        &self.name
    }

    /// Module this instance was created from
    #[must_use]
    pub fn module(&self) -> &Module {
        &self.module
    }

    /// Capabilities inherited from the module
    #[must_use]
    pub fn capabilities(&self) -> &[Capability] {
        self.module.capabilities()
    }

    /// Whether the instance provides `cap`
    #[must_use]
    pub fn has_capability(&self, cap: Capability) -> bool {
        self.capabilities().contains(&cap)
    }

    /// Whether the instance passes a capability filter
    #[must_use]
    pub fn matches(&self, filter: Option<&[Capability]>) -> bool {
        matches_any(self.capabilities(), filter)
    }

    /// Lock the session for exclusive use
    pub async fn lock(&self) -> MutexGuard<'_, Box<dyn Backend>> {
        self.session.lock().await
    }

    /// Lock the session with a guard that can move into a task
    pub async fn lock_owned(&self) -> OwnedMutexGuard<Box<dyn Backend>> {
        Arc::clone(&self.session).lock_owned().await
    }

    pub(crate) fn track_poll(&self, task: TaskId) {
        self.polls
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .push(task);
    }

    pub(crate) fn take_polls(&self) -> Vec<TaskId> {
        std::mem::take(&mut *self.polls.lock().unwrap_or_else(PoisonError::into_inner))
    }

    /// Ask lock holders to let go so the instance can be deinitialized
    pub(crate) fn begin_unload(&self) {
        self.unloading.cancel();
    }

    /// Resolves once an unload of this instance has started
    pub fn unloading(&self) -> WaitForCancellationFuture<'_> {
        self.unloading.cancelled()
    }

    /// Whether an unload of this instance has started
    #[must_use]
    pub fn is_unloading(&self) -> bool {
        self.unloading.is_cancelled()
    }

    /// Mark the session as deinitialized; callers must hold the lock
    pub(crate) fn retire(&self) {
        self.retired.store(true, Ordering::Release);
    }

    /// Whether the instance was unloaded
    #[must_use]
    pub fn is_retired(&self) -> bool {
        self.retired.load(Ordering::Acquire)
    }
}

impl fmt::Debug for BackendInstance {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("BackendInstance")
            .field("name", &self.name)
            .field("module", &self.module.name())
            .field("capabilities", &self.capabilities())
            .finish_non_exhaustive()
    }
}

impl fmt::Display for BackendInstance {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "<Backend '{}'>", self.name)
    }
}
