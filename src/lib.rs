//! Switchyard - concurrent dispatch over many stateful site backends
//!
//! A backend is a live client session for one remote site, created from a
//! module and a named entry of the instances file. The orchestrator keeps
//! the live backends; the dispatch engine runs one operation on many of
//! them at once and streams tagged results back while keeping each
//! backend's session exclusive.
//!
//! # Architecture
//!
//! ```text
//! ┌─────────────────────────────────────────────────────┐
//! │                      Callers                         │
//! │   async pull  │  blocking iterator  │  callbacks     │
//! └────────────────────┬────────────────────────────────┘
//!                      │
//! ┌────────────────────▼────────────────────────────────┐
//! │                   Orchestrator                       │
//! │  Dispatch  │  Instances file  │  Scheduler  │ Polls │
//! └────────────────────┬────────────────────────────────┘
//!                      │
//! ┌────────────────────▼────────────────────────────────┐
//! │                 Module registry                      │
//! │   manifests  │  installed code  │  version check     │
//! └─────────────────────────────────────────────────────┘
//! ```

pub mod backend;
pub mod capabilities;
pub mod config;
pub mod dispatch;
pub mod error;
pub mod instances;
pub mod modules;
pub mod orchestrator;
mod persist;
pub mod scheduler;
pub mod storage;

#[cfg(test)]
mod testing;

pub use backend::{Backend, BackendInstance, ParamSpec, Params};
pub use capabilities::{Account, CapBank, CapMessages, Capability, Message, Thread, Transaction};
pub use config::Config;
pub use dispatch::{
    Collected, DispatchEngine, DispatchHandle, DispatchOptions, DispatchState, MethodCall,
    Operation, Outcome, Reply, Target, operation,
};
pub use error::{CallError, CallErrors, Error, Result};
pub use instances::{InstanceConfigEntry, InstanceConfigStore};
pub use modules::{BackendModule, Module, ModuleManifest, ModuleRegistry};
pub use orchestrator::{BackendIter, LoadFilter, LockedBackend, Orchestrator};
pub use scheduler::{Scheduler, TaskId};
pub use storage::{BackendStorage, JsonFileStorage, MemoryStorage, Storage};
