//! Module descriptor format (`module.json`)

use serde::{Deserialize, Serialize};

use crate::capabilities::Capability;

/// Lightweight module descriptor, readable without loading the module
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ModuleManifest {
    /// Unique module name (e.g. "bankmod")
    pub name: String,
    /// Framework version the module was built for
    pub version: String,
    /// Short description
    #[serde(default)]
    pub description: Option<String>,
    /// Module maintainer
    #[serde(default)]
    pub maintainer: Option<String>,
    /// License identifier
    #[serde(default)]
    pub license: Option<String>,
    /// Capability tags (e.g. "banking", "messaging")
    #[serde(default)]
    pub capabilities: Vec<String>,
    /// Site the module talks to
    #[serde(default)]
    pub website: Option<String>,
}

impl ModuleManifest {
    /// Known capabilities declared by the manifest
    ///
    /// Unknown tags are ignored; they may belong to a newer framework.
    #[must_use]
    pub fn capability_set(&self) -> Vec<Capability> {
        self.capabilities
            .iter()
            .filter_map(|tag| match tag.parse() {
                Ok(cap) => Some(cap),
                Err(e) => {
                    tracing::debug!(module = %self.name, error = %e, "ignoring capability tag");
                    None
                }
            })
            .collect()
    }

    /// Whether the manifest declares `cap`
    #[must_use]
    pub fn has_capability(&self, cap: Capability) -> bool {
        self.capabilities
            .iter()
            .any(|tag| tag.parse::<Capability>().is_ok_and(|c| c == cap))
    }
}
