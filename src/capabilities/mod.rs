//! Capability interfaces a backend may implement
//!
//! A capability is a named contract. Modules declare the tags they provide
//! and every backend they create must expose the matching interface through
//! [`Backend`](crate::backend::Backend) (`as_bank`, `as_messages`). The check
//! happens once, when the instance is created, never at call time.

mod bank;
mod messages;

use std::fmt;
use std::str::FromStr;

use serde::{Deserialize, Serialize};

pub use bank::{Account, CapBank, Transaction};
pub use messages::{CapMessages, Message, Thread};

use crate::backend::Backend;

/// Capability tag
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub enum Capability {
    /// Bank accounts and their history
    #[serde(rename = "banking")]
    Bank,
    /// Message threads
    #[serde(rename = "messaging")]
    Messages,
}

impl Capability {
    /// Every known capability
    pub const ALL: [Self; 2] = [Self::Bank, Self::Messages];

    /// Tag used in manifests and configuration
    #[must_use]
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::Bank => "banking",
            Self::Messages => "messaging",
        }
    }

    /// Whether `backend` exposes the interface behind this tag
    pub fn is_implemented_by(self, backend: &mut dyn Backend) -> bool {
        match self {
            Self::Bank => backend.as_bank().is_some(),
            Self::Messages => backend.as_messages().is_some(),
        }
    }
}

impl fmt::Display for Capability {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for Capability {
    type Err = UnknownCapability;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Self::ALL
            .into_iter()
            .find(|cap| cap.as_str().eq_ignore_ascii_case(s.trim()))
            .ok_or_else(|| UnknownCapability(s.to_string()))
    }
}

/// Tag that does not name a known capability
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
#[error("unknown capability: {0}")]
pub struct UnknownCapability(pub String);

/// Whether `caps` satisfies `filter`
///
/// A missing or empty filter matches everything; otherwise at least one of
/// the requested tags must be present.
#[must_use]
pub fn matches_any(caps: &[Capability], filter: Option<&[Capability]>) -> bool {
    match filter {
        None | Some([]) => true,
        Some(wanted) => wanted.iter().any(|cap| caps.contains(cap)),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parse_tags() {
        assert_eq!("banking".parse::<Capability>().unwrap(), Capability::Bank);
        assert_eq!(" Messaging ".parse::<Capability>().unwrap(), Capability::Messages);
        assert!("weather".parse::<Capability>().is_err());
    }

    #[test]
    fn serde_uses_tags() {
        let json = serde_json::to_string(&Capability::Bank).unwrap();
        assert_eq!(json, "\"banking\"");
        let cap: Capability = serde_json::from_str("\"messaging\"").unwrap();
        assert_eq!(cap, Capability::Messages);
    }

    #[test]
    fn filter_semantics() {
        let caps = [Capability::Bank];
        assert!(matches_any(&caps, None));
        assert!(matches_any(&caps, Some(&[])));
        assert!(matches_any(&caps, Some(&[Capability::Messages, Capability::Bank])));
        assert!(!matches_any(&caps, Some(&[Capability::Messages])));
    }
}
