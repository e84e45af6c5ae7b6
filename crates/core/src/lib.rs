//! Courier core types: selectors, change events and the key derivations shared by
//! the watcher, the aggregator and the dispatcher.

#![forbid(unsafe_code)]

use serde::{Deserialize, Serialize};

mod event;
mod selector;

pub use event::{dedup_key, ChangeEvent, Operation};
pub use selector::{Selector, SelectorSpec};

/// Schema-less object as delivered by the cluster (recursively nested JSON).
pub type Payload = serde_json::Value;

pub mod prelude {
    pub use super::{ChangeEvent, ConfigError, Operation, Payload, ResourceType, Selector};
}

/// Group/Version/Kind triple of a watchable resource type.
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq, Eq, Hash)]
pub struct ResourceType {
    pub group: String,
    pub version: String,
    pub kind: String,
}

impl ResourceType {
    pub fn new(group: impl Into<String>, version: impl Into<String>, kind: impl Into<String>) -> Self {
        Self { group: group.into(), version: version.into(), kind: kind.into() }
    }

    /// `apiVersion` as written in manifests: `v1` for the core group, `group/version` otherwise.
    pub fn api_version(&self) -> String {
        if self.group.is_empty() {
            self.version.clone()
        } else {
            format!("{}/{}", self.group, self.version)
        }
    }

    /// Stable identity, e.g. `apps/v1/Deployment` or `v1/Service`.
    pub fn id(&self) -> String {
        join_non_empty([self.group.as_str(), self.version.as_str(), self.kind.as_str()])
    }
}

impl std::fmt::Display for ResourceType {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(&self.id())
    }
}

/// Invalid configuration. Fatal at load time.
#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("invalid apiVersion {0:?} (expect \"v1\" or \"group/v1\")")]
    InvalidApiVersion(String),
    #[error("selector {0:?} is missing a kind")]
    MissingKind(String),
    #[error("selector {selector}: invalid namespace exclusion {pattern:?}: {source}")]
    InvalidExclusion {
        selector: String,
        pattern: String,
        #[source]
        source: regex::Error,
    },
}

/// Slash-join the given components, skipping empty ones.
pub fn join_non_empty<'a>(parts: impl IntoIterator<Item = &'a str>) -> String {
    parts.into_iter().filter(|s| !s.is_empty()).collect::<Vec<_>>().join("/")
}

/// Read a string field under `metadata`, or `""` when absent.
pub fn meta_str<'a>(obj: &'a Payload, field: &str) -> &'a str {
    obj.get("metadata").and_then(|m| m.get(field)).and_then(|v| v.as_str()).unwrap_or("")
}
