use serde::{Deserialize, Serialize};

use crate::{join_non_empty, meta_str, Payload, ResourceType};

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash)]
#[serde(rename_all = "lowercase")]
pub enum Operation {
    Create,
    Update,
    Delete,
}

impl Operation {
    pub fn as_str(&self) -> &'static str {
        match self {
            Operation::Create => "create",
            Operation::Update => "update",
            Operation::Delete => "delete",
        }
    }
}

impl std::fmt::Display for Operation {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// A single observed change of one cluster object.
///
/// For `Delete`, `current` is the last-known state of the object.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct ChangeEvent {
    /// Dedup key, see [`dedup_key`].
    pub key: String,
    pub op: Operation,
    pub resource: ResourceType,
    pub previous: Option<Payload>,
    pub current: Payload,
}

impl ChangeEvent {
    pub fn new(op: Operation, resource: ResourceType, previous: Option<Payload>, current: Payload) -> Self {
        let key = dedup_key(&resource, &current);
        Self { key, op, resource, previous, current }
    }

    pub fn namespace(&self) -> &str { meta_str(&self.current, "namespace") }
    pub fn uid(&self) -> &str { meta_str(&self.current, "uid") }

    /// Kind under which the sink stores the object: `group/version/kind`.
    pub fn external_kind(&self) -> String { self.resource.id() }

    /// Identifier of the object in the sink: `cluster/namespace/uid`.
    pub fn external_id(&self, cluster: &str) -> String {
        join_non_empty([cluster, self.namespace(), self.uid()])
    }
}

/// Coalescing key: `group/version/kind/namespace/uid`, empty components elided.
pub fn dedup_key(resource: &ResourceType, obj: &Payload) -> String {
    join_non_empty([
        resource.group.as_str(),
        resource.version.as_str(),
        resource.kind.as_str(),
        meta_str(obj, "namespace"),
        meta_str(obj, "uid"),
    ])
}
