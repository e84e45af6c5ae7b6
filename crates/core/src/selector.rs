use regex::Regex;
use serde::{Deserialize, Serialize};

use crate::{ConfigError, ResourceType};

/// Selector as written in configuration files.
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct SelectorSpec {
    pub api_version: String,
    pub kind: String,
    /// Namespace patterns (full-match regular expressions) whose objects are skipped.
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub exclude_namespaces: Vec<String>,
}

/// A validated selector for one watchable resource type.
///
/// Group and version are derived from `apiVersion` once, at construction; a selector
/// that exists always has a well-formed group/version.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(try_from = "SelectorSpec", into = "SelectorSpec")]
pub struct Selector {
    spec: SelectorSpec,
    gvk: ResourceType,
    excludes: Vec<Regex>,
}

impl Selector {
    pub fn new(api_version: &str, kind: &str) -> Result<Self, ConfigError> {
        Self::try_from(SelectorSpec {
            api_version: api_version.to_string(),
            kind: kind.to_string(),
            exclude_namespaces: Vec::new(),
        })
    }

    pub fn with_exclusions<I, S>(api_version: &str, kind: &str, patterns: I) -> Result<Self, ConfigError>
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        Self::try_from(SelectorSpec {
            api_version: api_version.to_string(),
            kind: kind.to_string(),
            exclude_namespaces: patterns.into_iter().map(Into::into).collect(),
        })
    }

    pub fn api_version(&self) -> &str { &self.spec.api_version }
    pub fn kind(&self) -> &str { &self.spec.kind }
    pub fn group(&self) -> &str { &self.gvk.group }
    pub fn version(&self) -> &str { &self.gvk.version }
    pub fn gvk(&self) -> &ResourceType { &self.gvk }

    /// `group/version/kind` with empty components elided.
    pub fn id(&self) -> String { self.gvk.id() }

    /// True when objects in `namespace` must not be forwarded.
    /// Cluster-scoped objects (empty namespace) are never excluded.
    pub fn excludes_namespace(&self, namespace: &str) -> bool {
        !namespace.is_empty() && self.excludes.iter().any(|re| re.is_match(namespace))
    }
}

impl TryFrom<SelectorSpec> for Selector {
    type Error = ConfigError;

    fn try_from(spec: SelectorSpec) -> Result<Self, Self::Error> {
        let (group, version) = parse_group_version(&spec.api_version)?;
        if spec.kind.trim().is_empty() {
            return Err(ConfigError::MissingKind(spec.api_version.clone()));
        }
        let gvk = ResourceType::new(group, version, spec.kind.clone());
        let excludes = spec
            .exclude_namespaces
            .iter()
            .map(|p| {
                Regex::new(&format!("^(?:{})$", p)).map_err(|source| ConfigError::InvalidExclusion {
                    selector: gvk.id(),
                    pattern: p.clone(),
                    source,
                })
            })
            .collect::<Result<Vec<_>, _>>()?;
        Ok(Self { spec, gvk, excludes })
    }
}

impl From<Selector> for SelectorSpec {
    fn from(s: Selector) -> Self { s.spec }
}

impl PartialEq for Selector {
    fn eq(&self, other: &Self) -> bool { self.spec == other.spec }
}

impl Eq for Selector {}

fn parse_group_version(api_version: &str) -> Result<(String, String), ConfigError> {
    let parts: Vec<_> = api_version.split('/').collect();
    match parts.as_slice() {
        [version] if !version.is_empty() => Ok((String::new(), (*version).to_string())),
        [group, version] if !group.is_empty() && !version.is_empty() => {
            Ok(((*group).to_string(), (*version).to_string()))
        }
        _ => Err(ConfigError::InvalidApiVersion(api_version.to_string())),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_core_and_grouped_api_versions() {
        let svc = Selector::new("v1", "Service").expect("core selector");
        assert_eq!(svc.group(), "");
        assert_eq!(svc.version(), "v1");
        assert_eq!(svc.id(), "v1/Service");

        let dep = Selector::new("apps/v1", "Deployment").expect("apps selector");
        assert_eq!(dep.group(), "apps");
        assert_eq!(dep.version(), "v1");
        assert_eq!(dep.id(), "apps/v1/Deployment");
    }

    #[test]
    fn malformed_api_version_is_a_config_error() {
        for bad in ["", "/", "apps/", "/v1", "a/b/c"] {
            let err = Selector::new(bad, "Deployment").unwrap_err();
            assert!(matches!(err, ConfigError::InvalidApiVersion(_)), "{bad:?} -> {err}");
        }
        assert!(matches!(Selector::new("apps/v1", " ").unwrap_err(), ConfigError::MissingKind(_)));
    }

    #[test]
    fn exclusions_match_whole_namespace() {
        let s = Selector::with_exclusions("apps/v1", "Deployment", ["kube-.*", "default"]).unwrap();
        assert!(s.excludes_namespace("kube-system"));
        assert!(s.excludes_namespace("default"));
        assert!(!s.excludes_namespace("default-web"));
        assert!(!s.excludes_namespace("web"));
        assert!(!s.excludes_namespace(""));
    }

    #[test]
    fn invalid_exclusion_pattern_is_rejected() {
        let err = Selector::with_exclusions("v1", "Pod", ["("]).unwrap_err();
        assert!(matches!(err, ConfigError::InvalidExclusion { .. }), "{err}");
    }

    #[test]
    fn deserializes_from_yaml_with_validation() {
        let ok: Selector = serde_yaml::from_str("apiVersion: batch/v1\nkind: CronJob\nexcludeNamespaces: [\"kube-system\"]\n").unwrap();
        assert_eq!(ok.id(), "batch/v1/CronJob");
        assert!(ok.excludes_namespace("kube-system"));

        let bad = serde_yaml::from_str::<Selector>("apiVersion: a/b/c\nkind: Thing\n");
        assert!(bad.is_err());
    }
}
