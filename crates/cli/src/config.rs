use std::path::Path;
use std::time::Duration;

use anyhow::{bail, Context, Result};
use courier_core::{ConfigError, Selector, SelectorSpec};
use serde::{Deserialize, Serialize};
use tracing::warn;

pub const MIN_FLUSH: Duration = Duration::from_secs(10);
pub const MIN_RESYNC: Duration = Duration::from_secs(3600);

const DEFAULT_KINDS: &[(&str, &str)] = &[("apps/v1", "Deployment")];

const EXTENDED_KINDS: &[(&str, &str)] = &[
    ("apps/v1", "Deployment"),
    ("apps/v1", "StatefulSet"),
    ("apps/v1", "DaemonSet"),
    ("batch/v1", "CronJob"),
    ("v1", "Service"),
    ("apiregistration.k8s.io/v1", "APIService"),
    ("autoscaling/v2", "HorizontalPodAutoscaler"),
    ("v1", "Pod"),
];

/// Contents of the `--config` file.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct Configuration {
    #[serde(default)]
    pub selectors: Vec<Selector>,
}

impl Configuration {
    pub fn default_set() -> Result<Self, ConfigError> { Self::from_kinds(DEFAULT_KINDS) }

    pub fn extended_set() -> Result<Self, ConfigError> { Self::from_kinds(EXTENDED_KINDS) }

    fn from_kinds(kinds: &[(&str, &str)]) -> Result<Self, ConfigError> {
        let selectors = kinds
            .iter()
            .map(|(api_version, kind)| {
                Selector::try_from(SelectorSpec {
                    api_version: (*api_version).to_string(),
                    kind: (*kind).to_string(),
                    exclude_namespaces: Vec::new(),
                })
            })
            .collect::<Result<Vec<_>, _>>()?;
        Ok(Self { selectors })
    }

    pub fn load(path: &Path) -> Result<Self> {
        let raw = std::fs::read_to_string(path).with_context(|| format!("reading config {}", path.display()))?;
        let cfg: Configuration = serde_yaml::from_str(&raw).with_context(|| format!("parsing config {}", path.display()))?;
        if cfg.selectors.is_empty() {
            bail!("config {} lists no selectors", path.display());
        }
        Ok(cfg)
    }
}

/// Raise `requested` to `floor`, with a warning when it was below.
pub fn clamp_interval(name: &str, requested: Duration, floor: Duration) -> Duration {
    if requested < floor {
        warn!(interval = name, requested_secs = requested.as_secs(), floor_secs = floor.as_secs(), "interval below minimum; using floor");
        floor
    } else {
        requested
    }
}
