//! Courier kubehub: resolving selectors against API discovery and wiring one
//! list+watch stream per resolved resource type into the shared event queue.

#![forbid(unsafe_code)]

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use courier_core::{ChangeEvent, ResourceType, Selector};
use futures::{stream::BoxStream, StreamExt};
use kube::{
    api::Api,
    core::{ApiResource, DynamicObject, GroupVersionKind},
    discovery::{Discovery, Scope},
    runtime::{watcher, WatchStreamExt},
    Client,
};
use tokio::sync::{mpsc, OnceCell};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

mod watch;

pub use watch::Watcher;

/// Stream of list+watch notifications for one resource type, across all namespaces.
pub type WatchStream = BoxStream<'static, Result<watcher::Event<DynamicObject>, watcher::Error>>;

/// A selector's GVK after it has been mapped to a served resource.
#[derive(Debug, Clone)]
pub struct ResolvedResource {
    pub gvk: ResourceType,
    /// Provider handle carrying the plural resource name.
    pub api_resource: ApiResource,
    pub namespaced: bool,
}

#[derive(Debug, thiserror::Error)]
pub enum ResolutionError {
    #[error("no served resource for {0}")]
    NotFound(String),
    #[error("api discovery failed: {0}")]
    Discovery(#[source] kube::Error),
}

/// Source of resource types and their change streams.
#[async_trait]
pub trait ResourceProvider: Send + Sync {
    async fn resolve(&self, gvk: &ResourceType) -> Result<ResolvedResource, ResolutionError>;

    fn watch(&self, resource: &ResolvedResource) -> WatchStream;
}

/// [`ResourceProvider`] backed by a kube client. Discovery runs once, on first resolve.
pub struct KubeProvider {
    client: Client,
    discovery: OnceCell<Discovery>,
}

impl KubeProvider {
    pub fn new(client: Client) -> Self {
        Self { client, discovery: OnceCell::new() }
    }

    /// Build from the ambient kubeconfig or in-cluster service account.
    pub async fn try_default() -> Result<Self, kube::Error> {
        Ok(Self::new(Client::try_default().await?))
    }

    async fn discovery(&self) -> Result<&Discovery, ResolutionError> {
        self.discovery
            .get_or_try_init(|| async {
                let discovery = Discovery::new(self.client.clone()).run().await?;
                debug!(groups = discovery.groups().count(), "api discovery cached");
                Ok::<_, kube::Error>(discovery)
            })
            .await
            .map_err(ResolutionError::Discovery)
    }
}

#[async_trait]
impl ResourceProvider for KubeProvider {
    async fn resolve(&self, gvk: &ResourceType) -> Result<ResolvedResource, ResolutionError> {
        let discovery = self.discovery().await?;
        let key = GroupVersionKind::gvk(&gvk.group, &gvk.version, &gvk.kind);
        let (ar, caps) = discovery
            .resolve_gvk(&key)
            .ok_or_else(|| ResolutionError::NotFound(gvk.id()))?;
        Ok(ResolvedResource {
            gvk: gvk.clone(),
            api_resource: ar,
            namespaced: matches!(caps.scope, Scope::Namespaced),
        })
    }

    fn watch(&self, resource: &ResolvedResource) -> WatchStream {
        let api: Api<DynamicObject> = Api::all_with(self.client.clone(), &resource.api_resource);
        watcher::watcher(api, watcher::Config::default()).default_backoff().boxed()
    }
}

/// Resolve every selector and spawn a watcher task for each one that resolves.
///
/// Selectors that fail to resolve are logged and skipped; the rest still start.
pub async fn spawn_watchers(
    provider: Arc<dyn ResourceProvider>,
    selectors: &[Selector],
    resync: Duration,
    tx: mpsc::Sender<ChangeEvent>,
    cancel: &CancellationToken,
) -> Vec<JoinHandle<()>> {
    let mut handles = Vec::with_capacity(selectors.len());
    for selector in selectors {
        match Watcher::new(Arc::clone(&provider), selector.clone()).await {
            Ok(w) => handles.push(tokio::spawn(w.run(tx.clone(), resync, cancel.clone()))),
            Err(e) => warn!(selector = %selector.id(), error = %e, "skipping selector: cannot resolve resource type"),
        }
    }
    info!(started = handles.len(), configured = selectors.len(), "watchers spawned");
    handles
}
