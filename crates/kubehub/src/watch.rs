use std::sync::Arc;
use std::time::Duration;

use courier_core::{meta_str, ChangeEvent, Operation, Payload, ResourceType, Selector};
use futures::StreamExt;
use kube::core::{DynamicObject, TypeMeta};
use kube::runtime::watcher::Event;
use metrics::counter;
use rustc_hash::{FxHashMap, FxHashSet};
use tokio::sync::mpsc;
use tokio::time::{Instant, MissedTickBehavior};
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use crate::{ResolutionError, ResolvedResource, ResourceProvider};

const REOPEN_DELAY: Duration = Duration::from_secs(1);

/// Turns the provider's notifications for one resource type into [`ChangeEvent`]s.
///
/// Keeps the last-known state per dedup key so that modifications carry their previous
/// state, relists can be diffed into deletes, and resyncs can re-emit everything.
pub struct Watcher {
    selector: Selector,
    resource: ResolvedResource,
    provider: Arc<dyn ResourceProvider>,
    known: FxHashMap<String, Payload>,
}

impl Watcher {
    pub async fn new(provider: Arc<dyn ResourceProvider>, selector: Selector) -> Result<Self, ResolutionError> {
        let resource = provider.resolve(selector.gvk()).await?;
        debug!(selector = %selector.id(), plural = %resource.api_resource.plural, namespaced = resource.namespaced, "resolved");
        Ok(Self { selector, resource, provider, known: FxHashMap::default() })
    }

    pub fn selector(&self) -> &Selector { &self.selector }

    /// Watch until `cancel` fires or the queue receiver goes away.
    pub async fn run(mut self, tx: mpsc::Sender<ChangeEvent>, resync: Duration, cancel: CancellationToken) {
        let id = self.selector.id();
        info!(selector = %id, resync_secs = resync.as_secs(), "watcher starting");
        let mut resync_tick = tokio::time::interval_at(Instant::now() + resync, resync);
        resync_tick.set_missed_tick_behavior(MissedTickBehavior::Delay);

        'session: loop {
            let mut stream = self.provider.watch(&self.resource);
            loop {
                let batch = tokio::select! {
                    _ = cancel.cancelled() => break 'session,
                    _ = resync_tick.tick() => self.resync(),
                    next = stream.next() => match next {
                        Some(Ok(ev)) => self.on_event(ev),
                        Some(Err(e)) => {
                            warn!(selector = %id, error = %e, "watch stream error");
                            continue;
                        }
                        None => {
                            warn!(selector = %id, "watch stream ended; reopening");
                            tokio::select! {
                                _ = cancel.cancelled() => break 'session,
                                _ = tokio::time::sleep(REOPEN_DELAY) => continue 'session,
                            }
                        }
                    },
                };
                for evt in batch {
                    if !emit(&tx, &cancel, evt).await {
                        break 'session;
                    }
                }
            }
        }
        info!(selector = %id, "watcher stopped");
    }

    fn on_event(&mut self, ev: Event<DynamicObject>) -> Vec<ChangeEvent> {
        match ev {
            Event::Applied(o) => self.applied(o).into_iter().collect(),
            Event::Deleted(o) => self.deleted(o).into_iter().collect(),
            Event::Restarted(list) => {
                debug!(selector = %self.selector.id(), count = list.len(), "watch restart");
                let mut out = Vec::with_capacity(list.len());
                let mut listed = FxHashSet::default();
                for o in list {
                    if let Some(evt) = self.applied(o) {
                        listed.insert(evt.key.clone());
                        out.push(evt);
                    }
                }
                let gone: Vec<String> = self.known.keys().filter(|k| !listed.contains(*k)).cloned().collect();
                for key in gone {
                    if let Some(last) = self.known.remove(&key) {
                        out.push(ChangeEvent::new(Operation::Delete, self.gvk().clone(), Some(last.clone()), last));
                    }
                }
                out
            }
        }
    }

    fn applied(&mut self, obj: DynamicObject) -> Option<ChangeEvent> {
        let current = self.to_payload(obj)?;
        let mut evt = ChangeEvent::new(Operation::Create, self.gvk().clone(), None, current);
        if let Some(previous) = self.known.insert(evt.key.clone(), evt.current.clone()) {
            evt.op = Operation::Update;
            evt.previous = Some(previous);
        }
        Some(evt)
    }

    fn deleted(&mut self, obj: DynamicObject) -> Option<ChangeEvent> {
        let current = self.to_payload(obj)?;
        let mut evt = ChangeEvent::new(Operation::Delete, self.gvk().clone(), None, current);
        evt.previous = self.known.remove(&evt.key);
        Some(evt)
    }

    /// Re-deliver every known object as an update.
    fn resync(&self) -> Vec<ChangeEvent> {
        debug!(selector = %self.selector.id(), count = self.known.len(), "resync");
        self.known
            .values()
            .map(|obj| ChangeEvent::new(Operation::Update, self.gvk().clone(), Some(obj.clone()), obj.clone()))
            .collect()
    }

    /// Serialize the object, or `None` when it is excluded or cannot be serialized.
    fn to_payload(&self, mut obj: DynamicObject) -> Option<Payload> {
        if obj.types.is_none() {
            let gvk = self.gvk();
            obj.types = Some(TypeMeta { api_version: gvk.api_version(), kind: gvk.kind.clone() });
        }
        let payload = match serde_json::to_value(&obj) {
            Ok(v) => v,
            Err(e) => {
                error!(selector = %self.selector.id(), error = %e, "serializing DynamicObject");
                return None;
            }
        };
        let ns = meta_str(&payload, "namespace");
        if self.selector.excludes_namespace(ns) {
            debug!(selector = %self.selector.id(), ns = %ns, "excluded namespace");
            return None;
        }
        Some(payload)
    }

    fn gvk(&self) -> &ResourceType { &self.resource.gvk }
}

/// Blocking queue write that gives up on cancellation. False means stop watching.
async fn emit(tx: &mpsc::Sender<ChangeEvent>, cancel: &CancellationToken, evt: ChangeEvent) -> bool {
    let op = evt.op.as_str();
    tokio::select! {
        _ = cancel.cancelled() => false,
        res = tx.send(evt) => match res {
            Ok(()) => {
                counter!("watcher_events_total", 1u64, "op" => op);
                true
            }
            Err(_) => {
                debug!("event queue closed");
                false
            }
        },
    }
}
