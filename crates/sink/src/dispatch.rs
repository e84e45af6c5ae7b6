use std::sync::Arc;
use std::time::Instant;

use async_trait::async_trait;
use courier_core::{ChangeEvent, Operation};
use courier_store::Handler;
use metrics::{counter, histogram};
use tracing::{debug, error, info};

use crate::{normalize, Sink, SinkError};

/// Settings read by the dispatcher on every event.
#[derive(Debug, Clone, Default)]
pub struct DispatchConfig {
    /// Cluster name, first component of every external id.
    pub cluster: String,
    /// Run all dispatch logic but never call the sink.
    pub dry_run: bool,
    /// Dotted payload paths removed before upserting, in addition to `metadata.managedFields`.
    pub strip_fields: Vec<String>,
}

/// Aggregator handler that forwards each released event to a [`Sink`].
///
/// Every failure ends with a log line and the event being dropped; nothing is retried.
pub struct Dispatcher {
    sink: Arc<dyn Sink>,
    config: DispatchConfig,
}

impl Dispatcher {
    pub fn new(sink: Arc<dyn Sink>, config: DispatchConfig) -> Self {
        Self { sink, config }
    }

    async fn upsert(&self, event: &ChangeEvent, kind: &str, id: &str) {
        let value = match normalize(&event.current, &self.config.strip_fields) {
            Ok(v) => v,
            Err(e) => {
                counter!("dispatch_normalize_errors_total", 1u64);
                error!(key = %event.key, kind, id, error = %e, "failed to convert resource; dropping event");
                return;
            }
        };
        let verb = self.sink.upsert_verb();
        let wire_kind = self.sink.wire_kind(kind);
        if self.config.dry_run {
            info!(op = %event.op, "[DRYRUN] {} {} | {}", verb, wire_kind, id);
            debug!(value = ?value, "dry-run payload");
            return;
        }
        let started = Instant::now();
        let res = self.sink.upsert(kind, id, &value).await;
        record("upsert", started, &res);
        match res {
            Ok(()) => info!(op = %event.op, "{} {} | {}", verb, wire_kind, id),
            Err(e) => error!(key = %event.key, kind, id, error = %e, "upsert failed; dropping event"),
        }
    }

    async fn delete(&self, event: &ChangeEvent, kind: &str, id: &str) {
        if !self.sink.supports_delete() {
            debug!(key = %event.key, kind, id, "sink does not delete; skipping");
            return;
        }
        let wire_kind = self.sink.wire_kind(kind);
        if self.config.dry_run {
            info!("[DRYRUN] DELETE {} | {}", wire_kind, id);
            return;
        }
        let started = Instant::now();
        let res = self.sink.delete(kind, id).await;
        record("delete", started, &res);
        match res {
            Ok(()) => info!("DELETE {} | {}", wire_kind, id),
            Err(e) => error!(key = %event.key, kind, id, error = %e, "delete failed; dropping event"),
        }
    }
}

fn record(op: &'static str, started: Instant, res: &Result<(), SinkError>) {
    let outcome = if res.is_ok() { "ok" } else { "error" };
    counter!("sink_calls_total", 1u64, "op" => op, "outcome" => outcome);
    histogram!("sink_call_ms", started.elapsed().as_secs_f64() * 1000.0, "op" => op);
}

#[async_trait]
impl Handler for Dispatcher {
    async fn handle(&self, event: ChangeEvent) {
        let kind = event.external_kind();
        let id = event.external_id(&self.config.cluster);
        match event.op {
            Operation::Create | Operation::Update => self.upsert(&event, &kind, &id).await,
            Operation::Delete => self.delete(&event, &kind, &id).await,
        }
    }
}
