//! Courier sink: turns released change events into calls against the external
//! system-of-record.
//!
//! [`Dispatcher`] is the aggregator's [`courier_store::Handler`]. It derives the external
//! identity of each event, normalizes the payload and talks to a [`Sink`] transport:
//! [`GraphqlSink`] for upsert/delete mutations, [`WebhookSink`] for raw posts.

#![forbid(unsafe_code)]

use std::time::Duration;

use async_trait::async_trait;
use courier_core::Payload;

mod dispatch;
mod graphql;
mod webhook;

pub use dispatch::{DispatchConfig, Dispatcher};
pub use graphql::{GraphqlSink, IdentifierInput};
pub use webhook::WebhookSink;

/// Generic object form the sink accepts as an upsert value.
pub type JsonObject = serde_json::Map<String, serde_json::Value>;

/// Fields stripped from every payload, on top of any configured extras.
pub const DEFAULT_STRIP_FIELDS: &[&str] = &["metadata.managedFields"];

#[derive(Debug, thiserror::Error)]
pub enum SinkError {
    #[error("http: {0}")]
    Http(#[from] reqwest::Error),
    #[error("unexpected status {status}: {body}")]
    Status { status: u16, body: String },
    #[error("mutation errors: {}", .0.join("; "))]
    Mutation(Vec<String>),
}

#[derive(Debug, thiserror::Error)]
#[error("normalizing payload: {0}")]
pub struct NormalizeError(#[from] serde_json::Error);

/// Transport to the system-of-record.
#[async_trait]
pub trait Sink: Send + Sync {
    /// Verb used in log lines for upserts.
    fn upsert_verb(&self) -> &'static str { "UPSERT" }

    /// Kind as it goes on the wire; log lines use it too.
    fn wire_kind(&self, kind: &str) -> String { kind.to_string() }

    /// Transports that cannot remove objects return false; deletes are then skipped.
    fn supports_delete(&self) -> bool { true }

    async fn upsert(&self, kind: &str, id: &str, value: &JsonObject) -> Result<(), SinkError>;

    async fn delete(&self, kind: &str, id: &str) -> Result<(), SinkError>;
}

/// Webhook-style integration targets take raw posts instead of mutations.
pub fn is_webhook_target(integration: &str) -> bool {
    integration.contains("integrations/custom/webhook")
}

/// Pick the transport for an integration target.
pub fn sink_for(integration: &str, api_url: &str, api_token: Option<String>, timeout: Duration) -> anyhow::Result<Box<dyn Sink>> {
    if is_webhook_target(integration) {
        Ok(Box::new(WebhookSink::new(integration, timeout)?))
    } else {
        Ok(Box::new(GraphqlSink::new(api_url, api_token, integration, timeout)?))
    }
}

/// Strip noisy fields and round-trip the payload into a generic JSON object.
///
/// [`DEFAULT_STRIP_FIELDS`] are always removed; `extra` adds more dotted paths
/// (`status.conditions`). Missing paths are ignored.
pub fn normalize(payload: &Payload, extra: &[String]) -> Result<JsonObject, NormalizeError> {
    let mut v = payload.clone();
    for path in DEFAULT_STRIP_FIELDS.iter().copied().chain(extra.iter().map(String::as_str)) {
        remove_path(&mut v, path);
    }
    let bytes = serde_json::to_vec(&v)?;
    Ok(serde_json::from_slice(&bytes)?)
}

fn remove_path(v: &mut Payload, path: &str) {
    let mut parts: Vec<&str> = path.split('.').filter(|p| !p.is_empty()).collect();
    let Some(last) = parts.pop() else { return };
    let mut cur = v;
    for p in parts {
        match cur.get_mut(p) {
            Some(next) => cur = next,
            None => return,
        }
    }
    if let Some(obj) = cur.as_object_mut() {
        obj.remove(last);
    }
}
