use std::time::Duration;

use async_trait::async_trait;
use tracing::debug;

use crate::{JsonObject, Sink, SinkError};

/// Posts normalized objects to a custom webhook integration. Never deletes.
#[derive(Debug, Clone)]
pub struct WebhookSink {
    http: reqwest::Client,
    url: String,
}

impl WebhookSink {
    pub fn new(url: &str, timeout: Duration) -> Result<Self, SinkError> {
        let http = reqwest::Client::builder().timeout(timeout).build()?;
        Ok(Self { http, url: url.to_string() })
    }
}

/// Webhook kinds use `_` where the external kind has `/`.
pub(crate) fn webhook_kind(kind: &str) -> String {
    kind.replace('/', "_")
}

#[async_trait]
impl Sink for WebhookSink {
    fn upsert_verb(&self) -> &'static str { "POST" }

    fn wire_kind(&self, kind: &str) -> String { webhook_kind(kind) }

    fn supports_delete(&self) -> bool { false }

    async fn upsert(&self, kind: &str, id: &str, value: &JsonObject) -> Result<(), SinkError> {
        let resp = self
            .http
            .post(&self.url)
            .query(&[("external_kind", self.wire_kind(kind))])
            .json(value)
            .send()
            .await?;
        let status = resp.status();
        if !status.is_success() {
            let body = resp.text().await.unwrap_or_default();
            return Err(SinkError::Status { status: status.as_u16(), body });
        }
        debug!(kind, id, "webhook post ok");
        Ok(())
    }

    async fn delete(&self, _kind: &str, _id: &str) -> Result<(), SinkError> {
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn kind_slashes_become_underscores() {
        assert_eq!(webhook_kind("apps/v1/Deployment"), "apps_v1_Deployment");
        assert_eq!(webhook_kind("v1/Service"), "v1_Service");
    }
}
