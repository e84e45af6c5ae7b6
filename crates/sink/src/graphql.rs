use std::time::Duration;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use serde_json::{json, Value};
use tracing::debug;

use crate::{JsonObject, Sink, SinkError};

const UPSERT_MUTATION: &str = "mutation IntegrationSourceObjectUpsert($id: String!, $kind: String!, $integration: IdentifierInput!, $value: JSON!) { integrationSourceObjectUpsert(externalId: $id, externalKind: $kind, integration: $integration, value: $value) { errors { message path } } }";
const DELETE_MUTATION: &str = "mutation IntegrationSourceObjectDelete($id: String!, $kind: String!, $integration: IdentifierInput!) { integrationSourceObjectDelete(externalId: $id, externalKind: $kind, integration: $integration) { errors { message path } } }";

/// Global ids are base64 of `gid://...`.
const GLOBAL_ID_PREFIX: &str = "Z2lkOi8v";

/// Integration reference as the GraphQL API expects it: by opaque id or by alias.
#[derive(Debug, Clone, Serialize, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum IdentifierInput {
    Id(String),
    Alias(String),
}

impl IdentifierInput {
    pub fn parse(value: &str) -> Self {
        if value.starts_with(GLOBAL_ID_PREFIX) {
            IdentifierInput::Id(value.to_string())
        } else {
            IdentifierInput::Alias(value.to_string())
        }
    }
}

#[derive(Debug, Deserialize)]
struct GraphqlResponse {
    #[serde(default)]
    data: Option<Value>,
    #[serde(default)]
    errors: Vec<GraphqlError>,
}

#[derive(Debug, Deserialize)]
struct GraphqlError {
    message: String,
}

/// Upserts and deletes integration source objects via GraphQL mutations.
#[derive(Debug, Clone)]
pub struct GraphqlSink {
    http: reqwest::Client,
    url: String,
    token: Option<String>,
    integration: IdentifierInput,
}

impl GraphqlSink {
    pub fn new(url: &str, token: Option<String>, integration: &str, timeout: Duration) -> Result<Self, SinkError> {
        let http = reqwest::Client::builder().timeout(timeout).build()?;
        Ok(Self { http, url: url.to_string(), token, integration: IdentifierInput::parse(integration) })
    }

    async fn mutate(&self, name: &str, query: &str, field: &str, variables: Value) -> Result<(), SinkError> {
        let body = json!({ "query": query, "variables": variables, "operationName": name });
        let mut req = self.http.post(&self.url).json(&body);
        if let Some(token) = &self.token {
            req = req.bearer_auth(token);
        }
        let resp = req.send().await?;
        let status = resp.status();
        if !status.is_success() {
            let body = resp.text().await.unwrap_or_default();
            return Err(SinkError::Status { status: status.as_u16(), body });
        }
        let parsed: GraphqlResponse = resp.json().await?;
        let mut messages: Vec<String> = parsed.errors.into_iter().map(|e| e.message).collect();
        if let Some(raw) = parsed.data.as_ref().and_then(|d| d.get(field)).and_then(|p| p.get("errors")) {
            messages.extend(payload_error_messages(raw));
        }
        if !messages.is_empty() {
            return Err(SinkError::Mutation(messages));
        }
        debug!(operation = name, "mutation ok");
        Ok(())
    }
}

/// Messages of a mutation payload's `errors` field. A non-null value that does not decode
/// is reported as-is rather than read as success.
fn payload_error_messages(raw: &Value) -> Vec<String> {
    if raw.is_null() {
        return Vec::new();
    }
    match serde_json::from_value::<Vec<GraphqlError>>(raw.clone()) {
        Ok(errors) => errors.into_iter().map(|e| e.message).collect(),
        Err(_) => vec![format!("unrecognized errors payload: {raw}")],
    }
}

#[async_trait]
impl Sink for GraphqlSink {
    async fn upsert(&self, kind: &str, id: &str, value: &JsonObject) -> Result<(), SinkError> {
        let variables = json!({
            "id": id,
            "kind": kind,
            "integration": self.integration,
            "value": value,
        });
        self.mutate("IntegrationSourceObjectUpsert", UPSERT_MUTATION, "integrationSourceObjectUpsert", variables).await
    }

    async fn delete(&self, kind: &str, id: &str) -> Result<(), SinkError> {
        let variables = json!({
            "id": id,
            "kind": kind,
            "integration": self.integration,
        });
        self.mutate("IntegrationSourceObjectDelete", DELETE_MUTATION, "integrationSourceObjectDelete", variables).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn payload_errors_decode_or_are_kept_raw() {
        assert!(payload_error_messages(&Value::Null).is_empty());
        assert!(payload_error_messages(&json!([])).is_empty());
        assert_eq!(payload_error_messages(&json!([{ "message": "boom", "path": ["x"] }])), vec!["boom".to_string()]);
        let odd = payload_error_messages(&json!([{ "code": 7 }]));
        assert_eq!(odd.len(), 1);
        assert!(odd[0].contains("\"code\":7"), "{odd:?}");
    }

    #[test]
    fn identifier_input_picks_id_or_alias() {
        assert_eq!(
            IdentifierInput::parse("Z2lkOi8vb3BzbGV2ZWwvSW50ZWdyYXRpb24vMTIz"),
            IdentifierInput::Id("Z2lkOi8vb3BzbGV2ZWwvSW50ZWdyYXRpb24vMTIz".to_string())
        );
        assert_eq!(IdentifierInput::parse("k8s-dev"), IdentifierInput::Alias("k8s-dev".to_string()));
        assert_eq!(serde_json::to_value(IdentifierInput::parse("k8s-dev")).unwrap(), json!({ "alias": "k8s-dev" }));
    }
}
