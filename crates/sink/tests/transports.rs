#![forbid(unsafe_code)]

use std::sync::Arc;
use std::time::Duration;

use courier_core::{ChangeEvent, Operation, ResourceType};
use courier_sink::{DispatchConfig, Dispatcher, GraphqlSink, JsonObject, Sink, SinkError, WebhookSink};
use courier_store::Handler;
use serde_json::json;
use wiremock::matchers::{body_partial_json, header, method, path, query_param};
use wiremock::{Mock, MockServer, ResponseTemplate};

const TIMEOUT: Duration = Duration::from_secs(5);

fn value() -> JsonObject {
    json!({ "metadata": { "name": "web" }, "spec": { "replicas": 2 } }).as_object().cloned().unwrap()
}

fn graphql(server: &MockServer) -> GraphqlSink {
    GraphqlSink::new(&format!("{}/graphql", server.uri()), Some("s3cr3t".into()), "k8s-dev", TIMEOUT).unwrap()
}

fn upsert_ok() -> ResponseTemplate {
    ResponseTemplate::new(200).set_body_json(json!({ "data": { "integrationSourceObjectUpsert": { "errors": [] } } }))
}

#[tokio::test]
async fn graphql_upsert_sends_mutation_variables() {
    let server = MockServer::start().await;
    Mock::given(method("POST"))
        .and(path("/graphql"))
        .and(header("authorization", "Bearer s3cr3t"))
        .and(body_partial_json(json!({
            "operationName": "IntegrationSourceObjectUpsert",
            "variables": {
                "id": "dev/web/abc",
                "kind": "apps/v1/Deployment",
                "integration": { "alias": "k8s-dev" },
                "value": { "spec": { "replicas": 2 } }
            }
        })))
        .respond_with(upsert_ok())
        .expect(1)
        .mount(&server)
        .await;

    graphql(&server).upsert("apps/v1/Deployment", "dev/web/abc", &value()).await.unwrap();
}

#[tokio::test]
async fn graphql_delete_sends_no_value() {
    let server = MockServer::start().await;
    Mock::given(method("POST"))
        .and(path("/graphql"))
        .and(body_partial_json(json!({
            "operationName": "IntegrationSourceObjectDelete",
            "variables": { "id": "dev/web/abc", "kind": "apps/v1/Deployment" }
        })))
        .respond_with(ResponseTemplate::new(200).set_body_json(json!({ "data": { "integrationSourceObjectDelete": { "errors": [] } } })))
        .expect(1)
        .mount(&server)
        .await;

    graphql(&server).delete("apps/v1/Deployment", "dev/web/abc").await.unwrap();
    let received = server.received_requests().await.unwrap();
    let body: serde_json::Value = serde_json::from_slice(&received[0].body).unwrap();
    assert!(body["variables"].get("value").is_none());
}

#[tokio::test]
async fn graphql_payload_errors_are_reported() {
    let server = MockServer::start().await;
    Mock::given(method("POST"))
        .respond_with(ResponseTemplate::new(200).set_body_json(json!({
            "data": { "integrationSourceObjectUpsert": { "errors": [ { "message": "integration not found", "path": ["integration"] } ] } }
        })))
        .mount(&server)
        .await;

    let err = graphql(&server).upsert("apps/v1/Deployment", "dev/web/abc", &value()).await.unwrap_err();
    match err {
        SinkError::Mutation(msgs) => assert_eq!(msgs, vec!["integration not found".to_string()]),
        other => panic!("unexpected error {other}"),
    }
}

#[tokio::test]
async fn graphql_undecodable_payload_errors_are_not_success() {
    let server = MockServer::start().await;
    Mock::given(method("POST"))
        .respond_with(ResponseTemplate::new(200).set_body_json(json!({
            "data": { "integrationSourceObjectUpsert": { "errors": [ { "code": "FORBIDDEN" } ] } }
        })))
        .mount(&server)
        .await;

    let err = graphql(&server).upsert("apps/v1/Deployment", "dev/web/abc", &value()).await.unwrap_err();
    match err {
        SinkError::Mutation(msgs) => assert!(msgs[0].contains("FORBIDDEN"), "{msgs:?}"),
        other => panic!("unexpected error {other}"),
    }
}

#[tokio::test]
async fn graphql_top_level_errors_and_bad_status_are_reported() {
    let server = MockServer::start().await;
    Mock::given(method("POST"))
        .and(path("/graphql"))
        .respond_with(ResponseTemplate::new(200).set_body_json(json!({ "errors": [ { "message": "unauthorized" } ] })))
        .mount(&server)
        .await;
    let err = graphql(&server).delete("v1/Service", "dev/web/s1").await.unwrap_err();
    assert!(matches!(err, SinkError::Mutation(ref m) if m == &vec!["unauthorized".to_string()]), "{err}");

    let down = MockServer::start().await;
    Mock::given(method("POST")).respond_with(ResponseTemplate::new(502).set_body_string("bad gateway")).mount(&down).await;
    let err = graphql(&down).upsert("v1/Service", "dev/web/s1", &value()).await.unwrap_err();
    assert!(matches!(err, SinkError::Status { status: 502, .. }), "{err}");
}

#[tokio::test]
async fn webhook_posts_with_external_kind_and_never_deletes() {
    let server = MockServer::start().await;
    Mock::given(method("POST"))
        .and(path("/integrations/custom/webhook/abc"))
        .and(query_param("external_kind", "apps_v1_Deployment"))
        .and(body_partial_json(json!({ "spec": { "replicas": 2 } })))
        .respond_with(ResponseTemplate::new(202))
        .expect(1)
        .mount(&server)
        .await;

    let sink = WebhookSink::new(&format!("{}/integrations/custom/webhook/abc", server.uri()), TIMEOUT).unwrap();
    assert_eq!(sink.upsert_verb(), "POST");
    assert!(!sink.supports_delete());
    sink.upsert("apps/v1/Deployment", "dev/web/abc", &value()).await.unwrap();
    sink.delete("apps/v1/Deployment", "dev/web/abc").await.unwrap();
    assert_eq!(server.received_requests().await.unwrap().len(), 1);
}

#[tokio::test]
async fn webhook_bad_status_is_an_error() {
    let server = MockServer::start().await;
    Mock::given(method("POST")).respond_with(ResponseTemplate::new(404)).mount(&server).await;
    let sink = WebhookSink::new(&server.uri(), TIMEOUT).unwrap();
    let err = sink.upsert("v1/Service", "dev/web/s1", &value()).await.unwrap_err();
    assert!(matches!(err, SinkError::Status { status: 404, .. }), "{err}");
}

fn created_deployment() -> ChangeEvent {
    let obj = json!({
        "apiVersion": "apps/v1",
        "kind": "Deployment",
        "metadata": { "name": "web", "namespace": "web", "uid": "abc", "managedFields": [ {} ] },
        "spec": { "replicas": 2 }
    });
    ChangeEvent::new(Operation::Create, ResourceType::new("apps", "v1", "Deployment"), None, obj)
}

#[tokio::test]
async fn dispatcher_reaches_graphql_once_per_event() {
    let server = MockServer::start().await;
    Mock::given(method("POST"))
        .and(path("/graphql"))
        .and(body_partial_json(json!({ "variables": { "id": "dev/web/abc", "kind": "apps/v1/Deployment" } })))
        .respond_with(upsert_ok())
        .expect(1)
        .mount(&server)
        .await;

    let config = DispatchConfig { cluster: "dev".into(), ..Default::default() };
    let dispatcher = Dispatcher::new(Arc::new(graphql(&server)), config);
    dispatcher.handle(created_deployment()).await;

    let received = server.received_requests().await.unwrap();
    let body: serde_json::Value = serde_json::from_slice(&received[0].body).unwrap();
    assert!(body["variables"]["value"]["metadata"].get("managedFields").is_none());
}

#[tokio::test]
async fn dry_run_dispatcher_never_touches_the_network() {
    let server = MockServer::start().await;
    Mock::given(method("POST")).respond_with(upsert_ok()).expect(0).mount(&server).await;

    let config = DispatchConfig { cluster: "dev".into(), dry_run: true, ..Default::default() };
    let dispatcher = Dispatcher::new(Arc::new(graphql(&server)), config);
    dispatcher.handle(created_deployment()).await;
    let mut deleted = created_deployment();
    deleted.op = Operation::Delete;
    dispatcher.handle(deleted).await;
}
