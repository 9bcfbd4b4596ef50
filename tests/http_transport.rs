mod common;

use axum::extract::State;
use axum::http::{HeaderMap, StatusCode};
use axum::routing::post;
use axum::{Json, Router};
use common::{eventually, setup_store};
use json_outbox::db::DurableStore;
use json_outbox::error::TransportError;
use json_outbox::model::{CommitMode, ContextId};
use json_outbox::notifier::{ChannelBroadcast, DeliveryNotifier, NotifyMode};
use json_outbox::scheduler::Scheduler;
use json_outbox::transport::{HttpTransport, Transport};
use json_outbox::{OutboxCoordinator, OutboxEnv, SyncAgent};
use reqwest::Url;
use serde_json::{json, Value};
use std::net::SocketAddr;
use std::sync::{Arc, Mutex};

#[derive(Debug, Clone)]
struct Seen {
    content_type: String,
    accept: String,
    body: String,
}

type Requests = Arc<Mutex<Vec<Seen>>>;

fn header(headers: &HeaderMap, name: &str) -> String {
    headers
        .get(name)
        .and_then(|h| h.to_str().ok())
        .unwrap_or_default()
        .to_string()
}

async fn echo(State(seen): State<Requests>, headers: HeaderMap, body: String) -> (StatusCode, Json<Value>) {
    seen.lock().unwrap().push(Seen {
        content_type: header(&headers, "content-type"),
        accept: header(&headers, "accept"),
        body: body.clone(),
    });
    let parsed: Value = serde_json::from_str(&body).unwrap_or(Value::Null);
    (StatusCode::CREATED, Json(json!({ "received": parsed })))
}

async fn empty(State(seen): State<Requests>, body: String) -> StatusCode {
    seen.lock().unwrap().push(Seen {
        content_type: String::new(),
        accept: String::new(),
        body,
    });
    StatusCode::NO_CONTENT
}

async fn broken() -> (StatusCode, &'static str) {
    (StatusCode::INTERNAL_SERVER_ERROR, "boom")
}

async fn spawn_server() -> (SocketAddr, Requests) {
    let seen = Requests::default();
    let app = Router::new()
        .route("/echo", post(echo))
        .route("/empty", post(empty))
        .route("/broken", post(broken))
        .with_state(seen.clone());
    let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    tokio::spawn(async move {
        axum::serve(listener, app).await.unwrap();
    });
    (addr, seen)
}

fn transport(addr: SocketAddr) -> HttpTransport {
    HttpTransport::new("json-outbox-test", Some(std::time::Duration::from_secs(5)))
        .unwrap()
        .with_base_url(Url::parse(&format!("http://{addr}/")).unwrap())
}

#[tokio::test]
async fn posts_body_verbatim_with_json_headers() {
    let (addr, seen) = spawn_server().await;
    let body = r#"{"z":1,  "a":[2,3]}"#;

    let response = transport(addr).send_with_response("/echo", body).await.unwrap();
    assert_eq!(response.status_code, 201);
    assert_eq!(
        response.result,
        Some(json!({ "received": { "z": 1, "a": [2, 3] } }))
    );

    let seen = seen.lock().unwrap();
    assert_eq!(seen.len(), 1);
    assert_eq!(seen[0].content_type, "application/json");
    assert_eq!(seen[0].accept, "application/json, */*;q=0.5");
    assert_eq!(seen[0].body, body);
}

#[tokio::test]
async fn empty_response_body_is_none() {
    let (addr, _) = spawn_server().await;
    let response = transport(addr).send_with_response("/empty", "{}").await.unwrap();
    assert_eq!(response.status_code, 204);
    assert_eq!(response.result, None);
}

#[tokio::test]
async fn server_error_is_still_a_response() {
    let (addr, _) = spawn_server().await;
    let response = transport(addr).send_with_response("/broken", "{}").await.unwrap();
    assert_eq!(response.status_code, 500);
    assert_eq!(response.result, None);

    let response = transport(addr).send_with_response("/missing", "{}").await.unwrap();
    assert_eq!(response.status_code, 404);
}

#[tokio::test]
async fn refused_connection_is_a_network_error() {
    let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    drop(listener);

    let err = transport(addr)
        .send_with_response("/echo", "{}")
        .await
        .unwrap_err();
    assert!(matches!(err, TransportError::Network(_)));
    assert!(err.is_retryable());
}

#[tokio::test]
async fn best_effort_send_reaches_server() {
    let (addr, seen) = spawn_server().await;
    assert!(transport(addr).send_best_effort("/empty", r#"{"bye":true}"#));
    eventually(|| seen.lock().unwrap().len() == 1).await;
    assert_eq!(seen.lock().unwrap()[0].body, r#"{"bye":true}"#);
}

#[tokio::test]
async fn coordinator_delivers_over_http() {
    let (addr, seen) = spawn_server().await;
    let store = setup_store().await;
    let page = OutboxCoordinator::new(
        OutboxEnv::new(
            Arc::new(transport(addr)),
            Arc::new(ChannelBroadcast::new()),
            Scheduler::new(true),
        )
        .with_store(store.clone()),
    );
    page.install().await;

    let got = Arc::new(Mutex::new(None));
    let g = got.clone();
    page.post_json_with("/echo", r#"{"comment":"hi"}"#, move |result, status| {
        *g.lock().unwrap() = Some((result, status));
    })
    .await;

    let got = got.lock().unwrap().clone();
    assert_eq!(
        got,
        Some((Some(json!({ "received": { "comment": "hi" } })), 201))
    );
    assert_eq!(seen.lock().unwrap().len(), 1);
    assert_eq!(store.count().await.unwrap(), 0);
}

#[tokio::test]
async fn relative_endpoint_without_base_is_not_retried() {
    let err = HttpTransport::new("json-outbox-test", None)
        .unwrap()
        .send_with_response("/relative", "{}")
        .await
        .unwrap_err();
    assert!(matches!(err, TransportError::InvalidEndpoint { .. }));
    assert!(!err.is_retryable());
}

#[tokio::test]
async fn agent_skips_unresolvable_record_and_delivers_the_rest() {
    let (addr, seen) = spawn_server().await;
    let store = setup_store().await;
    store.add("/relative", "{}", CommitMode::Deferred).await.unwrap();
    store
        .add(&format!("http://{addr}/empty"), r#"{"ok":1}"#, CommitMode::Deferred)
        .await
        .unwrap();

    let notifier = DeliveryNotifier::new(
        Arc::new(ChannelBroadcast::new()),
        NotifyMode::Direct,
        ContextId::new(),
    );
    let (agent, _handle) = SyncAgent::new(
        store.clone(),
        Arc::new(HttpTransport::new("json-outbox-test", None).unwrap()),
        notifier,
        Scheduler::new(true),
        "sendJSON",
    );

    let report = agent.drain().await.unwrap();
    assert_eq!(report.delivered, 1);
    assert_eq!(report.rejected, 1);
    assert_eq!(report.stalled_on, None);
    assert_eq!(store.count().await.unwrap(), 0);

    let seen = seen.lock().unwrap();
    assert_eq!(seen.len(), 1);
    assert_eq!(seen[0].body, r#"{"ok":1}"#);
}

#[tokio::test]
async fn page_sweep_skips_unresolvable_record() {
    let (addr, seen) = spawn_server().await;
    let store = setup_store().await;
    store.add("/relative", "{}", CommitMode::Deferred).await.unwrap();
    store
        .add(&format!("http://{addr}/empty"), "[]", CommitMode::Deferred)
        .await
        .unwrap();

    let page = OutboxCoordinator::new(
        OutboxEnv::new(
            Arc::new(HttpTransport::new("json-outbox-test", None).unwrap()),
            Arc::new(ChannelBroadcast::new()),
            Scheduler::new(true),
        )
        .with_store(store.clone()),
    );
    page.flush_outbox().await;
    page.flush_outbox().await;

    assert_eq!(seen.lock().unwrap().len(), 1);
    assert_eq!(store.count().await.unwrap(), 0);
}
