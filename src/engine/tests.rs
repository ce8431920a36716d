//! Tests for engine module

use super::*;
use crate::state::{Bookmark, BookmarkState, HighWaterMark, MemoryStateStore};
use crate::types::JsonValue;
use pretty_assertions::assert_eq;
use serde_json::json;
use std::time::Duration;
use wiremock::matchers::{method, path, query_param};
use wiremock::{Mock, MockServer, ResponseTemplate};

const TOKEN_PATH: &str = "/oauth2/v1/token";
const INTEGRATIONS: &str = "/ic/api/integration/v1/integrations";
const CONNECTIONS: &str = "/ic/api/integration/v1/connections";

fn config(server: &MockServer, extra: JsonValue) -> ExtractorConfig {
    let mut value = json!({
        "base_url": server.uri(),
        "oauth_client_id": "client",
        "oauth_client_secret": "secret",
        "oauth_token_url": format!("{}{TOKEN_PATH}", server.uri()),
        "resources": ["integrations", "connections"],
        "page_size": 2,
        "min_page_size": 1,
        "max_retries": 1,
        "initial_backoff_ms": 1,
        "max_backoff_ms": 5
    });
    if let (Some(base), JsonValue::Object(extra)) = (value.as_object_mut(), extra) {
        base.extend(extra);
    }
    ExtractorConfig::from_json_str(&value.to_string()).unwrap()
}

async fn mount_token(server: &MockServer) {
    Mock::given(method("POST"))
        .and(path(TOKEN_PATH))
        .respond_with(ResponseTemplate::new(200).set_body_json(json!({
            "access_token": "token",
            "expires_in": 3600
        })))
        .mount(server)
        .await;
}

async fn mount_single_page(server: &MockServer, route: &str, items: JsonValue) {
    Mock::given(method("GET"))
        .and(path(route))
        .respond_with(ResponseTemplate::new(200).set_body_json(json!({
            "items": items,
            "hasMore": false
        })))
        .mount(server)
        .await;
}

fn item(id: &str, day: u32) -> JsonValue {
    json!({"id": id, "lastUpdated": format!("2024-02-{day:02}T00:00:00Z")})
}

async fn extractor(config: ExtractorConfig) -> Extractor {
    Extractor::new(config, Arc::new(MemoryStateStore::new()))
        .await
        .unwrap()
}

fn record_ids(messages: &[Message], resource: &str) -> Vec<String> {
    messages
        .iter()
        .filter_map(|m| match m {
            Message::Record { resource: r, record } if r == resource => {
                record.get("id").and_then(JsonValue::as_str).map(String::from)
            }
            _ => None,
        })
        .collect()
}

// ============================================================================
// Message & stats
// ============================================================================

#[test]
fn test_message_serialization() {
    let record = json!({"id": "A", "name": "Orders"});
    let message = Message::record("integrations", record.as_object().unwrap().clone());
    assert!(message.is_record());
    assert!(!message.is_state());
    assert_eq!(message.resource(), Some("integrations"));
    assert_eq!(
        serde_json::to_value(&message).unwrap(),
        json!({"type": "RECORD", "resource": "integrations", "record": record})
    );

    let state = Message::State(BookmarkState::new());
    assert!(state.is_state());
    assert_eq!(state.resource(), None);
    assert_eq!(
        serde_json::to_value(&state).unwrap(),
        json!({"type": "STATE", "bookmarks": {}})
    );

    let failure = Message::ResourceFailed(ResourceFailure {
        resource: "lookups".to_string(),
        kind: ErrorKind::ServerRejected,
        reason: "503".to_string(),
        last_bookmark: None,
        records_emitted: 4,
    });
    let value = serde_json::to_value(&failure).unwrap();
    assert_eq!(value["type"], "RESOURCE_FAILED");
    assert_eq!(value["kind"], "server_rejected");
    assert_eq!(value["records_emitted"], 4);
}

#[test]
fn test_run_stats() {
    let mut stats = RunStats::new();
    stats.add_records(10);
    stats.add_records(5);
    stats.add_completed();
    stats.add_failed();
    stats.add_executor(crate::http::ExecutorStats {
        requests: 7,
        retries: 2,
        reauths: 1,
        timeouts: 0,
    });
    stats.set_duration(1500);

    assert_eq!(stats.records_emitted, 15);
    assert_eq!(stats.resources_completed, 1);
    assert_eq!(stats.resources_failed, 1);
    assert_eq!(stats.requests, 7);
    assert_eq!(stats.retries, 2);
    assert_eq!(stats.reauths, 1);
    assert_eq!(stats.duration_ms, 1500);
}

// ============================================================================
// Runs
// ============================================================================

#[tokio::test]
async fn test_run_extracts_every_resource() {
    let server = MockServer::start().await;
    mount_token(&server).await;
    mount_single_page(&server, INTEGRATIONS, json!([item("I1", 1), item("I2", 3)])).await;
    mount_single_page(&server, CONNECTIONS, json!([item("C1", 2)])).await;

    let extractor = extractor(config(&server, json!({}))).await;
    let (messages, report) = extractor.run_to_vec(CancellationToken::new()).await.unwrap();

    assert!(report.is_success());
    assert_eq!(record_ids(&messages, "integrations"), vec!["I1", "I2"]);
    assert_eq!(record_ids(&messages, "connections"), vec!["C1"]);
    assert_eq!(report.stats.records_emitted, 3);
    assert_eq!(report.stats.token_exchanges, 1);
    assert_eq!(
        report
            .completed
            .iter()
            .map(|s| s.resource.as_str())
            .collect::<Vec<_>>(),
        vec!["integrations", "connections"]
    );

    let last = messages.last().unwrap();
    assert!(last.is_state());
    assert_eq!(
        report.bookmarks.get("integrations").unwrap().high_water_mark,
        HighWaterMark::parse("2024-02-03T00:00:00Z")
    );
    assert_eq!(
        report.summary("connections").unwrap().bookmark.as_ref().unwrap().high_water_mark,
        HighWaterMark::parse("2024-02-02T00:00:00Z")
    );
}

#[tokio::test]
async fn test_failed_resource_leaves_siblings_alone() {
    let server = MockServer::start().await;
    mount_token(&server).await;
    mount_single_page(&server, INTEGRATIONS, json!([item("I1", 1)])).await;
    Mock::given(method("GET"))
        .and(path(CONNECTIONS))
        .respond_with(ResponseTemplate::new(503))
        .mount(&server)
        .await;

    let extractor = extractor(config(&server, json!({}))).await;
    let (messages, report) = extractor.run_to_vec(CancellationToken::new()).await.unwrap();

    assert!(!report.is_success());
    assert!(!report.cancelled);
    assert!(report.summary("integrations").is_some());

    let failure = report.failure("connections").unwrap();
    assert_eq!(failure.kind, ErrorKind::ServerRejected);
    assert_eq!(failure.records_emitted, 0);
    assert!(failure.last_bookmark.is_none());
    assert!(messages
        .iter()
        .any(|m| matches!(m, Message::ResourceFailed(f) if f.resource == "connections")));
    assert!(report.bookmarks.get("connections").is_none());
}

#[tokio::test]
async fn test_invalid_credentials_cancel_the_run() {
    let server = MockServer::start().await;
    Mock::given(method("POST"))
        .and(path(TOKEN_PATH))
        .respond_with(ResponseTemplate::new(401).set_body_string("invalid_client"))
        .mount(&server)
        .await;
    Mock::given(method("GET"))
        .respond_with(ResponseTemplate::new(200).set_body_json(json!({"items": []})))
        .expect(0)
        .mount(&server)
        .await;

    let extractor = extractor(config(
        &server,
        json!({"max_concurrent_resources": 1}),
    ))
    .await;
    let (messages, report) = extractor.run_to_vec(CancellationToken::new()).await.unwrap();

    assert_eq!(record_ids(&messages, "integrations").len(), 0);
    assert_eq!(report.failed.len(), 2);
    assert_eq!(
        report.failure("integrations").unwrap().kind,
        ErrorKind::InvalidCredentials
    );
    assert_eq!(report.failure("connections").unwrap().kind, ErrorKind::Cancelled);
}

#[tokio::test]
async fn test_fail_fast_cancels_pending_resources() {
    let server = MockServer::start().await;
    mount_token(&server).await;
    Mock::given(method("GET"))
        .and(path(INTEGRATIONS))
        .respond_with(ResponseTemplate::new(404))
        .mount(&server)
        .await;
    Mock::given(method("GET"))
        .and(path(CONNECTIONS))
        .respond_with(ResponseTemplate::new(200).set_body_json(json!({"items": []})))
        .expect(0)
        .mount(&server)
        .await;

    let extractor = extractor(config(
        &server,
        json!({"fail_fast": true, "max_concurrent_resources": 1}),
    ))
    .await;
    let (_, report) = extractor.run_to_vec(CancellationToken::new()).await.unwrap();

    assert_eq!(report.failure("integrations").unwrap().kind, ErrorKind::ClientError);
    assert_eq!(report.failure("connections").unwrap().kind, ErrorKind::Cancelled);
    // fail_fast is not an external cancellation
    assert!(!report.cancelled);
}

#[tokio::test]
async fn test_run_budget_cancels_slow_resources() {
    let server = MockServer::start().await;
    mount_token(&server).await;
    Mock::given(method("GET"))
        .respond_with(
            ResponseTemplate::new(200)
                .set_body_json(json!({"items": [], "hasMore": false}))
                .set_delay(Duration::from_secs(10)),
        )
        .mount(&server)
        .await;

    let extractor = extractor(config(
        &server,
        json!({"max_run_seconds": 1, "request_timeout_seconds": 30}),
    ))
    .await;

    let started = std::time::Instant::now();
    let (_, report) = extractor.run_to_vec(CancellationToken::new()).await.unwrap();

    assert!(started.elapsed() < Duration::from_secs(5));
    assert!(report.cancelled);
    assert!(report.failed.iter().all(|f| f.kind == ErrorKind::Cancelled));
}

#[tokio::test]
async fn test_cancelled_before_start() {
    let server = MockServer::start().await;
    mount_token(&server).await;
    Mock::given(method("GET"))
        .respond_with(ResponseTemplate::new(200).set_body_json(json!({"items": []})))
        .expect(0)
        .mount(&server)
        .await;

    let extractor = extractor(config(&server, json!({}))).await;
    let cancel = CancellationToken::new();
    cancel.cancel();

    let (messages, report) = extractor.run_to_vec(cancel).await.unwrap();
    assert!(report.cancelled);
    assert_eq!(report.failed.len(), 2);
    assert!(messages.last().unwrap().is_state());
}

#[tokio::test]
async fn test_resume_from_persisted_bookmark() {
    let server = MockServer::start().await;
    mount_token(&server).await;
    Mock::given(method("GET"))
        .and(path(INTEGRATIONS))
        .and(query_param("q", "lastUpdated >= '2024-02-10T00:00:00Z'"))
        .respond_with(ResponseTemplate::new(200).set_body_json(json!({
            "items": [item("I9", 10), item("I10", 12)],
            "hasMore": false
        })))
        .expect(1)
        .mount(&server)
        .await;

    let mut saved = BookmarkState::new();
    saved.insert(Bookmark::new(
        "integrations",
        HighWaterMark::parse("2024-02-10T00:00:00Z"),
    ));
    let store = Arc::new(MemoryStateStore::with_state(saved));

    let extractor = Extractor::new(
        config(&server, json!({"resources": ["integrations"]})),
        store.clone(),
    )
    .await
    .unwrap();
    let (messages, report) = extractor.run_to_vec(CancellationToken::new()).await.unwrap();

    assert!(report.is_success());
    assert_eq!(record_ids(&messages, "integrations"), vec!["I9", "I10"]);
    assert_eq!(
        store.current().await.get("integrations").unwrap().high_water_mark,
        HighWaterMark::parse("2024-02-12T00:00:00Z")
    );
}

fn kind(message: &Message) -> &'static str {
    match message {
        Message::Record { .. } => "RECORD",
        Message::State(_) => "STATE",
        Message::ResourceCompleted(_) => "RESOURCE_COMPLETED",
        Message::ResourceFailed(_) => "RESOURCE_FAILED",
    }
}

#[tokio::test]
async fn test_state_follows_the_records_it_covers() {
    let server = MockServer::start().await;
    mount_token(&server).await;
    Mock::given(method("GET"))
        .and(path(INTEGRATIONS))
        .and(query_param("offset", "0"))
        .respond_with(ResponseTemplate::new(200).set_body_json(json!({
            "items": [item("I1", 1), item("I2", 2)],
            "hasMore": true
        })))
        .mount(&server)
        .await;
    Mock::given(method("GET"))
        .and(path(INTEGRATIONS))
        .and(query_param("offset", "2"))
        .respond_with(ResponseTemplate::new(200).set_body_json(json!({
            "items": [item("I3", 3)],
            "hasMore": false
        })))
        .mount(&server)
        .await;

    let store = Arc::new(MemoryStateStore::new());
    let extractor = Extractor::new(
        config(&server, json!({"resources": ["integrations"]})),
        store.clone(),
    )
    .await
    .unwrap();

    let (sender, mut receiver) = mpsc::channel(DEFAULT_CHANNEL_CAPACITY);
    let report = extractor.run(sender, CancellationToken::new()).await.unwrap();
    assert!(report.is_success());

    // Every message is still queued, so nothing has been written
    assert!(store.current().await.is_empty());

    let mut kinds = Vec::new();
    while let Some(message) = receiver.recv().await {
        kinds.push(kind(&message));
        if let Message::State(state) = &message {
            extractor.commit(state).await.unwrap();
            if kinds.len() == 3 {
                assert_eq!(
                    store.current().await.get("integrations").unwrap().high_water_mark,
                    HighWaterMark::parse("2024-02-02T00:00:00Z")
                );
            }
        }
    }

    assert_eq!(
        kinds,
        vec!["RECORD", "RECORD", "STATE", "RECORD", "STATE", "RESOURCE_COMPLETED", "STATE"]
    );
    assert_eq!(
        store.current().await.get("integrations").unwrap().high_water_mark,
        HighWaterMark::parse("2024-02-03T00:00:00Z")
    );
}

#[tokio::test]
async fn test_closed_output_stops_the_run() {
    let server = MockServer::start().await;
    mount_token(&server).await;
    mount_single_page(&server, INTEGRATIONS, json!([item("I1", 1), item("I2", 2)])).await;
    mount_single_page(&server, CONNECTIONS, json!([item("C1", 1)])).await;

    let extractor = extractor(config(&server, json!({"max_concurrent_resources": 1}))).await;
    let (sender, receiver) = mpsc::channel(1);
    drop(receiver);

    let report = extractor.run(sender, CancellationToken::new()).await.unwrap();
    assert_eq!(report.stats.records_emitted, 0);
    assert!(report.failed.iter().all(|f| f.kind == ErrorKind::Cancelled));
}

// ============================================================================
// Check
// ============================================================================

#[tokio::test]
async fn test_check_reads_one_record() {
    let server = MockServer::start().await;
    mount_token(&server).await;
    Mock::given(method("GET"))
        .and(path(INTEGRATIONS))
        .and(query_param("limit", "1"))
        .respond_with(ResponseTemplate::new(200).set_body_json(json!({
            "items": [item("I1", 1)],
            "hasMore": true,
            "totalResults": 42
        })))
        .expect(1)
        .mount(&server)
        .await;

    let extractor = extractor(config(&server, json!({}))).await;
    let status = extractor.check(&CancellationToken::new()).await.unwrap();

    assert_eq!(status.checked_resource, "integrations");
    assert_eq!(status.total_results, Some(42));
    assert!(status.token_expires_at > chrono::Utc::now());
}

#[tokio::test]
async fn test_check_reports_rejected_credentials() {
    let server = MockServer::start().await;
    Mock::given(method("POST"))
        .and(path(TOKEN_PATH))
        .respond_with(ResponseTemplate::new(401))
        .mount(&server)
        .await;

    let extractor = extractor(config(&server, json!({}))).await;
    let err = extractor.check(&CancellationToken::new()).await.unwrap_err();
    assert!(matches!(err, Error::Auth(_)));
}
