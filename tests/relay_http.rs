use std::fs;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use axum::Router;
use axum::http::{HeaderName, HeaderValue, StatusCode};
use axum_test::TestServer;
use futures::{StreamExt, stream};
use serde_json::{Value, json};
use tempfile::TempDir;

use tars_relay::AppState;
use tars_relay::config::{AppConfig, ServerConfig};
use tars_relay::llm::{ChunkStream, LlmDriver, LlmRequest, ModelChunk};
use tars_relay::relay::ChatRelay;
use tars_relay::server::build_router;
use tars_relay::session::{SessionRegistry, SessionStore};

// ─────────────────────────────────────────────────────────────────────────────
// Stub drivers
// ─────────────────────────────────────────────────────────────────────────────

/// Replays a fixed script; `Err` entries become upstream errors.
struct Scripted(Vec<Result<&'static str, &'static str>>);

#[async_trait::async_trait]
impl LlmDriver for Scripted {
    async fn stream(&self, _req: LlmRequest) -> anyhow::Result<ChunkStream> {
        let items: Vec<anyhow::Result<ModelChunk>> = self
            .0
            .iter()
            .map(|item| match item {
                Ok(text) => Ok(ModelChunk::text(*text)),
                Err(msg) => Err(anyhow::anyhow!(*msg)),
            })
            .collect();
        Ok(Box::pin(stream::iter(items)))
    }
}

/// Echoes how many turns of history it received and records every request.
#[derive(Default)]
struct HistoryEcho {
    requests: Mutex<Vec<LlmRequest>>,
}

#[async_trait::async_trait]
impl LlmDriver for HistoryEcho {
    async fn stream(&self, req: LlmRequest) -> anyhow::Result<ChunkStream> {
        let reply = format!("history={}", req.messages.len());
        self.requests.lock().unwrap().push(req);
        Ok(Box::pin(stream::iter(vec![Ok(ModelChunk::text(reply))])))
    }
}

/// Fails to open the first call, then behaves like [`HistoryEcho`].
#[derive(Default)]
struct FailsOnce {
    calls: AtomicUsize,
}

#[async_trait::async_trait]
impl LlmDriver for FailsOnce {
    async fn stream(&self, req: LlmRequest) -> anyhow::Result<ChunkStream> {
        if self.calls.fetch_add(1, Ordering::SeqCst) == 0 {
            anyhow::bail!("quota exceeded");
        }
        let reply = format!("history={}", req.messages.len());
        Ok(Box::pin(stream::iter(vec![Ok(ModelChunk::text(reply))])))
    }
}

/// Sends one chunk, then never finishes.
struct FirstThenHang;

#[async_trait::async_trait]
impl LlmDriver for FirstThenHang {
    async fn stream(&self, _req: LlmRequest) -> anyhow::Result<ChunkStream> {
        let first = stream::iter(vec![Ok(ModelChunk::text("first"))]);
        Ok(Box::pin(first.chain(stream::pending())))
    }
}

// ─────────────────────────────────────────────────────────────────────────────
// Harness
// ─────────────────────────────────────────────────────────────────────────────

struct Harness {
    server: TestServer,
    store: SessionStore,
    _static_dir: TempDir,
}

fn app(driver: Arc<dyn LlmDriver>) -> (Router, SessionStore, TempDir) {
    let static_dir = tempfile::tempdir().unwrap();
    fs::write(
        static_dir.path().join("index.html"),
        "<!DOCTYPE html><title>TARS</title>",
    )
    .unwrap();
    fs::create_dir(static_dir.path().join("js")).unwrap();
    fs::write(static_dir.path().join("js/main.js"), "console.log('tars');").unwrap();

    let store = SessionStore::new();
    let sessions: Arc<dyn SessionRegistry> = Arc::new(store.clone());
    let config = AppConfig {
        server: ServerConfig {
            static_dir: static_dir.path().to_string_lossy().into_owned(),
            ..ServerConfig::default()
        },
    };
    let state = AppState {
        relay: ChatRelay::new(sessions, driver),
        config: Arc::new(config),
    };

    (build_router(state), store, static_dir)
}

fn harness(driver: Arc<dyn LlmDriver>) -> Harness {
    let (router, store, static_dir) = app(driver);
    Harness {
        server: TestServer::new(router).unwrap(),
        store,
        _static_dir: static_dir,
    }
}

fn session_header(response: &axum_test::TestResponse) -> String {
    response
        .header("x-session-id")
        .to_str()
        .unwrap()
        .to_string()
}

// ─────────────────────────────────────────────────────────────────────────────
// Sessions
// ─────────────────────────────────────────────────────────────────────────────

#[tokio::test]
async fn test_get_session_returns_distinct_usable_tokens() {
    let h = harness(Arc::new(HistoryEcho::default()));

    let first: Value = h.server.get("/session").await.json();
    let second: Value = h.server.get("/session").await.json();
    let first = first["sessionId"].as_str().unwrap().to_string();
    let second = second["sessionId"].as_str().unwrap().to_string();

    assert_ne!(first, second);
    assert_eq!(h.store.len(), 2);

    for id in [&first, &second] {
        let response = h
            .server
            .post("/chat/stream")
            .json(&json!({ "message": "hola", "sessionId": id }))
            .await;
        assert_eq!(response.status_code(), StatusCode::OK);
        assert_eq!(&session_header(&response), id);
        assert_eq!(response.text(), "history=1");
    }
    assert_eq!(h.store.len(), 2);
}

#[tokio::test]
async fn test_chat_without_session_issues_new_token() {
    let h = harness(Arc::new(HistoryEcho::default()));

    let response = h
        .server
        .post("/chat/stream")
        .json(&json!({ "message": "hola", "sessionId": null }))
        .await;
    let token = session_header(&response);
    assert!(uuid::Uuid::parse_str(&token).is_ok());

    let again = h
        .server
        .post("/chat/stream")
        .json(&json!({ "message": "otra vez", "sessionId": token }))
        .await;
    assert_eq!(session_header(&again), token);
    assert_eq!(again.text(), "history=3");
    assert_eq!(h.store.len(), 1);
}

#[tokio::test]
async fn test_unknown_session_id_is_adopted() {
    let h = harness(Arc::new(HistoryEcho::default()));

    let response = h
        .server
        .post("/chat/stream")
        .json(&json!({ "message": "hola", "sessionId": "my-own-id" }))
        .await;

    assert_eq!(session_header(&response), "my-own-id");
    assert!(h.store.get("my-own-id").is_some());
}

// ─────────────────────────────────────────────────────────────────────────────
// Validation
// ─────────────────────────────────────────────────────────────────────────────

#[tokio::test]
async fn test_blank_message_is_rejected_without_touching_registry() {
    let h = harness(Arc::new(HistoryEcho::default()));

    for body in [
        json!({ "message": "", "sessionId": null }),
        json!({ "message": "   \n\t", "sessionId": "abc" }),
        json!({ "sessionId": "abc" }),
        json!({ "message": null }),
    ] {
        let response = h.server.post("/chat/stream").json(&body).await;

        assert_eq!(response.status_code(), StatusCode::BAD_REQUEST);
        assert_eq!(
            response.json::<Value>(),
            json!({ "error": "message is required" })
        );
        assert!(response.maybe_header("x-session-id").is_none());
    }

    assert!(h.store.is_empty());
}

#[tokio::test]
async fn test_malformed_body_is_rejected() {
    let h = harness(Arc::new(HistoryEcho::default()));

    let response = h.server.post("/chat/stream").text("not json").await;

    assert_eq!(response.status_code(), StatusCode::BAD_REQUEST);
    let body: Value = response.json();
    assert!(
        body["error"]
            .as_str()
            .unwrap()
            .starts_with("invalid request body")
    );
    assert!(h.store.is_empty());
}

#[tokio::test]
async fn test_oversized_body_is_rejected_as_json() {
    let h = harness(Arc::new(HistoryEcho::default()));
    let oversized = format!(
        r#"{{"message":"{}"}}"#,
        "a".repeat(ServerConfig::default().body_limit_bytes)
    );

    let response = h.server.post("/chat/stream").text(oversized).await;

    assert_eq!(response.status_code(), StatusCode::PAYLOAD_TOO_LARGE);
    assert_eq!(
        response.json::<Value>(),
        json!({ "error": "request body too large" })
    );
    assert!(h.store.is_empty());
}

// ─────────────────────────────────────────────────────────────────────────────
// Streaming
// ─────────────────────────────────────────────────────────────────────────────

#[tokio::test]
async fn test_fragments_are_relayed_in_order() {
    let h = harness(Arc::new(Scripted(vec![Ok("Hola"), Ok(" "), Ok("mundo")])));

    let response = h
        .server
        .post("/chat/stream")
        .json(&json!({ "message": "saluda" }))
        .await;

    assert_eq!(response.status_code(), StatusCode::OK);
    assert_eq!(
        response.header("content-type"),
        HeaderValue::from_static("text/plain; charset=utf-8")
    );
    assert_eq!(response.text(), "Hola mundo");
}

#[tokio::test]
async fn test_midstream_failure_is_reported_in_band() {
    let h = harness(Arc::new(Scripted(vec![Ok("partial"), Err("boom")])));

    let response = h
        .server
        .post("/chat/stream")
        .json(&json!({ "message": "hola" }))
        .await;

    assert_eq!(response.status_code(), StatusCode::OK);
    assert_eq!(response.text(), "partial\n[error] boom");

    let token = session_header(&response);
    assert_eq!(h.store.get(&token).unwrap().message_count(), 0);
}

#[tokio::test]
async fn test_session_survives_failed_exchange() {
    let h = harness(Arc::new(FailsOnce::default()));

    let failed = h
        .server
        .post("/chat/stream")
        .json(&json!({ "message": "hola" }))
        .await;
    assert_eq!(failed.status_code(), StatusCode::OK);
    assert_eq!(failed.text(), "\n[error] quota exceeded");
    let token = session_header(&failed);

    let retried = h
        .server
        .post("/chat/stream")
        .json(&json!({ "message": "hola", "sessionId": token }))
        .await;
    assert_eq!(retried.text(), "history=1");
}

#[tokio::test]
async fn test_first_fragment_arrives_before_upstream_finishes() {
    let (router, store, _static_dir) = app(Arc::new(FirstThenHang));
    let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    tokio::spawn(async move {
        axum::serve(listener, router).await.unwrap();
    });

    let request = reqwest::Client::new()
        .post(format!("http://{addr}/chat/stream"))
        .json(&json!({ "message": "hola" }))
        .send();
    let mut response = tokio::time::timeout(Duration::from_secs(5), request)
        .await
        .expect("headers were not sent while upstream was still open")
        .unwrap();

    assert_eq!(response.status(), reqwest::StatusCode::OK);
    let token = response
        .headers()
        .get("x-session-id")
        .expect("x-session-id missing from the committed headers")
        .to_str()
        .unwrap()
        .to_string();
    assert!(store.get(&token).is_some());

    let first = tokio::time::timeout(Duration::from_secs(5), response.chunk())
        .await
        .expect("first fragment was held back until upstream finished")
        .unwrap();
    assert_eq!(first.as_deref(), Some(&b"first"[..]));

    // still mid-exchange, so nothing is committed yet
    assert_eq!(store.get(&token).unwrap().message_count(), 0);
}

#[tokio::test]
async fn test_model_input_carries_trimmed_text_and_history() {
    let driver = Arc::new(HistoryEcho::default());
    let h = harness(Arc::clone(&driver) as Arc<dyn LlmDriver>);

    let first = h
        .server
        .post("/chat/stream")
        .json(&json!({ "message": "  me llamo Ana  " }))
        .await;
    let token = session_header(&first);
    h.server
        .post("/chat/stream")
        .json(&json!({ "message": "¿cómo me llamo?", "sessionId": token }))
        .await;

    let requests = driver.requests.lock().unwrap();
    assert_eq!(requests.len(), 2);
    assert_eq!(requests[0].messages.len(), 1);
    assert_eq!(requests[0].messages[0].content, "me llamo Ana");

    let second: Vec<&str> = requests[1]
        .messages
        .iter()
        .map(|m| m.content.as_str())
        .collect();
    assert_eq!(second, vec!["me llamo Ana", "history=1", "¿cómo me llamo?"]);
}

// ─────────────────────────────────────────────────────────────────────────────
// Static assets and CORS
// ─────────────────────────────────────────────────────────────────────────────

#[tokio::test]
async fn test_index_and_static_assets() {
    let h = harness(Arc::new(HistoryEcho::default()));

    let index = h.server.get("/").await;
    assert_eq!(index.status_code(), StatusCode::OK);
    assert!(
        index
            .header("content-type")
            .to_str()
            .unwrap()
            .starts_with("text/html")
    );
    assert!(index.text().contains("<title>TARS</title>"));

    let script = h.server.get("/js/main.js").await;
    assert_eq!(script.status_code(), StatusCode::OK);
    assert_eq!(script.text(), "console.log('tars');");

    let unknown = h.server.get("/some/client/route").await;
    assert_eq!(unknown.status_code(), StatusCode::OK);
    assert!(unknown.text().contains("<title>TARS</title>"));
}

#[tokio::test]
async fn test_cors_exposes_session_header() {
    let h = harness(Arc::new(HistoryEcho::default()));

    let response = h
        .server
        .post("/chat/stream")
        .add_header(
            HeaderName::from_static("origin"),
            HeaderValue::from_static("http://localhost:5173"),
        )
        .json(&json!({ "message": "hola" }))
        .await;

    assert_eq!(
        response.header("access-control-allow-origin"),
        HeaderValue::from_static("*")
    );
    assert!(
        response
            .header("access-control-expose-headers")
            .to_str()
            .unwrap()
            .contains("x-session-id")
    );
}
