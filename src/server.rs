use std::convert::Infallible;
use std::path::PathBuf;
use std::sync::Arc;

use axum::{
    Json, Router,
    body::{Body, Bytes},
    extract::{DefaultBodyLimit, State, rejection::BytesRejection},
    http::{HeaderName, HeaderValue, header},
    response::{IntoResponse, Response},
    routing::{get, get_service, post},
};
use futures::StreamExt;
use tower_http::cors::{Any, CorsLayer};
use tower_http::services::{ServeDir, ServeFile};
use tower_http::trace::TraceLayer;
use tracing::{info, warn};

use crate::AppState;
use crate::config::AppConfig;
use crate::error::RelayError;
use crate::llm::{GeminiDriver, LlmDriver, LlmSettings};
use crate::relay::{ChatRelay, ChatStreamRequest, SessionCreated};
use crate::session::{SessionRegistry, SessionStore};

/// Response header carrying the resolved session token.
pub const SESSION_ID_HEADER: HeaderName = HeaderName::from_static("x-session-id");

/// Content type of the relayed reply.
const STREAM_CONTENT_TYPE: &str = "text/plain; charset=utf-8";

/// Start the Axum server with the provided configuration.
pub async fn start_server(config: Arc<AppConfig>, settings: LlmSettings) -> anyhow::Result<()> {
    info!(
        name: "llm.config.loaded",
        base_url = %settings.base_url,
        model = %settings.model,
        "LLM configuration loaded"
    );

    let driver: Arc<dyn LlmDriver> = Arc::new(GeminiDriver::new(settings));
    let sessions: Arc<dyn SessionRegistry> = Arc::new(SessionStore::new());
    let state = AppState {
        relay: ChatRelay::new(sessions, driver),
        config: Arc::clone(&config),
    };

    let index = PathBuf::from(&config.server.static_dir).join("index.html");
    if !index.is_file() {
        warn!(path = %index.display(), "Index document not found; GET / will return 404");
    }

    let app = build_router(state);

    let addr = config.server.address();
    let listener = tokio::net::TcpListener::bind(&addr).await?;

    info!(
        name: "server.started",
        address = %addr,
        static_dir = %config.server.static_dir,
        "Server started"
    );

    axum::serve(listener, app.into_make_service()).await?;
    Ok(())
}

/// Build the application router.
///
/// - `GET /` serves the index document
/// - `GET /session` creates a session
/// - `POST /chat/stream` relays a message and streams the reply
/// - anything else is looked up in the static directory, falling back to the
///   index document
pub fn build_router(state: AppState) -> Router {
    let static_dir = PathBuf::from(&state.config.server.static_dir);
    let index = static_dir.join("index.html");
    let body_limit = state.config.server.body_limit_bytes;

    let assets = ServeDir::new(&static_dir).fallback(ServeFile::new(&index));

    let cors = CorsLayer::new()
        .allow_origin(Any)
        .allow_methods(Any)
        .allow_headers(Any)
        .expose_headers([SESSION_ID_HEADER]);

    Router::new()
        .route("/", get_service(ServeFile::new(&index)))
        .route("/session", get(new_session))
        .route("/chat/stream", post(chat_stream))
        .fallback_service(assets)
        .layer(DefaultBodyLimit::max(body_limit))
        .layer(cors)
        .layer(TraceLayer::new_for_http())
        .with_state(state)
}

// ─────────────────────────────────────────────────────────────────────────────
// API Handlers
// ─────────────────────────────────────────────────────────────────────────────

/// GET /session - Create a session and return its token.
async fn new_session(State(state): State<AppState>) -> Json<SessionCreated> {
    Json(state.relay.create_session())
}

/// POST /chat/stream - Relay a message and stream the reply as plain text.
///
/// Status and headers (including `x-session-id`) are sent before the first
/// fragment. An upstream failure after that point is appended to the body as
/// `\n[error] <details>` and the status stays 200.
async fn chat_stream(
    State(state): State<AppState>,
    body: Result<Bytes, BytesRejection>,
) -> Result<Response, RelayError> {
    let request: ChatStreamRequest = serde_json::from_slice(&body?)?;
    let exchange = state.relay.open(request)?;

    let Ok(session_id) = HeaderValue::from_str(&exchange.session_id) else {
        return Err(RelayError::InvalidSessionId);
    };

    let body = Body::from_stream(
        exchange
            .fragments
            .map(|fragment| Ok::<_, Infallible>(fragment.into_body_text())),
    );

    Ok((
        [
            (
                header::CONTENT_TYPE,
                HeaderValue::from_static(STREAM_CONTENT_TYPE),
            ),
            (SESSION_ID_HEADER, session_id),
        ],
        body,
    )
        .into_response())
}
