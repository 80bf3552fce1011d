//! TARS relay
//!
//! A small HTTP service that relays browser chat messages to Google Gemini,
//! streams the generated text back as it arrives, and keeps each session's
//! conversation history in process memory.
//!
//! # Architecture
//!
//! - **Server**: Axum router serving the client shell, `GET /session`, and the
//!   streaming `POST /chat/stream` endpoint
//! - **Relay**: validates requests, resolves sessions, and turns upstream
//!   output into an ordered stream of text fragments
//! - **Sessions**: injectable in-memory registry of conversation handles
//! - **LLM**: driver trait plus the Gemini `streamGenerateContent` client
//!
//! # Modules
//!
//! - [`config`]: CLI, layered server configuration, and model settings
//! - [`error`]: typed client and startup errors
//! - [`llm`]: model driver trait and the Gemini implementation
//! - [`relay`]: the streaming chat relay
//! - [`server`]: router, handlers, and server startup
//! - [`session`]: conversation handles and the session registry

// Axum handlers are async even when they never await
#![allow(clippy::unused_async)]

pub mod config;
pub mod error;
pub mod llm;
pub mod relay;
pub mod server;
pub mod session;

use crate::config::AppConfig;

use relay::ChatRelay;
use std::sync::Arc;

/// Application state shared across all handlers.
#[derive(Clone, Debug)]
pub struct AppState {
    /// Streaming relay (owns the session registry and model driver).
    pub relay: ChatRelay,
    /// Global Configuration
    pub config: Arc<AppConfig>,
}
