//! Session-scoped streaming chat relay.
//!
//! One exchange moves through `Validating -> {Rejected, Resolving} ->
//! Streaming -> {Completed, Failed}`:
//!
//! 1. [`ChatStreamRequest::validate`] trims the message and rejects empty
//!    input without touching the session registry.
//! 2. [`ChatRelay::open`] resolves or creates the session and returns an
//!    [`Exchange`] whose session id is known before any upstream traffic.
//! 3. The exchange's fragment stream carries text in arrival order and, on
//!    upstream failure, one trailing [`Fragment::Error`].
//!
//! Headers are committed before the first fragment, so a failed exchange is
//! still a 200 response; clients detect failure from the `\n[error] ` marker
//! in the body.

use std::pin::Pin;
use std::sync::Arc;

use axum::http::HeaderValue;
use futures::Stream;
use serde::{Deserialize, Serialize};

use crate::error::RelayError;
use crate::llm::LlmDriver;
use crate::session::SessionRegistry;

/// Prefix written before the details of an in-band upstream failure.
pub const ERROR_MARKER: &str = "\n[error] ";

/// One item of a relayed reply.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Fragment {
    /// Generated text, forwarded as received.
    Text(String),
    /// Terminal upstream failure; always the last item.
    Error(String),
}

impl Fragment {
    /// Terminal fragment for an upstream error.
    #[must_use]
    pub fn from_error(err: &anyhow::Error) -> Self {
        Self::Error(format!("{err:#}"))
    }

    /// Bytes written to the response body for this fragment.
    #[must_use]
    pub fn into_body_text(self) -> String {
        match self {
            Self::Text(text) => text,
            Self::Error(details) => format!("{ERROR_MARKER}{details}"),
        }
    }
}

/// Lazy, finite stream of fragments for one exchange.
pub type FragmentStream = Pin<Box<dyn Stream<Item = Fragment> + Send>>;

/// Body of `POST /chat/stream`.
#[derive(Debug, Clone, Default, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ChatStreamRequest {
    /// User message; required and non-blank.
    #[serde(default)]
    pub message: Option<String>,
    /// Session token from a previous turn, if any.
    #[serde(default)]
    pub session_id: Option<String>,
}

/// A request that passed boundary validation.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ValidatedChat {
    /// Trimmed, non-empty message.
    pub message: String,
    /// Non-empty session token, if supplied.
    pub session_id: Option<String>,
}

impl ChatStreamRequest {
    /// Check the request without side effects.
    pub fn validate(self) -> Result<ValidatedChat, RelayError> {
        let message = self
            .message
            .as_deref()
            .map(str::trim)
            .filter(|m| !m.is_empty())
            .ok_or(RelayError::MessageRequired)?
            .to_string();

        let session_id = self.session_id.filter(|id| !id.is_empty());
        if let Some(id) = &session_id
            && HeaderValue::from_str(id).is_err()
        {
            return Err(RelayError::InvalidSessionId);
        }

        Ok(ValidatedChat {
            message,
            session_id,
        })
    }
}

/// Body of `GET /session`.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct SessionCreated {
    pub session_id: String,
}

/// An accepted exchange, ready to stream.
pub struct Exchange {
    /// Resolved session token, echoed in the `x-session-id` header.
    pub session_id: String,
    /// Reply fragments; nothing is sent upstream until this is polled.
    pub fragments: FragmentStream,
}

impl std::fmt::Debug for Exchange {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Exchange")
            .field("session_id", &self.session_id)
            .finish_non_exhaustive()
    }
}

/// Relays chat messages to the model on behalf of sessions.
#[derive(Clone)]
pub struct ChatRelay {
    sessions: Arc<dyn SessionRegistry>,
    driver: Arc<dyn LlmDriver>,
}

impl std::fmt::Debug for ChatRelay {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ChatRelay")
            .field("sessions", &self.sessions)
            .finish_non_exhaustive()
    }
}

impl ChatRelay {
    /// Create a relay over the given registry and model driver.
    #[must_use]
    pub fn new(sessions: Arc<dyn SessionRegistry>, driver: Arc<dyn LlmDriver>) -> Self {
        Self { sessions, driver }
    }

    /// Create a session with a fresh token.
    pub fn create_session(&self) -> SessionCreated {
        let conversation = self.sessions.create_session();
        SessionCreated {
            session_id: conversation.id().to_string(),
        }
    }

    /// Validate a request and start an exchange.
    ///
    /// Rejected requests leave the registry unchanged.
    pub fn open(&self, request: ChatStreamRequest) -> Result<Exchange, RelayError> {
        let chat = request.validate()?;

        let conversation = self.sessions.resolve_or_create(chat.session_id.as_deref());
        let session_id = conversation.id().to_string();
        let idle = chrono::Utc::now() - conversation.last_activity();

        tracing::info!(
            name: "relay.exchange.started",
            session_id = %session_id,
            message_length = chat.message.len(),
            history_length = conversation.message_count(),
            idle_ms = idle.num_milliseconds(),
            "Relaying chat message"
        );
        tracing::trace!(session_id = %session_id, message = %chat.message, "Chat message");

        let fragments = conversation.send_message(Arc::clone(&self.driver), chat.message);

        Ok(Exchange {
            session_id,
            fragments,
        })
    }
}
