//! Model provider abstractions.
//!
//! This module defines the seam between the relay and the hosted language
//! model. The relay only ever talks to an [`LlmDriver`]; the production
//! implementation is [`GeminiDriver`], and tests substitute scripted drivers.
//!
//! # Overview
//!
//! A driver receives an [`LlmRequest`] carrying the full conversation (prior
//! turns plus the new user turn) and returns a lazy stream of [`ModelChunk`]s.
//! Errors may surface when the call is opened or at any point while the
//! stream is being consumed.
//!
//! # Example
//!
//! ```rust,ignore
//! use tars_relay::llm::{GeminiDriver, LlmDriver, LlmRequest, LlmSettings, Message};
//!
//! let driver = GeminiDriver::new(LlmSettings::new("my-key"));
//! let chunks = driver
//!     .stream(LlmRequest { messages: vec![Message::user("Hola")] })
//!     .await?;
//! ```

pub mod gemini;

pub use gemini::GeminiDriver;

use std::pin::Pin;

use futures::Stream;
use serde::{Deserialize, Serialize};

/// Model used when `GENAI_MODEL` is not set.
pub const DEFAULT_MODEL: &str = "gemini-1.5-flash";

/// Public Gemini API endpoint.
pub const DEFAULT_BASE_URL: &str = "https://generativelanguage.googleapis.com";

/// Persona sent as the system instruction on every call.
pub const DEFAULT_SYSTEM_INSTRUCTION: &str = "Eres TARS, un asistente conversacional en tiempo real. \
Respondes breve, claro y útil, en español por defecto. \
Si no estás seguro, pregunta y propone opciones.";

/// Model connection settings.
#[derive(Clone)]
pub struct LlmSettings {
    /// API key sent with every request.
    pub api_key: String,
    /// Model identifier (e.g., `gemini-1.5-flash`).
    pub model: String,
    /// Base URL of the model API.
    pub base_url: String,
    /// Optional system instruction prepended to every conversation.
    pub system_instruction: Option<String>,
}

impl LlmSettings {
    /// Settings for the public endpoint with the default model and persona.
    #[must_use]
    pub fn new(api_key: impl Into<String>) -> Self {
        Self {
            api_key: api_key.into(),
            model: DEFAULT_MODEL.to_string(),
            base_url: DEFAULT_BASE_URL.to_string(),
            system_instruction: Some(DEFAULT_SYSTEM_INSTRUCTION.to_string()),
        }
    }
}

impl std::fmt::Debug for LlmSettings {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("LlmSettings")
            .field("api_key", &"<redacted>")
            .field("model", &self.model)
            .field("base_url", &self.base_url)
            .field("system_instruction", &self.system_instruction)
            .finish()
    }
}

/// Role of a conversation turn, in the provider's vocabulary.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum MessageRole {
    /// Turn written by the end user.
    User,
    /// Turn generated by the model.
    Model,
}

/// One turn of a conversation.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Message {
    /// Author of the turn.
    pub role: MessageRole,
    /// Plain-text content.
    pub content: String,
}

impl Message {
    /// Create a user turn.
    #[must_use]
    pub fn user(content: impl Into<String>) -> Self {
        Self {
            role: MessageRole::User,
            content: content.into(),
        }
    }

    /// Create a model turn.
    #[must_use]
    pub fn model(content: impl Into<String>) -> Self {
        Self {
            role: MessageRole::Model,
            content: content.into(),
        }
    }
}

/// Request to an LLM driver.
#[derive(Debug, Clone, Default)]
pub struct LlmRequest {
    /// Conversation so far, ending with the new user turn.
    pub messages: Vec<Message>,
}

/// One incremental piece of upstream output.
///
/// `text` is absent for chunks that only carry metadata (finish reasons,
/// usage counters).
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ModelChunk {
    /// Generated text, if this chunk carried any.
    pub text: Option<String>,
}

impl ModelChunk {
    /// A chunk carrying text.
    #[must_use]
    pub fn text(text: impl Into<String>) -> Self {
        Self {
            text: Some(text.into()),
        }
    }
}

/// Stream of upstream chunks returned by [`LlmDriver::stream`].
pub type ChunkStream = Pin<Box<dyn Stream<Item = anyhow::Result<ModelChunk>> + Send>>;

/// Trait for streaming model clients.
///
/// Implementations open one upstream call per invocation. The returned stream
/// is finite and not restartable.
#[async_trait::async_trait]
pub trait LlmDriver: Send + Sync {
    /// Stream a reply for the given conversation.
    ///
    /// # Errors
    ///
    /// Returns an error if the call cannot be opened. Failures after the
    /// stream is open are yielded as `Err` items.
    async fn stream(&self, req: LlmRequest) -> anyhow::Result<ChunkStream>;
}
