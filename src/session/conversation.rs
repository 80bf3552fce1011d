//! Conversation handle: the per-session turn history.

use std::sync::{Arc, PoisonError, RwLock};

use chrono::{DateTime, Utc};
use futures::StreamExt;

use crate::llm::{LlmDriver, LlmRequest, Message, ModelChunk};
use crate::relay::{Fragment, FragmentStream};

/// Running dialogue context for one session.
///
/// Cloning is cheap and yields another handle to the same history. History
/// grows by one user turn and one model turn per completed exchange; a failed
/// exchange leaves it untouched.
#[derive(Debug)]
pub struct Conversation {
    inner: Arc<ConversationInner>,
}

#[derive(Debug)]
struct ConversationInner {
    /// Session token.
    id: String,
    /// Completed turns, oldest first.
    messages: RwLock<Vec<Message>>,
    /// Creation time.
    created_at: DateTime<Utc>,
    /// Last completed exchange.
    last_activity: RwLock<DateTime<Utc>>,
}

impl Clone for Conversation {
    fn clone(&self) -> Self {
        Self {
            inner: Arc::clone(&self.inner),
        }
    }
}

impl Conversation {
    /// Create an empty conversation under the given token.
    pub(crate) fn new(id: String) -> Self {
        let now = Utc::now();
        Self {
            inner: Arc::new(ConversationInner {
                id,
                messages: RwLock::new(Vec::new()),
                created_at: now,
                last_activity: RwLock::new(now),
            }),
        }
    }

    /// Get the session token.
    #[must_use]
    pub fn id(&self) -> &str {
        &self.inner.id
    }

    /// Snapshot of the completed turns.
    #[must_use]
    pub fn history(&self) -> Vec<Message> {
        self.inner
            .messages
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
    }

    /// Number of completed turns.
    #[must_use]
    pub fn message_count(&self) -> usize {
        self.inner
            .messages
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .len()
    }

    /// Creation time.
    #[must_use]
    pub fn created_at(&self) -> DateTime<Utc> {
        self.inner.created_at
    }

    /// Time of the last completed exchange, or creation if there is none.
    #[must_use]
    pub fn last_activity(&self) -> DateTime<Utc> {
        *self
            .inner
            .last_activity
            .read()
            .unwrap_or_else(PoisonError::into_inner)
    }

    /// Fold a finished exchange into the history.
    fn append_exchange(&self, user: Message, reply: Message) {
        let mut guard = self
            .inner
            .messages
            .write()
            .unwrap_or_else(PoisonError::into_inner);
        guard.push(user);
        guard.push(reply);
        drop(guard);

        *self
            .inner
            .last_activity
            .write()
            .unwrap_or_else(PoisonError::into_inner) = Utc::now();
    }

    /// Send a user turn and stream the model's reply.
    ///
    /// The returned stream is lazy: nothing is sent upstream until it is
    /// polled. It yields one [`Fragment::Text`] per non-empty upstream chunk,
    /// in arrival order. If the upstream call fails at any point it yields a
    /// single [`Fragment::Error`] and ends. The exchange is committed to the
    /// history only once the upstream stream has completed normally.
    pub fn send_message(&self, driver: Arc<dyn LlmDriver>, text: String) -> FragmentStream {
        let conversation = self.clone();

        let stream = async_stream::stream! {
            let user_turn = Message::user(text);
            let mut messages = conversation.history();
            messages.push(user_turn.clone());

            let mut upstream = match driver.stream(LlmRequest { messages }).await {
                Ok(s) => s,
                Err(e) => {
                    tracing::warn!(
                        name: "relay.exchange.failed",
                        session_id = %conversation.id(),
                        error = %e,
                        "Upstream call could not be opened"
                    );
                    yield Fragment::from_error(&e);
                    return;
                }
            };

            let mut reply = String::new();
            let mut fragments = 0usize;
            while let Some(chunk) = upstream.next().await {
                match chunk {
                    Ok(ModelChunk { text: Some(text) }) if !text.is_empty() => {
                        reply.push_str(&text);
                        fragments += 1;
                        tracing::trace!(session_id = %conversation.id(), delta_length = text.len(), "Fragment");
                        yield Fragment::Text(text);
                    }
                    Ok(_) => {}
                    Err(e) => {
                        tracing::warn!(
                            name: "relay.exchange.failed",
                            session_id = %conversation.id(),
                            fragments,
                            error = %e,
                            "Upstream call failed mid-stream"
                        );
                        yield Fragment::from_error(&e);
                        return;
                    }
                }
            }

            conversation.append_exchange(user_turn, Message::model(reply));
            let session_age = conversation.last_activity() - conversation.created_at();
            tracing::info!(
                name: "relay.exchange.completed",
                session_id = %conversation.id(),
                fragments,
                message_count = conversation.message_count(),
                session_age_ms = session_age.num_milliseconds(),
                "Exchange completed"
            );
        };

        Box::pin(stream)
    }
}
