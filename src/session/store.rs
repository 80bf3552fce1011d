//! Session registry: token to conversation mapping.

use std::collections::HashMap;
use std::sync::{Arc, PoisonError, RwLock};

use uuid::Uuid;

use super::Conversation;

/// Keyed store of live conversations.
///
/// The relay only depends on this trait, so alternative stores (bounded,
/// evicting, instrumented) can be injected without touching relay logic.
pub trait SessionRegistry: Send + Sync + std::fmt::Debug {
    /// Create a conversation under a fresh token.
    fn create_session(&self) -> Conversation;

    /// Resolve a client-supplied token, creating a conversation if needed.
    ///
    /// - known token: the existing conversation;
    /// - unknown token: a new conversation stored under that same token;
    /// - absent or empty token: a new conversation under a fresh token.
    fn resolve_or_create(&self, session_id: Option<&str>) -> Conversation;

    /// Look up a conversation without creating one.
    fn get(&self, id: &str) -> Option<Conversation>;

    /// Number of stored conversations.
    fn len(&self) -> usize;

    fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

/// In-memory [`SessionRegistry`].
///
/// Entries live until the process exits; there is no eviction and no bound on
/// the number of sessions or on their history. The lock makes each map
/// operation atomic but does not serialize exchanges: two requests racing to
/// create the same unknown token may both insert, and the last one wins.
#[derive(Debug, Clone)]
pub struct SessionStore {
    inner: Arc<SessionStoreInner>,
}

#[derive(Debug)]
struct SessionStoreInner {
    sessions: RwLock<HashMap<String, Conversation>>,
}

impl Default for SessionStore {
    fn default() -> Self {
        Self::new()
    }
}

impl SessionStore {
    /// Create an empty session store.
    #[must_use]
    pub fn new() -> Self {
        Self {
            inner: Arc::new(SessionStoreInner {
                sessions: RwLock::new(HashMap::new()),
            }),
        }
    }

    /// Store a new conversation under the given token, replacing any previous one.
    fn create_with_id(&self, id: String) -> Conversation {
        let conversation = Conversation::new(id.clone());
        let mut guard = self
            .inner
            .sessions
            .write()
            .unwrap_or_else(PoisonError::into_inner);
        guard.insert(id, conversation.clone());
        conversation
    }
}

impl SessionRegistry for SessionStore {
    fn create_session(&self) -> Conversation {
        let conversation = self.create_with_id(Uuid::new_v4().to_string());
        tracing::info!(name: "session.created", session_id = %conversation.id(), "Session created");
        conversation
    }

    fn resolve_or_create(&self, session_id: Option<&str>) -> Conversation {
        let Some(id) = session_id.filter(|id| !id.is_empty()) else {
            return self.create_session();
        };

        if let Some(conversation) = self.get(id) {
            tracing::debug!(session_id = %id, "Using existing session");
            return conversation;
        }

        let conversation = self.create_with_id(id.to_string());
        tracing::info!(
            name: "session.created",
            session_id = %id,
            client_supplied = true,
            "Session created"
        );
        conversation
    }

    fn get(&self, id: &str) -> Option<Conversation> {
        self.inner
            .sessions
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .get(id)
            .cloned()
    }

    fn len(&self) -> usize {
        self.inner
            .sessions
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .len()
    }
}
