//! Session and conversation management.
//!
//! Sessions are identified by an opaque token (a UUID unless the client
//! supplies its own) and own a [`Conversation`] holding the turn history that
//! is replayed to the model on every call.
//!
//! # Architecture
//!
//! - [`Conversation`]: the conversation handle for one session
//! - [`SessionRegistry`]: the store interface the relay depends on
//! - [`SessionStore`]: the in-memory registry used by the server
//!
//! # Example
//!
//! ```rust
//! use tars_relay::session::{SessionRegistry, SessionStore};
//!
//! let store = SessionStore::new();
//! let session = store.create_session();
//!
//! let same = store.resolve_or_create(Some(session.id()));
//! assert_eq!(same.id(), session.id());
//! assert_eq!(store.len(), 1);
//! ```

mod conversation;
mod store;

pub use conversation::Conversation;
pub use store::{SessionRegistry, SessionStore};
