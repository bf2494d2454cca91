//! # parley-cache
//!
//! A best-effort, read-through view of recent messages, conversation
//! entities and per-user conversation lists.
//!
//! The cache never holds data the store does not. A read either serves the
//! requested window in full or reports [`CacheError::Miss`], and the caller
//! falls back to the store.

mod error;
mod memory;

pub use error::{CacheError, Result};
pub use memory::{CacheConfig, MemoryCache};

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use parley_core::{Conversation, ConversationId, CursorMode, Message, MessageId, UserId};

/// Cache operations used by the conversation service.
///
/// Writes are idempotent keyed sets; the last writer wins.
#[async_trait]
pub trait ConversationCache: Send + Sync + 'static {
    /// A page of messages, newest first, with the store's cursor semantics.
    async fn get_messages(
        &self,
        conversation: ConversationId,
        cursor: u64,
        mode: CursorMode,
        count: usize,
    ) -> Result<Vec<Message>>;

    async fn get_last_message(&self, conversation: ConversationId) -> Result<Message>;

    /// A window of the user's conversation list, most recent first.
    async fn get_conversations(
        &self,
        user: UserId,
        start: usize,
        count: usize,
    ) -> Result<Vec<Conversation>>;

    async fn get_conversation(&self, conversation: ConversationId) -> Result<Conversation>;

    /// Append a freshly stored message.
    async fn add_message(&self, message: &Message) -> Result<()>;

    /// Refill a conversation's message set with its newest `depth` messages.
    async fn add_messages(
        &self,
        conversation: ConversationId,
        messages: &[Message],
        depth: usize,
    ) -> Result<()>;

    async fn add_conversation(&self, conversation: &Conversation) -> Result<()>;

    /// Refill a user's conversation list with its first `depth` entries.
    async fn set_conversations(
        &self,
        user: UserId,
        conversations: &[Conversation],
        depth: usize,
    ) -> Result<()>;

    /// Move a conversation to its new position in each user's list.
    ///
    /// Lists that were never seeded are left alone.
    async fn update_conversation_lists(
        &self,
        users: &[UserId],
        conversation: ConversationId,
        last_activity: DateTime<Utc>,
    ) -> Result<()>;

    /// Advance a cached read marker. `Miss` if the entity is not cached.
    async fn mark_read(
        &self,
        user: UserId,
        conversation: ConversationId,
        message: MessageId,
    ) -> Result<()>;

    /// Forget a conversation entirely.
    async fn remove_conversation(&self, conversation: ConversationId) -> Result<()>;

    /// Drop a conversation from one user's list.
    async fn remove_from_list(&self, user: UserId, conversation: ConversationId) -> Result<()>;

    /// Drop a conversation's cached messages.
    async fn evict_messages(&self, conversation: ConversationId) -> Result<()>;
}
