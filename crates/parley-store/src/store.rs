//! The async store interface and its SQLite implementation.

use std::path::Path;
use std::sync::{Arc, Mutex};

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use parley_core::{
    Conversation, ConversationId, CursorMode, Message, MessageId, Participant, UserId,
};

use crate::database::Database;
use crate::error::{Result, StoreError};

/// The authoritative conversation record.
///
/// Every operation is atomic with respect to the others.
#[async_trait]
pub trait ConversationStore: Send + Sync + 'static {
    /// Create a conversation, or return the live primary of the same pair.
    async fn create_conversation(
        &self,
        initiator: UserId,
        participants: &[UserId],
        primary: bool,
        expiry: Option<DateTime<Utc>>,
    ) -> Result<Conversation>;

    /// Add participants. Returns the users that became active.
    async fn add_participants(
        &self,
        conversation: ConversationId,
        users: &[UserId],
    ) -> Result<Vec<UserId>>;

    /// Append a message, bumping the conversation's last activity.
    async fn add_message(
        &self,
        conversation: ConversationId,
        sender: UserId,
        text: &str,
        system: bool,
    ) -> Result<Message>;

    /// A page of messages, newest first.
    async fn get_messages(
        &self,
        conversation: ConversationId,
        cursor: u64,
        mode: CursorMode,
        count: usize,
    ) -> Result<Vec<Message>>;

    async fn last_message(&self, conversation: ConversationId) -> Result<Option<Message>>;

    /// Advance a read marker; returns the marker after clamping.
    async fn mark_read(
        &self,
        conversation: ConversationId,
        user: UserId,
        message: MessageId,
    ) -> Result<MessageId>;

    /// The user's visible conversations, most recently active first, with
    /// `unread` filled in.
    async fn get_conversations(
        &self,
        user: UserId,
        start: usize,
        count: usize,
    ) -> Result<Vec<Conversation>>;

    async fn get_conversation(&self, conversation: ConversationId) -> Result<Conversation>;

    async fn participants(&self, conversation: ConversationId) -> Result<Vec<Participant>>;

    async fn is_participant(&self, conversation: ConversationId, user: UserId) -> Result<bool>;

    async fn user_conversation_unread(
        &self,
        user: UserId,
        conversation: ConversationId,
    ) -> Result<u64>;

    /// Badge count across the user's conversations.
    async fn unread_message_count(&self, user: UserId) -> Result<u64>;

    async fn terminate_conversation(&self, conversation: ConversationId) -> Result<()>;

    /// Soft-delete for one participant.
    async fn delete_conversation(&self, conversation: ConversationId, user: UserId) -> Result<()>;

    async fn set_expiry(
        &self,
        conversation: ConversationId,
        expiry: Option<DateTime<Utc>>,
    ) -> Result<()>;

    async fn set_muted(
        &self,
        conversation: ConversationId,
        user: UserId,
        muted: bool,
    ) -> Result<()>;
}

/// [`ConversationStore`] over a single SQLite connection.
///
/// Queries run on the blocking pool, one at a time.
#[derive(Clone)]
pub struct SqliteStore {
    db: Arc<Mutex<Database>>,
}

impl SqliteStore {
    /// Open (or create) a database file.
    pub fn open(path: &Path) -> Result<Self> {
        Ok(Self::from_database(Database::open_at(path)?))
    }

    /// Open a private in-memory database.
    pub fn open_in_memory() -> Result<Self> {
        Ok(Self::from_database(Database::open_in_memory()?))
    }

    pub fn from_database(db: Database) -> Self {
        Self {
            db: Arc::new(Mutex::new(db)),
        }
    }

    async fn call<F, T>(&self, f: F) -> Result<T>
    where
        F: FnOnce(&mut Database) -> Result<T> + Send + 'static,
        T: Send + 'static,
    {
        let db = Arc::clone(&self.db);
        tokio::task::spawn_blocking(move || {
            let mut guard = db.lock().map_err(|_| StoreError::Poisoned)?;
            f(&mut guard)
        })
        .await?
    }
}

#[async_trait]
impl ConversationStore for SqliteStore {
    async fn create_conversation(
        &self,
        initiator: UserId,
        participants: &[UserId],
        primary: bool,
        expiry: Option<DateTime<Utc>>,
    ) -> Result<Conversation> {
        let participants = participants.to_vec();
        self.call(move |db| db.create_conversation(initiator, &participants, primary, expiry))
            .await
    }

    async fn add_participants(
        &self,
        conversation: ConversationId,
        users: &[UserId],
    ) -> Result<Vec<UserId>> {
        let users = users.to_vec();
        self.call(move |db| db.add_participants(conversation, &users))
            .await
    }

    async fn add_message(
        &self,
        conversation: ConversationId,
        sender: UserId,
        text: &str,
        system: bool,
    ) -> Result<Message> {
        let text = text.to_owned();
        self.call(move |db| db.add_message(conversation, sender, &text, system))
            .await
    }

    async fn get_messages(
        &self,
        conversation: ConversationId,
        cursor: u64,
        mode: CursorMode,
        count: usize,
    ) -> Result<Vec<Message>> {
        self.call(move |db| db.get_messages(conversation, cursor, mode, count))
            .await
    }

    async fn last_message(&self, conversation: ConversationId) -> Result<Option<Message>> {
        self.call(move |db| db.last_message(conversation)).await
    }

    async fn mark_read(
        &self,
        conversation: ConversationId,
        user: UserId,
        message: MessageId,
    ) -> Result<MessageId> {
        self.call(move |db| db.mark_read(conversation, user, message))
            .await
    }

    async fn get_conversations(
        &self,
        user: UserId,
        start: usize,
        count: usize,
    ) -> Result<Vec<Conversation>> {
        self.call(move |db| db.get_conversations(user, start, count))
            .await
    }

    async fn get_conversation(&self, conversation: ConversationId) -> Result<Conversation> {
        self.call(move |db| db.get_conversation(conversation)).await
    }

    async fn participants(&self, conversation: ConversationId) -> Result<Vec<Participant>> {
        self.call(move |db| db.participants(conversation)).await
    }

    async fn is_participant(&self, conversation: ConversationId, user: UserId) -> Result<bool> {
        self.call(move |db| db.is_participant(conversation, user))
            .await
    }

    async fn user_conversation_unread(
        &self,
        user: UserId,
        conversation: ConversationId,
    ) -> Result<u64> {
        self.call(move |db| db.user_conversation_unread(user, conversation))
            .await
    }

    async fn unread_message_count(&self, user: UserId) -> Result<u64> {
        self.call(move |db| db.unread_message_count(user)).await
    }

    async fn terminate_conversation(&self, conversation: ConversationId) -> Result<()> {
        self.call(move |db| db.terminate_conversation(conversation))
            .await
    }

    async fn delete_conversation(&self, conversation: ConversationId, user: UserId) -> Result<()> {
        self.call(move |db| db.delete_conversation(conversation, user))
            .await
    }

    async fn set_expiry(
        &self,
        conversation: ConversationId,
        expiry: Option<DateTime<Utc>>,
    ) -> Result<()> {
        self.call(move |db| db.set_expiry(conversation, expiry))
            .await
    }

    async fn set_muted(
        &self,
        conversation: ConversationId,
        user: UserId,
        muted: bool,
    ) -> Result<()> {
        self.call(move |db| db.set_muted(conversation, user, muted))
            .await
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_concurrent_writers_get_distinct_ids() {
        let store = SqliteStore::open_in_memory().unwrap();
        let conv = store.create_conversation(1, &[2], false, None).await.unwrap();

        let handles: Vec<_> = (0..16)
            .map(|n| {
                let store = store.clone();
                tokio::spawn(async move {
                    store
                        .add_message(conv.id, 1 + n % 2, &format!("m{n}"), false)
                        .await
                        .unwrap()
                        .id
                })
            })
            .collect();

        let mut ids = Vec::new();
        for handle in handles {
            ids.push(handle.await.unwrap());
        }
        ids.sort_unstable();
        ids.dedup();
        assert_eq!(ids.len(), 16);

        let page = store
            .get_messages(conv.id, 0, CursorMode::Start, 100)
            .await
            .unwrap();
        assert_eq!(page.len(), 16);
    }

    #[tokio::test]
    async fn test_reopen_keeps_data() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("parley.db");

        let conv = {
            let store = SqliteStore::open(&path).unwrap();
            let conv = store.create_conversation(1, &[2], true, None).await.unwrap();
            store.add_message(conv.id, 2, "persisted", false).await.unwrap();
            conv
        };

        let store = SqliteStore::open(&path).unwrap();
        let loaded = store.get_conversation(conv.id).await.unwrap();
        assert_eq!(loaded.last_message.unwrap().text, "persisted");
        assert_eq!(store.unread_message_count(1).await.unwrap(), 1);

        let again = store.create_conversation(2, &[1], true, None).await.unwrap();
        assert_eq!(again.id, conv.id);
    }

    #[tokio::test]
    async fn test_missing_conversation() {
        let store = SqliteStore::open_in_memory().unwrap();
        assert!(matches!(
            store.get_conversation(5).await,
            Err(StoreError::NotFound)
        ));
    }
}
