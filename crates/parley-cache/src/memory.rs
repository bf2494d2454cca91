//! In-process cache over `DashMap`.

use crate::error::{CacheError, Result};
use crate::ConversationCache;
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use dashmap::DashMap;
use parley_core::{Conversation, ConversationId, CursorMode, Message, MessageId, UserId};
use std::collections::{BTreeMap, BTreeSet, HashMap};
use std::sync::atomic::{AtomicBool, Ordering};
use tracing::trace;

/// Cache bounds.
#[derive(Debug, Clone, Copy)]
pub struct CacheConfig {
    /// Messages kept per conversation.
    pub message_depth: usize,
    /// Conversations kept per user list.
    pub conversation_depth: usize,
}

impl Default for CacheConfig {
    fn default() -> Self {
        Self {
            message_depth: 100,
            conversation_depth: 100,
        }
    }
}

/// A contiguous newest suffix of a conversation's messages.
#[derive(Debug)]
struct MessageSet {
    messages: BTreeMap<MessageId, Message>,
    /// Holds the whole history.
    complete: bool,
    depth: usize,
}

impl MessageSet {
    fn new(depth: usize) -> Self {
        Self {
            messages: BTreeMap::new(),
            complete: false,
            depth: depth.max(1),
        }
    }

    fn insert(&mut self, message: Message) {
        self.messages.insert(message.id, message);
        self.trim();
    }

    fn trim(&mut self) {
        while self.messages.len() > self.depth {
            self.messages.pop_first();
            self.complete = false;
        }
    }

    /// Serve a window, or `None` if the cached suffix does not cover it.
    fn window(&self, cursor: u64, mode: CursorMode, count: usize) -> Option<Vec<Message>> {
        if self.messages.is_empty() {
            return None;
        }

        match mode {
            CursorMode::Start => {
                let offset = usize::try_from(cursor).unwrap_or(usize::MAX);
                let covered = self.complete || offset.saturating_add(count) <= self.messages.len();
                covered.then(|| self.messages.values().rev().skip(offset).take(count).cloned().collect())
            }
            CursorMode::Before => {
                let older = self.messages.range(..cursor);
                let covered = self.complete || older.clone().count() >= count;
                covered.then(|| older.rev().take(count).map(|(_, m)| m.clone()).collect())
            }
            CursorMode::After => {
                let newer = self.messages.range(cursor.saturating_add(1)..);
                let oldest = self.messages.keys().next().copied().unwrap_or(MessageId::MAX);
                let covered = self.complete || oldest <= cursor || newer.clone().count() >= count;
                covered.then(|| newer.rev().take(count).map(|(_, m)| m.clone()).collect())
            }
        }
    }
}

/// A user's conversations ordered by last activity.
#[derive(Debug)]
struct ConversationList {
    /// (score, conversation), ascending.
    entries: BTreeSet<(i64, ConversationId)>,
    scores: HashMap<ConversationId, i64>,
    complete: bool,
    depth: usize,
}

impl ConversationList {
    fn new(depth: usize) -> Self {
        Self {
            entries: BTreeSet::new(),
            scores: HashMap::new(),
            complete: false,
            depth: depth.max(1),
        }
    }

    fn upsert(&mut self, conversation: ConversationId, score: i64) {
        if let Some(old) = self.scores.insert(conversation, score) {
            self.entries.remove(&(old, conversation));
        }
        self.entries.insert((score, conversation));
        while self.entries.len() > self.depth {
            if let Some((_, dropped)) = self.entries.pop_first() {
                self.scores.remove(&dropped);
            }
            self.complete = false;
        }
    }

    fn remove(&mut self, conversation: ConversationId) -> bool {
        match self.scores.remove(&conversation) {
            Some(score) => self.entries.remove(&(score, conversation)),
            None => false,
        }
    }

    fn window(&self, start: usize, count: usize) -> Option<Vec<ConversationId>> {
        if self.entries.is_empty() {
            return None;
        }
        let covered = self.complete || start.saturating_add(count) <= self.entries.len();
        covered.then(|| {
            self.entries
                .iter()
                .rev()
                .skip(start)
                .take(count)
                .map(|&(_, id)| id)
                .collect()
        })
    }
}

/// In-memory [`ConversationCache`].
#[derive(Debug, Default)]
pub struct MemoryCache {
    config: CacheConfig,
    messages: DashMap<ConversationId, MessageSet>,
    conversations: DashMap<ConversationId, Conversation>,
    lists: DashMap<UserId, ConversationList>,
    offline: AtomicBool,
}

impl MemoryCache {
    #[must_use]
    pub fn new() -> Self {
        Self::with_config(CacheConfig::default())
    }

    #[must_use]
    pub fn with_config(config: CacheConfig) -> Self {
        Self {
            config,
            ..Self::default()
        }
    }

    /// Take the cache offline (or back online). While offline every
    /// operation fails with [`CacheError::Unavailable`].
    pub fn set_offline(&self, offline: bool) {
        self.offline.store(offline, Ordering::Relaxed);
    }

    fn check(&self) -> Result<()> {
        if self.offline.load(Ordering::Relaxed) {
            return Err(CacheError::Unavailable("cache is offline".to_string()));
        }
        Ok(())
    }

    fn remove_from_lists(&self, conversation: ConversationId) {
        for mut list in self.lists.iter_mut() {
            list.remove(conversation);
        }
    }
}

#[async_trait]
impl ConversationCache for MemoryCache {
    async fn get_messages(
        &self,
        conversation: ConversationId,
        cursor: u64,
        mode: CursorMode,
        count: usize,
    ) -> Result<Vec<Message>> {
        self.check()?;
        let set = self.messages.get(&conversation).ok_or(CacheError::Miss)?;
        let page = set.window(cursor, mode, count).ok_or(CacheError::Miss)?;
        trace!(conversation, %mode, cursor, count, served = page.len(), "message cache hit");
        Ok(page)
    }

    async fn get_last_message(&self, conversation: ConversationId) -> Result<Message> {
        self.check()?;
        self.messages
            .get(&conversation)
            .and_then(|set| set.messages.values().next_back().cloned())
            .ok_or(CacheError::Miss)
    }

    async fn get_conversations(
        &self,
        user: UserId,
        start: usize,
        count: usize,
    ) -> Result<Vec<Conversation>> {
        self.check()?;
        let ids = self
            .lists
            .get(&user)
            .and_then(|list| list.window(start, count))
            .ok_or(CacheError::Miss)?;

        ids.into_iter()
            .map(|id| {
                self.conversations
                    .get(&id)
                    .map(|entry| entry.clone())
                    .ok_or(CacheError::Miss)
            })
            .collect()
    }

    async fn get_conversation(&self, conversation: ConversationId) -> Result<Conversation> {
        self.check()?;
        self.conversations
            .get(&conversation)
            .map(|entry| entry.clone())
            .ok_or(CacheError::Miss)
    }

    async fn add_message(&self, message: &Message) -> Result<()> {
        self.check()?;
        let depth = self.config.message_depth;
        self.messages
            .entry(message.conversation_id)
            .or_insert_with(|| MessageSet::new(depth))
            .insert(message.clone());

        if let Some(mut entity) = self.conversations.get_mut(&message.conversation_id) {
            let newer = entity
                .last_message
                .as_ref()
                .map_or(true, |last| last.id < message.id);
            if newer {
                entity.last_message = Some(message.clone());
                entity.last_activity = entity.last_activity.max(message.timestamp);
            }
        }
        Ok(())
    }

    async fn add_messages(
        &self,
        conversation: ConversationId,
        messages: &[Message],
        depth: usize,
    ) -> Result<()> {
        self.check()?;
        let mut set = self
            .messages
            .entry(conversation)
            .or_insert_with(|| MessageSet::new(depth));
        set.depth = depth.max(1);
        for message in messages {
            set.messages.insert(message.id, message.clone());
        }
        set.complete = messages.len() < depth;
        set.trim();
        trace!(conversation, loaded = messages.len(), complete = set.complete, "message cache refilled");
        Ok(())
    }

    async fn add_conversation(&self, conversation: &Conversation) -> Result<()> {
        self.check()?;
        let mut entity = conversation.clone();
        entity.unread = 0;
        self.conversations.insert(conversation.id, entity);
        Ok(())
    }

    async fn set_conversations(
        &self,
        user: UserId,
        conversations: &[Conversation],
        depth: usize,
    ) -> Result<()> {
        self.check()?;
        let mut list = ConversationList::new(depth);
        for conversation in conversations {
            list.upsert(conversation.id, conversation.last_activity.timestamp_millis());
        }
        list.complete = conversations.len() < depth;
        self.lists.insert(user, list);

        for conversation in conversations {
            self.add_conversation(conversation).await?;
        }
        Ok(())
    }

    async fn update_conversation_lists(
        &self,
        users: &[UserId],
        conversation: ConversationId,
        last_activity: DateTime<Utc>,
    ) -> Result<()> {
        self.check()?;
        let score = last_activity.timestamp_millis();
        for user in users {
            if let Some(mut list) = self.lists.get_mut(user) {
                list.upsert(conversation, score);
            }
        }
        if let Some(mut entity) = self.conversations.get_mut(&conversation) {
            entity.last_activity = entity.last_activity.max(last_activity);
        }
        Ok(())
    }

    async fn mark_read(
        &self,
        user: UserId,
        conversation: ConversationId,
        message: MessageId,
    ) -> Result<()> {
        self.check()?;
        let mut entity = self
            .conversations
            .get_mut(&conversation)
            .ok_or(CacheError::Miss)?;
        let participant = entity
            .participants
            .iter_mut()
            .find(|p| p.id() == user)
            .ok_or(CacheError::Miss)?;
        participant.last_read = participant.last_read.max(message);
        entity.refresh_receipts();
        Ok(())
    }

    async fn remove_conversation(&self, conversation: ConversationId) -> Result<()> {
        self.check()?;
        self.conversations.remove(&conversation);
        self.messages.remove(&conversation);
        self.remove_from_lists(conversation);
        Ok(())
    }

    async fn remove_from_list(&self, user: UserId, conversation: ConversationId) -> Result<()> {
        self.check()?;
        if let Some(mut list) = self.lists.get_mut(&user) {
            list.remove(conversation);
        }
        Ok(())
    }

    async fn evict_messages(&self, conversation: ConversationId) -> Result<()> {
        self.check()?;
        self.messages.remove(&conversation);
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Duration;
    use parley_core::{Participant, User};

    fn message(conversation: ConversationId, id: MessageId) -> Message {
        Message {
            id,
            conversation_id: conversation,
            sender: User::with_id(1),
            text: format!("m{id}"),
            timestamp: Utc::now(),
            system: false,
        }
    }

    fn conversation(id: ConversationId, minutes_ago: i64) -> Conversation {
        Conversation {
            id,
            participants: vec![Participant::new(1), Participant::new(2)],
            last_activity: Utc::now() - Duration::minutes(minutes_ago),
            primary: false,
            expiry: None,
            last_message: None,
            read: Vec::new(),
            unread: 3,
        }
    }

    fn ids(messages: &[Message]) -> Vec<MessageId> {
        messages.iter().map(|m| m.id).collect()
    }

    #[tokio::test]
    async fn test_absent_and_empty_sets_miss() {
        let cache = MemoryCache::new();
        assert_eq!(
            cache.get_messages(1, 0, CursorMode::Start, 10).await,
            Err(CacheError::Miss)
        );

        cache.add_messages(1, &[], 10).await.unwrap();
        assert_eq!(
            cache.get_messages(1, 0, CursorMode::Start, 10).await,
            Err(CacheError::Miss)
        );
        assert_eq!(cache.get_last_message(1).await, Err(CacheError::Miss));
    }

    #[tokio::test]
    async fn test_complete_set_serves_short_pages() {
        let cache = MemoryCache::new();
        cache.add_messages(1, &[], 10).await.unwrap();
        cache.add_message(&message(1, 5)).await.unwrap();
        cache.add_message(&message(1, 7)).await.unwrap();

        let page = cache.get_messages(1, 0, CursorMode::Start, 10).await.unwrap();
        assert_eq!(ids(&page), vec![7, 5]);
        assert_eq!(cache.get_last_message(1).await.unwrap().id, 7);
    }

    #[tokio::test]
    async fn test_partial_refill_only_serves_covered_windows() {
        let cache = MemoryCache::new();
        let refill: Vec<_> = (11..=20).rev().map(|id| message(1, id)).collect();
        cache.add_messages(1, &refill, 10).await.unwrap();

        let start = cache.get_messages(1, 0, CursorMode::Start, 5).await.unwrap();
        assert_eq!(ids(&start), vec![20, 19, 18, 17, 16]);
        assert_eq!(
            cache.get_messages(1, 8, CursorMode::Start, 5).await,
            Err(CacheError::Miss)
        );

        let before = cache.get_messages(1, 16, CursorMode::Before, 3).await.unwrap();
        assert_eq!(ids(&before), vec![15, 14, 13]);
        assert_eq!(
            cache.get_messages(1, 13, CursorMode::Before, 3).await,
            Err(CacheError::Miss)
        );

        let after = cache.get_messages(1, 15, CursorMode::After, 2).await.unwrap();
        assert_eq!(ids(&after), vec![20, 19]);
        let tail = cache.get_messages(1, 18, CursorMode::After, 5).await.unwrap();
        assert_eq!(ids(&tail), vec![20, 19]);
        assert_eq!(
            cache.get_messages(1, 2, CursorMode::After, 20).await,
            Err(CacheError::Miss)
        );
    }

    #[tokio::test]
    async fn test_trimming_clears_complete() {
        let cache = MemoryCache::with_config(CacheConfig {
            message_depth: 3,
            conversation_depth: 3,
        });
        cache.add_messages(1, &[], 3).await.unwrap();
        for id in 1..=4 {
            cache.add_message(&message(1, id)).await.unwrap();
        }

        let page = cache.get_messages(1, 0, CursorMode::Start, 3).await.unwrap();
        assert_eq!(ids(&page), vec![4, 3, 2]);
        assert_eq!(
            cache.get_messages(1, 0, CursorMode::Start, 4).await,
            Err(CacheError::Miss)
        );
    }

    #[tokio::test]
    async fn test_conversation_list_order_and_bump() {
        let cache = MemoryCache::new();
        let list = vec![conversation(1, 1), conversation(2, 2), conversation(3, 3)];
        cache.set_conversations(9, &list, 10).await.unwrap();

        let ids: Vec<_> = cache
            .get_conversations(9, 0, 10)
            .await
            .unwrap()
            .iter()
            .map(|c| c.id)
            .collect();
        assert_eq!(ids, vec![1, 2, 3]);

        cache
            .update_conversation_lists(&[9, 10], 3, Utc::now())
            .await
            .unwrap();
        let first = cache.get_conversations(9, 0, 1).await.unwrap();
        assert_eq!(first[0].id, 3);
        assert_eq!(first[0].unread, 0);

        assert_eq!(cache.get_conversations(10, 0, 1).await, Err(CacheError::Miss));
    }

    #[tokio::test]
    async fn test_list_without_entity_misses() {
        let cache = MemoryCache::new();
        cache
            .set_conversations(9, &[conversation(1, 1)], 10)
            .await
            .unwrap();
        cache
            .update_conversation_lists(&[9], 2, Utc::now())
            .await
            .unwrap();

        assert_eq!(cache.get_conversations(9, 0, 2).await, Err(CacheError::Miss));
        assert_eq!(cache.get_conversations(9, 1, 1).await.unwrap()[0].id, 1);
    }

    #[tokio::test]
    async fn test_incomplete_list_misses_beyond_window() {
        let cache = MemoryCache::new();
        let list = vec![conversation(1, 1), conversation(2, 2)];
        cache.set_conversations(9, &list, 2).await.unwrap();

        assert_eq!(cache.get_conversations(9, 0, 2).await.unwrap().len(), 2);
        assert_eq!(cache.get_conversations(9, 1, 2).await, Err(CacheError::Miss));
    }

    #[tokio::test]
    async fn test_mark_read_updates_entity() {
        let cache = MemoryCache::new();
        assert_eq!(cache.mark_read(1, 4, 10).await, Err(CacheError::Miss));

        cache.add_conversation(&conversation(4, 0)).await.unwrap();
        cache.mark_read(1, 4, 10).await.unwrap();
        cache.mark_read(1, 4, 2).await.unwrap();

        let entity = cache.get_conversation(4).await.unwrap();
        assert_eq!(entity.participant(1).unwrap().last_read, 10);
        assert_eq!(entity.read.len(), 1);
        assert_eq!(cache.mark_read(7, 4, 1).await, Err(CacheError::Miss));
    }

    #[tokio::test]
    async fn test_remove_conversation_everywhere() {
        let cache = MemoryCache::new();
        cache
            .set_conversations(9, &[conversation(1, 1), conversation(2, 2)], 10)
            .await
            .unwrap();
        cache.add_message(&message(1, 1)).await.unwrap();

        cache.remove_conversation(1).await.unwrap();
        assert_eq!(cache.get_conversation(1).await, Err(CacheError::Miss));
        assert_eq!(cache.get_last_message(1).await, Err(CacheError::Miss));
        let remaining = cache.get_conversations(9, 0, 10).await.unwrap();
        assert_eq!(remaining.len(), 1);
        assert_eq!(remaining[0].id, 2);

        cache.remove_from_list(9, 2).await.unwrap();
        assert_eq!(cache.get_conversations(9, 0, 10).await, Err(CacheError::Miss));
    }

    #[tokio::test]
    async fn test_offline_cache_is_unavailable() {
        let cache = MemoryCache::new();
        cache.set_offline(true);
        assert!(matches!(
            cache.add_message(&message(1, 1)).await,
            Err(CacheError::Unavailable(_))
        ));

        cache.set_offline(false);
        cache.add_message(&message(1, 1)).await.unwrap();
        cache.evict_messages(1).await.unwrap();
        assert_eq!(cache.get_last_message(1).await, Err(CacheError::Miss));
    }
}
