//! The conversation service.
//!
//! Every operation finishes its durable part against the store before
//! returning. Cache upkeep, fan-out and push run afterwards on the
//! [`TaskQueue`]; their failures are logged, counted and swallowed.

use chrono::{DateTime, Utc};
use dashmap::DashSet;
use parley_cache::{CacheError, ConversationCache};
use parley_core::{
    conversation_channels, user_channel, user_channels, Broker, ChannelId, Conversation,
    ConversationId, CursorMode, Message, MessageId, Payload, ReadReceipt, Subscription, User,
    UserId,
};
use parley_protocol::{conversation_location, Event, EventType};
use parley_store::ConversationStore;
use serde::Serialize;
use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, info, warn};

use crate::config::ConfigHandle;
use crate::directory::{LogPushDispatcher, PushDispatcher, PushRequest, StaticDirectory, UserDirectory};
use crate::error::{Result, ServiceError};
use crate::metrics;
use crate::notifier::Notifier;
use crate::tasks::TaskQueue;

/// Event payload announcing a conversation's end.
#[derive(Debug, Clone, Serialize)]
struct Ended {
    conversation: ConversationId,
    by: UserId,
}

/// Conversation operations for authenticated callers.
#[derive(Clone)]
pub struct ConversationService {
    store: Arc<dyn ConversationStore>,
    cache: Arc<dyn ConversationCache>,
    broker: Arc<Broker>,
    users: Arc<dyn UserDirectory>,
    push: Arc<dyn PushDispatcher>,
    config: ConfigHandle,
    tasks: TaskQueue,
    notifier: Notifier,
    /// Conversations whose cached state missed a write. Reads bypass the
    /// cache for them until the cached copy is rebuilt from the store.
    stale: Arc<DashSet<ConversationId>>,
}

impl ConversationService {
    /// Create a service with an empty user directory and a logging push
    /// dispatcher.
    ///
    /// Must be called from within a Tokio runtime.
    pub fn new(
        store: Arc<dyn ConversationStore>,
        cache: Arc<dyn ConversationCache>,
        broker: Arc<Broker>,
        config: ConfigHandle,
    ) -> Self {
        let tasks = TaskQueue::new(config.snapshot().task_queue_capacity);
        let notifier = Notifier::new(Arc::clone(&store), Arc::clone(&broker));
        Self {
            store,
            cache,
            broker,
            users: Arc::new(StaticDirectory::default()),
            push: Arc::new(LogPushDispatcher),
            config,
            tasks,
            notifier,
            stale: Arc::new(DashSet::new()),
        }
    }

    #[must_use]
    pub fn with_users(mut self, users: Arc<dyn UserDirectory>) -> Self {
        self.users = users;
        self
    }

    #[must_use]
    pub fn with_push(mut self, push: Arc<dyn PushDispatcher>) -> Self {
        self.push = push;
        self
    }

    pub fn config(&self) -> &ConfigHandle {
        &self.config
    }

    pub fn broker(&self) -> &Arc<Broker> {
        &self.broker
    }

    pub fn notifier(&self) -> &Notifier {
        &self.notifier
    }

    /// Wait for every pending background unit.
    pub async fn drain(&self) {
        self.tasks.drain().await;
    }

    // --- conversations -------------------------------------------------

    /// Create a conversation. An `expiring` conversation ends after the
    /// configured default lifetime.
    pub async fn create_conversation(
        &self,
        initiator: UserId,
        participants: &[UserId],
        primary: bool,
        expiring: bool,
    ) -> Result<Conversation> {
        let config = self.config.snapshot();
        let expiry = if expiring {
            let at = chrono::Duration::from_std(config.default_expiry())
                .ok()
                .and_then(|lifetime| Utc::now().checked_add_signed(lifetime))
                .ok_or_else(|| {
                    ServiceError::InvalidConfig(format!(
                        "default_expiry_secs {} is out of range",
                        config.default_expiry_secs
                    ))
                })?;
            Some(at)
        } else {
            None
        };

        let mut conversation = self
            .store
            .create_conversation(initiator, participants, primary, expiry)
            .await?;
        self.hydrate_conversation(&mut conversation).await;

        info!(
            conversation = conversation.id,
            initiator,
            participants = conversation.participants.len(),
            "conversation created"
        );

        let this = self.clone();
        let created = conversation.clone();
        let queued = self.tasks.submit("conversation_created", async move {
            this.announce_conversation(&created, &created.participant_ids())
                .await;
        });
        if !queued {
            self.mark_stale(conversation.id);
        }

        Ok(conversation)
    }

    /// Add users to a conversation the adder belongs to.
    ///
    /// Each newly active user gets a system "joined" message. Returns the
    /// newly active users.
    pub async fn add_participants(
        &self,
        adder: UserId,
        conversation: ConversationId,
        users: &[UserId],
    ) -> Result<Vec<UserId>> {
        self.require_participant(conversation, adder).await?;
        let added = self.store.add_participants(conversation, users).await?;

        for &user in &added {
            let name = self.hydrate_user(user).await.name;
            let text = match name {
                Some(name) => format!("{name} joined the conversation"),
                None => "joined the conversation".to_string(),
            };
            self.post(conversation, user, &text, true).await?;
        }

        if !added.is_empty() {
            let this = self.clone();
            let joined = added.clone();
            let queued = self.tasks.submit("participants_added", async move {
                match this.store.get_conversation(conversation).await {
                    Ok(mut entity) => {
                        this.hydrate_conversation(&mut entity).await;
                        this.announce_conversation(&entity, &joined).await;
                    }
                    Err(e) => {
                        background_failure("reload_conversation", &e);
                        this.mark_stale(conversation);
                    }
                }
            });
            if !queued {
                self.mark_stale(conversation);
            }
        }

        Ok(added)
    }

    /// A page of the user's conversations, most recently active first.
    pub async fn get_conversations(
        &self,
        user: UserId,
        start: usize,
        count: Option<usize>,
    ) -> Result<Vec<Conversation>> {
        let config = self.config.snapshot();
        let count = count.unwrap_or(config.conversation_page_size);

        let cached = if self.cache_usable(None).await {
            match self.cache.get_conversations(user, start, count).await {
                Ok(cached) => {
                    if self.still_member(user, &cached).await? {
                        Ok(cached)
                    } else {
                        debug!(user, "cached list names a conversation the user left");
                        Err(CacheError::Miss)
                    }
                }
                Err(e) => Err(e),
            }
        } else {
            Err(awaiting_repair())
        };

        let mut conversations = match cached {
            Ok(mut cached) => {
                metrics::record_cache_hit("conversations");
                for conversation in &mut cached {
                    conversation.unread = self
                        .store
                        .user_conversation_unread(user, conversation.id)
                        .await?;
                }
                cached
            }
            Err(e) => {
                self.note_miss("conversations", &e);
                let loaded = self.store.get_conversations(user, start, count).await?;
                if e.is_miss() {
                    self.refill_conversations(user, config.conversation_cache);
                }
                loaded
            }
        };

        for conversation in &mut conversations {
            self.hydrate_conversation(conversation).await;
        }
        Ok(conversations)
    }

    /// A single conversation the user belongs to.
    pub async fn get_conversation(
        &self,
        user: UserId,
        conversation: ConversationId,
    ) -> Result<Conversation> {
        self.require_participant(conversation, user).await?;

        let cached = if self.cache_usable(Some(conversation)).await {
            self.cache.get_conversation(conversation).await
        } else {
            Err(awaiting_repair())
        };
        let mut entity = match cached {
            Ok(entity) => {
                metrics::record_cache_hit("conversation");
                entity
            }
            Err(e) => {
                self.note_miss("conversation", &e);
                let entity = self.store.get_conversation(conversation).await?;
                if e.is_miss() {
                    self.refill_conversation(conversation);
                }
                entity
            }
        };

        entity.unread = self
            .store
            .user_conversation_unread(user, conversation)
            .await?;
        self.hydrate_conversation(&mut entity).await;
        Ok(entity)
    }

    /// Soft-delete a conversation for the user. Adding them back restores it.
    pub async fn delete_conversation(&self, user: UserId, conversation: ConversationId) -> Result<()> {
        self.store.delete_conversation(conversation, user).await?;
        debug!(conversation, user, "conversation deleted for user");

        let this = self.clone();
        self.tasks.submit("conversation_deleted", async move {
            if let Err(e) = this.cache.remove_from_list(user, conversation).await {
                background_failure("cache_remove_from_list", &e);
            }
            // Other members' cached copy still lists the user.
            this.reload_conversation(conversation).await;
        });
        Ok(())
    }

    /// End a conversation for every participant.
    pub async fn terminate_conversation(
        &self,
        user: UserId,
        conversation: ConversationId,
    ) -> Result<()> {
        self.require_participant(conversation, user).await?;
        self.store.terminate_conversation(conversation).await?;
        info!(conversation, user, "conversation terminated");

        let this = self.clone();
        self.tasks.submit("conversation_terminated", async move {
            if let Err(e) = this.cache.remove_conversation(conversation).await {
                background_failure("cache_remove_conversation", &e);
            }
            let Some(channels) = this.conversation_channels(conversation).await else {
                return;
            };
            let ended = Ended {
                conversation,
                by: user,
            };
            this.publish_entity(EventType::Ended, conversation, &ended, &channels);
        });
        Ok(())
    }

    /// Set or clear the expiry of a conversation the user belongs to.
    pub async fn set_expiry(
        &self,
        user: UserId,
        conversation: ConversationId,
        expiry: Option<DateTime<Utc>>,
    ) -> Result<()> {
        self.require_participant(conversation, user).await?;
        self.store.set_expiry(conversation, expiry).await?;
        self.refill_conversation(conversation);
        Ok(())
    }

    /// Clear the expiry of the conversation whose participants are exactly
    /// `users`. Returns the conversation, if one matched.
    pub async fn un_expire_between(&self, users: &[UserId]) -> Result<Option<ConversationId>> {
        let Some(&first) = users.first() else {
            return Ok(None);
        };
        let page = self.config.snapshot().conversation_page_size.max(1);

        let mut start = 0;
        loop {
            let conversations = self.store.get_conversations(first, start, page).await?;
            if conversations.is_empty() {
                return Ok(None);
            }

            if let Some(found) = conversations
                .iter()
                .find(|c| c.expiry.is_some() && c.has_exact_participants(users))
            {
                self.store.set_expiry(found.id, None).await?;
                debug!(conversation = found.id, "conversation un-expired");
                self.refill_conversation(found.id);
                return Ok(Some(found.id));
            }
            start += conversations.len();
        }
    }

    pub async fn set_muted(
        &self,
        user: UserId,
        conversation: ConversationId,
        muted: bool,
    ) -> Result<()> {
        self.store.set_muted(conversation, user, muted).await?;
        self.refill_conversation(conversation);
        Ok(())
    }

    /// Badge count for the user.
    pub async fn unread_count(&self, user: UserId) -> Result<u64> {
        Ok(self.store.unread_message_count(user).await?)
    }

    // --- messages ------------------------------------------------------

    /// Post a message as a participant.
    pub async fn add_message(
        &self,
        sender: UserId,
        conversation: ConversationId,
        text: &str,
    ) -> Result<Message> {
        self.require_participant(conversation, sender).await?;
        self.post(conversation, sender, text, false).await
    }

    /// Post a system message. System messages never count as unread and
    /// never push.
    pub async fn add_system_message(
        &self,
        sender: UserId,
        conversation: ConversationId,
        text: &str,
    ) -> Result<Message> {
        self.require_participant(conversation, sender).await?;
        self.post(conversation, sender, text, true).await
    }

    /// A page of messages, newest first.
    pub async fn get_messages(
        &self,
        user: UserId,
        conversation: ConversationId,
        cursor: u64,
        mode: CursorMode,
        count: Option<usize>,
    ) -> Result<Vec<Message>> {
        self.require_participant(conversation, user).await?;
        let config = self.config.snapshot();
        let count = count.unwrap_or(config.message_page_size);

        let cached = if self.cache_usable(Some(conversation)).await {
            self.cache
                .get_messages(conversation, cursor, mode, count)
                .await
        } else {
            Err(awaiting_repair())
        };
        let mut messages = match cached {
            Ok(cached) => {
                metrics::record_cache_hit("messages");
                cached
            }
            Err(e) => {
                self.note_miss("messages", &e);
                let loaded = self
                    .store
                    .get_messages(conversation, cursor, mode, count)
                    .await?;
                if e.is_miss() {
                    self.refill_messages(conversation, config.message_cache);
                }
                loaded
            }
        };

        self.hydrate_messages(&mut messages).await;
        Ok(messages)
    }

    pub async fn get_last_message(
        &self,
        user: UserId,
        conversation: ConversationId,
    ) -> Result<Option<Message>> {
        self.require_participant(conversation, user).await?;

        let cached = if self.cache_usable(Some(conversation)).await {
            self.cache.get_last_message(conversation).await
        } else {
            Err(awaiting_repair())
        };
        let message = match cached {
            Ok(message) => {
                metrics::record_cache_hit("last_message");
                Some(message)
            }
            Err(e) => {
                self.note_miss("last_message", &e);
                let loaded = self.store.last_message(conversation).await?;
                if e.is_miss() && loaded.is_some() {
                    self.refill_messages(conversation, self.config.snapshot().message_cache);
                }
                loaded
            }
        };

        match message {
            Some(mut message) => {
                message.sender = self.hydrate_user(message.sender.id).await;
                Ok(Some(message))
            }
            None => Ok(None),
        }
    }

    /// Advance the user's read marker. Returns the marker after clamping.
    pub async fn mark_conversation_seen(
        &self,
        user: UserId,
        conversation: ConversationId,
        message: MessageId,
    ) -> Result<MessageId> {
        self.require_participant(conversation, user).await?;
        let last_read = self.store.mark_read(conversation, user, message).await?;

        let this = self.clone();
        self.tasks.submit("conversation_seen", async move {
            if let Err(e) = this.cache.mark_read(user, conversation, last_read).await {
                debug!(conversation, user, error = %e, "cached read marker not updated, reloading");
                this.reload_conversation(conversation).await;
            }
            if let Some(channels) = this.conversation_channels(conversation).await {
                let receipt = ReadReceipt { user, last_read };
                this.publish_entity(EventType::Read, conversation, &receipt, &channels);
            }
        });

        Ok(last_read)
    }

    // --- live delivery -------------------------------------------------

    /// Open a live session on the user's own channels.
    ///
    /// An empty channel list subscribes to all of them.
    pub fn subscribe(&self, user: UserId, channels: Vec<ChannelId>) -> Result<Subscription> {
        let channels = if channels.is_empty() {
            user_channels(user)
        } else {
            check_channels(user, &channels)?;
            channels
        };
        Ok(self.broker.subscribe(channels)?)
    }

    /// Check that every channel belongs to the user.
    pub fn authorize_channels(&self, user: UserId, channels: &[ChannelId]) -> Result<()> {
        check_channels(user, channels)
    }

    /// Remove channels from a session opened by [`subscribe`](Self::subscribe).
    pub async fn unsubscribe(
        &self,
        user: UserId,
        subscription: &Subscription,
        channels: Vec<ChannelId>,
    ) -> Result<()> {
        check_channels(user, &channels)?;
        Ok(subscription.unsubscribe(channels).await?)
    }

    /// Wait up to `timeout` for the next payload on the user's channels.
    ///
    /// Returns `Ok(None)` when nothing arrived in time.
    pub async fn await_event(&self, user: UserId, timeout: Duration) -> Result<Option<Arc<Payload>>> {
        let mut subscription = self.broker.subscribe(user_channels(user))?;
        match tokio::time::timeout(timeout, subscription.recv()).await {
            Ok(payload) => Ok(payload),
            Err(_) => Ok(None),
        }
    }

    // --- internals -----------------------------------------------------

    async fn require_participant(&self, conversation: ConversationId, user: UserId) -> Result<()> {
        if self.store.is_participant(conversation, user).await? {
            Ok(())
        } else {
            Err(ServiceError::NotAllowed)
        }
    }

    /// Durable insert followed by fan-out, cache upkeep and push.
    async fn post(
        &self,
        conversation: ConversationId,
        sender: UserId,
        text: &str,
        system: bool,
    ) -> Result<Message> {
        let mut message = self
            .store
            .add_message(conversation, sender, text, system)
            .await?;
        metrics::record_message_stored(system);
        message.sender = self.hydrate_user(sender).await;

        let this = self.clone();
        let posted = message.clone();
        let queued = self.tasks.submit("message_posted", async move {
            this.deliver_message(posted).await;
        });
        if !queued {
            self.mark_stale(conversation);
        }

        Ok(message)
    }

    async fn deliver_message(&self, message: Message) {
        let conversation = message.conversation_id;
        let participants = match self.store.participants(conversation).await {
            Ok(participants) => participants,
            Err(e) => return background_failure("load_participants", &e),
        };
        let ids: Vec<UserId> = participants.iter().map(|p| p.id()).collect();
        let channels = conversation_channels(ids.iter().copied());

        // Bare entity for long-poll consumers, then the typed event.
        if let Err(e) = self.broker.publish_json(&message, &channels) {
            background_failure("publish_message", &e);
        }
        self.publish_entity(EventType::Message, conversation, &message, &channels);

        if let Err(e) = self.cache.add_message(&message).await {
            background_failure("cache_add_message", &e);
            self.mark_stale(conversation);
        }
        if let Err(e) = self
            .cache
            .update_conversation_lists(&ids, conversation, message.timestamp)
            .await
        {
            background_failure("cache_update_lists", &e);
            self.mark_stale(conversation);
        }

        if message.system {
            return;
        }
        let preview: String = message
            .text
            .chars()
            .take(self.config.snapshot().preview_length)
            .collect();
        for participant in participants
            .iter()
            .filter(|p| p.id() != message.sender.id && !p.muted)
        {
            let badge = match self.store.unread_message_count(participant.id()).await {
                Ok(badge) => badge,
                Err(e) => {
                    background_failure("badge_count", &e);
                    continue;
                }
            };
            self.push
                .request_push(
                    participant.id(),
                    PushRequest {
                        badge,
                        preview: preview.clone(),
                        conversation,
                    },
                )
                .await;
            metrics::record_push();
        }
    }

    /// Seed the cache with a new or changed conversation and tell `recipients`
    /// about it on their user channels.
    async fn announce_conversation(&self, conversation: &Conversation, recipients: &[UserId]) {
        let depth = self.config.snapshot().message_cache;
        if conversation.last_message.is_none() {
            if let Err(e) = self.cache.add_messages(conversation.id, &[], depth).await {
                background_failure("cache_seed_messages", &e);
            }
        }
        if let Err(e) = self.cache.add_conversation(conversation).await {
            background_failure("cache_add_conversation", &e);
        }
        if let Err(e) = self
            .cache
            .update_conversation_lists(
                &conversation.participant_ids(),
                conversation.id,
                conversation.last_activity,
            )
            .await
        {
            background_failure("cache_update_lists", &e);
            self.mark_stale(conversation.id);
        }

        let channels: Vec<ChannelId> = recipients.iter().copied().map(user_channel).collect();
        self.publish_entity(
            EventType::NewConversation,
            conversation.id,
            conversation,
            &channels,
        );
    }

    fn publish_entity<T: Serialize>(
        &self,
        kind: EventType,
        conversation: ConversationId,
        entity: &T,
        channels: &[ChannelId],
    ) {
        let event = match Event::from_entity(kind, conversation_location(conversation), entity) {
            Ok(event) => event,
            Err(e) => return background_failure("encode_event", &e),
        };
        match self.broker.publish(&event, channels) {
            Ok(delivered) => metrics::record_event(kind.as_str(), delivered),
            Err(e) => background_failure("publish_event", &e),
        }
    }

    async fn conversation_channels(&self, conversation: ConversationId) -> Option<Vec<ChannelId>> {
        match self.store.participants(conversation).await {
            Ok(participants) => Some(conversation_channels(participants.iter().map(|p| p.id()))),
            Err(e) => {
                background_failure("load_participants", &e);
                None
            }
        }
    }

    /// Replace the cached entity with the store's, marking the conversation
    /// stale if that fails.
    async fn reload_conversation(&self, conversation: ConversationId) {
        if !self.sync_conversation(conversation).await {
            self.mark_stale(conversation);
        }
    }

    /// Copy the stored entity into the cache and bump its lists.
    /// Conversations that have ended are dropped instead.
    async fn sync_conversation(&self, conversation: ConversationId) -> bool {
        let entity = match self.store.get_conversation(conversation).await {
            Ok(entity) => entity,
            Err(e) => {
                background_failure("reload_conversation", &e);
                return false;
            }
        };

        let result = if entity.expiry.is_some_and(|expiry| expiry.ended) {
            self.cache.remove_conversation(conversation).await
        } else {
            match self.cache.add_conversation(&entity).await {
                Ok(()) => {
                    self.cache
                        .update_conversation_lists(
                            &entity.participant_ids(),
                            conversation,
                            entity.last_activity,
                        )
                        .await
                }
                Err(e) => Err(e),
            }
        };
        match result {
            Ok(()) => true,
            Err(e) => {
                background_failure("cache_reload_conversation", &e);
                false
            }
        }
    }

    fn mark_stale(&self, conversation: ConversationId) {
        if self.stale.insert(conversation) {
            debug!(conversation, "cached conversation marked stale");
        }
    }

    /// Rebuild stale conversations, then report whether cached state for
    /// `conversation` (or, with `None`, for every conversation) is usable.
    async fn cache_usable(&self, conversation: Option<ConversationId>) -> bool {
        if !self.stale.is_empty() {
            let pending: Vec<ConversationId> = self.stale.iter().map(|id| *id).collect();
            for id in pending {
                self.stale.remove(&id);
                if !self.repair_conversation(id).await {
                    self.stale.insert(id);
                }
            }
        }
        match conversation {
            Some(id) => !self.stale.contains(&id),
            None => self.stale.is_empty(),
        }
    }

    /// Drop the cached messages and re-copy the entity.
    async fn repair_conversation(&self, conversation: ConversationId) -> bool {
        match self.cache.evict_messages(conversation).await {
            Ok(()) => {
                let repaired = self.sync_conversation(conversation).await;
                if repaired {
                    debug!(conversation, "cached conversation rebuilt");
                }
                repaired
            }
            Err(e) => {
                debug!(conversation, error = %e, "cache repair deferred");
                false
            }
        }
    }

    /// Whether the user still belongs to every listed conversation.
    async fn still_member(&self, user: UserId, conversations: &[Conversation]) -> Result<bool> {
        for conversation in conversations {
            if !self.store.is_participant(conversation.id, user).await? {
                return Ok(false);
            }
        }
        Ok(true)
    }

    fn refill_conversation(&self, conversation: ConversationId) {
        let this = self.clone();
        self.tasks.submit("conversation_refill", async move {
            this.reload_conversation(conversation).await;
        });
    }

    fn refill_messages(&self, conversation: ConversationId, depth: usize) {
        let store = Arc::clone(&self.store);
        let cache = Arc::clone(&self.cache);
        self.tasks.submit("message_refill", async move {
            match store
                .get_messages(conversation, 0, CursorMode::Start, depth)
                .await
            {
                Ok(messages) => {
                    if let Err(e) = cache.add_messages(conversation, &messages, depth).await {
                        background_failure("cache_refill_messages", &e);
                    }
                }
                Err(e) => background_failure("load_messages", &e),
            }
        });
    }

    fn refill_conversations(&self, user: UserId, depth: usize) {
        let store = Arc::clone(&self.store);
        let cache = Arc::clone(&self.cache);
        self.tasks.submit("conversation_list_refill", async move {
            match store.get_conversations(user, 0, depth).await {
                Ok(conversations) => {
                    if let Err(e) = cache.set_conversations(user, &conversations, depth).await {
                        background_failure("cache_refill_conversations", &e);
                    }
                }
                Err(e) => background_failure("load_conversations", &e),
            }
        });
    }

    fn note_miss(&self, kind: &'static str, error: &CacheError) {
        metrics::record_cache_miss(kind);
        if !error.is_miss() {
            warn!(kind, error = %error, "cache read failed");
        }
    }

    async fn hydrate_user(&self, id: UserId) -> User {
        match self.users.get_user(id).await {
            Ok(user) => user,
            Err(e) => {
                debug!(user = id, error = %e, "user not hydrated");
                User::with_id(id)
            }
        }
    }

    async fn hydrate_conversation(&self, conversation: &mut Conversation) {
        for participant in &mut conversation.participants {
            participant.user = self.hydrate_user(participant.id()).await;
        }
        if let Some(message) = conversation.last_message.as_mut() {
            message.sender = self.hydrate_user(message.sender.id).await;
        }
    }

    async fn hydrate_messages(&self, messages: &mut [Message]) {
        let mut seen: HashMap<UserId, User> = HashMap::new();
        for message in messages {
            let id = message.sender.id;
            if !seen.contains_key(&id) {
                let user = self.hydrate_user(id).await;
                seen.insert(id, user);
            }
            if let Some(user) = seen.get(&id) {
                message.sender = user.clone();
            }
        }
    }
}

fn awaiting_repair() -> CacheError {
    CacheError::Unavailable("conversation awaiting repair".to_string())
}

fn check_channels(user: UserId, channels: &[ChannelId]) -> Result<()> {
    let own = user_channels(user);
    if channels.iter().all(|channel| own.contains(channel)) {
        Ok(())
    } else {
        Err(ServiceError::NotAllowed)
    }
}

fn background_failure(stage: &'static str, error: &dyn std::fmt::Display) {
    warn!(stage, error = %error, "background step failed");
    metrics::record_background_failure(stage);
}
