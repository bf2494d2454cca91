//! Collaborators outside the conversation domain: user profiles, network
//! membership and push delivery.

use async_trait::async_trait;
use dashmap::DashMap;
use parley_core::{ConversationId, User, UserId};
use serde::{Deserialize, Serialize};
use std::collections::HashSet;
use thiserror::Error;
use tracing::info;

/// Directory lookup errors.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum DirectoryError {
    #[error("Unknown user: {0}")]
    UnknownUser(UserId),

    #[error("Directory unavailable: {0}")]
    Unavailable(String),
}

/// Resolves user IDs to profiles.
#[async_trait]
pub trait UserDirectory: Send + Sync + 'static {
    async fn get_user(&self, id: UserId) -> Result<User, DirectoryError>;
}

/// Answers network membership questions.
#[async_trait]
pub trait NetworkDirectory: Send + Sync + 'static {
    async fn user_in_network(&self, user: UserId, network: u64) -> bool;
}

/// A push notification request.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PushRequest {
    /// The recipient's total unread count.
    pub badge: u64,
    /// Truncated message text.
    pub preview: String,
    pub conversation: ConversationId,
}

/// Fire-and-forget push delivery.
#[async_trait]
pub trait PushDispatcher: Send + Sync + 'static {
    async fn request_push(&self, user: UserId, request: PushRequest);
}

/// A configured directory entry.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DirectoryEntry {
    pub id: UserId,
    pub name: String,
    #[serde(default)]
    pub avatar: Option<String>,
    #[serde(default)]
    pub networks: Vec<u64>,
}

/// In-memory user and network directory.
#[derive(Debug, Default)]
pub struct StaticDirectory {
    users: DashMap<UserId, (User, HashSet<u64>)>,
}

impl StaticDirectory {
    #[must_use]
    pub fn new(entries: impl IntoIterator<Item = DirectoryEntry>) -> Self {
        let directory = Self::default();
        for entry in entries {
            directory.insert(entry);
        }
        directory
    }

    /// Add or replace an entry.
    pub fn insert(&self, entry: DirectoryEntry) {
        let user = User {
            id: entry.id,
            name: Some(entry.name),
            avatar: entry.avatar,
        };
        self.users
            .insert(entry.id, (user, entry.networks.into_iter().collect()));
    }

    #[must_use]
    pub fn len(&self) -> usize {
        self.users.len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.users.is_empty()
    }
}

#[async_trait]
impl UserDirectory for StaticDirectory {
    async fn get_user(&self, id: UserId) -> Result<User, DirectoryError> {
        self.users
            .get(&id)
            .map(|entry| entry.0.clone())
            .ok_or(DirectoryError::UnknownUser(id))
    }
}

#[async_trait]
impl NetworkDirectory for StaticDirectory {
    async fn user_in_network(&self, user: UserId, network: u64) -> bool {
        self.users
            .get(&user)
            .is_some_and(|entry| entry.1.contains(&network))
    }
}

/// Push dispatcher that only logs.
#[derive(Debug, Default, Clone, Copy)]
pub struct LogPushDispatcher;

#[async_trait]
impl PushDispatcher for LogPushDispatcher {
    async fn request_push(&self, user: UserId, request: PushRequest) {
        info!(
            user,
            conversation = request.conversation,
            badge = request.badge,
            "push requested"
        );
    }
}
