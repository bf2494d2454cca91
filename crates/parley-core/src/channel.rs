//! Broker channels and the channel naming scheme.
//!
//! Every user owns two channels:
//!
//! - `"<id>"` - direct notifications (new conversations, presence)
//! - `"c:<id>"` - traffic of the conversations the user takes part in
//!   (messages, typing, read markers)

use crate::model::UserId;
use crate::payload::Payload;
use std::collections::HashSet;
use std::sync::Arc;
use tokio::sync::broadcast;
use tracing::{debug, trace};

/// Maximum channel name length.
pub const MAX_CHANNEL_NAME_LENGTH: usize = 256;

/// Default broadcast channel capacity.
const DEFAULT_CHANNEL_CAPACITY: usize = 1024;

/// A channel identifier.
pub type ChannelId = String;

/// The user's direct channel.
#[must_use]
pub fn user_channel(user_id: UserId) -> ChannelId {
    user_id.to_string()
}

/// The channel carrying conversation traffic for a participant.
#[must_use]
pub fn conversation_channel(user_id: UserId) -> ChannelId {
    format!("c:{user_id}")
}

/// Conversation channels for a set of participants.
#[must_use]
pub fn conversation_channels(user_ids: impl IntoIterator<Item = UserId>) -> Vec<ChannelId> {
    user_ids.into_iter().map(conversation_channel).collect()
}

/// Every channel a user may listen on.
#[must_use]
pub fn user_channels(user_id: UserId) -> Vec<ChannelId> {
    vec![user_channel(user_id), conversation_channel(user_id)]
}

/// Validate a channel name.
///
/// # Errors
///
/// Returns an error message if the channel name is invalid.
pub fn validate_channel_name(name: &str) -> Result<(), &'static str> {
    if name.is_empty() {
        return Err("Channel name cannot be empty");
    }
    if name.len() > MAX_CHANNEL_NAME_LENGTH {
        return Err("Channel name too long");
    }
    if name.starts_with('$') {
        return Err("Channel names starting with '$' are reserved");
    }
    if !name.chars().all(|c| c.is_ascii() && !c.is_ascii_control()) {
        return Err("Channel name contains invalid characters");
    }
    Ok(())
}

/// A channel for pub/sub delivery.
#[derive(Debug)]
pub struct Channel {
    /// Channel name.
    name: ChannelId,
    /// Broadcast sender for this channel.
    sender: broadcast::Sender<Arc<Payload>>,
    /// IDs of the sessions attached to this channel.
    sessions: HashSet<String>,
}

impl Channel {
    /// Create a new channel.
    #[must_use]
    pub fn new(name: impl Into<ChannelId>) -> Self {
        Self::with_capacity(name, DEFAULT_CHANNEL_CAPACITY)
    }

    /// Create a new channel with a specific capacity.
    #[must_use]
    pub fn with_capacity(name: impl Into<ChannelId>, capacity: usize) -> Self {
        let (sender, _) = broadcast::channel(capacity);
        Self {
            name: name.into(),
            sender,
            sessions: HashSet::new(),
        }
    }

    /// Get the channel name.
    #[must_use]
    pub fn name(&self) -> &str {
        &self.name
    }

    /// Get the number of attached sessions.
    #[must_use]
    pub fn subscriber_count(&self) -> usize {
        self.sessions.len()
    }

    /// Check if a session is attached.
    #[must_use]
    pub fn is_subscribed(&self, session_id: &str) -> bool {
        self.sessions.contains(session_id)
    }

    /// Attach a session, returning a receiver for this channel.
    pub fn subscribe(&mut self, session_id: impl Into<String>) -> broadcast::Receiver<Arc<Payload>> {
        let session_id = session_id.into();
        debug!(channel = %self.name, session = %session_id, "Session attached");
        self.sessions.insert(session_id);
        self.sender.subscribe()
    }

    /// Detach a session.
    ///
    /// Returns `true` if the session was attached.
    pub fn unsubscribe(&mut self, session_id: &str) -> bool {
        let removed = self.sessions.remove(session_id);
        if removed {
            debug!(channel = %self.name, session = %session_id, "Session detached");
        }
        removed
    }

    /// Deliver a payload to every live receiver.
    ///
    /// Returns the number of receivers that got it.
    pub fn publish(&self, payload: Payload) -> usize {
        trace!(channel = %self.name, "Publishing payload");
        self.sender.send(Arc::new(payload)).unwrap_or_default()
    }

    /// Check if the channel has no sessions.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.sessions.is_empty()
    }
}
