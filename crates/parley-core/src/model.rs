//! Domain model.
//!
//! These types are shared by the store, the cache and the service, and are
//! serialized directly into API responses and event payloads.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;
use thiserror::Error;

/// A user identifier. `0` is the anonymous/system sentinel.
pub type UserId = u64;

/// A conversation identifier.
pub type ConversationId = u64;

/// A message identifier. Strictly increasing within a conversation.
pub type MessageId = u64;

/// A user reference, optionally hydrated with display data.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct User {
    /// User ID.
    pub id: UserId,
    /// Display name, when hydrated.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub name: Option<String>,
    /// Avatar URL, when hydrated.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub avatar: Option<String>,
}

impl User {
    /// An un-hydrated reference to a user.
    #[must_use]
    pub fn with_id(id: UserId) -> Self {
        Self {
            id,
            name: None,
            avatar: None,
        }
    }

    /// Whether display data has been attached.
    #[must_use]
    pub fn is_hydrated(&self) -> bool {
        self.name.is_some()
    }
}

/// A user's membership in a conversation.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Participant {
    /// The member.
    #[serde(flatten)]
    pub user: User,
    /// Highest message ID the member has read; `0` if none.
    #[serde(default)]
    pub last_read: MessageId,
    /// Soft-removed from the conversation.
    #[serde(default, skip_serializing_if = "std::ops::Not::not")]
    pub deleted: bool,
    /// Excluded from badge counts and push.
    #[serde(default, skip_serializing_if = "std::ops::Not::not")]
    pub muted: bool,
}

impl Participant {
    /// A fresh, active participant.
    #[must_use]
    pub fn new(user_id: UserId) -> Self {
        Self {
            user: User::with_id(user_id),
            last_read: 0,
            deleted: false,
            muted: false,
        }
    }

    /// The member's user ID.
    #[must_use]
    pub fn id(&self) -> UserId {
        self.user.id
    }
}

/// A chat message. Immutable once stored.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Message {
    /// Message ID.
    pub id: MessageId,
    /// Conversation the message belongs to.
    pub conversation_id: ConversationId,
    /// Author.
    #[serde(rename = "by")]
    pub sender: User,
    /// Message body.
    pub text: String,
    /// Creation time.
    pub timestamp: DateTime<Utc>,
    /// Generated by the service rather than a participant.
    #[serde(default, skip_serializing_if = "std::ops::Not::not")]
    pub system: bool,
}

/// A participant's read marker as surfaced to clients.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct ReadReceipt {
    /// Reader.
    pub user: UserId,
    /// Highest message read.
    pub last_read: MessageId,
}

/// Scheduled end of a conversation.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct Expiry {
    /// When the conversation stops being accessible.
    pub time: DateTime<Utc>,
    /// Already terminated.
    pub ended: bool,
}

impl Expiry {
    /// An expiry that has not ended yet.
    #[must_use]
    pub fn at(time: DateTime<Utc>) -> Self {
        Self { time, ended: false }
    }
}

/// Lifecycle state derived from a conversation's expiry.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ConversationState {
    /// No expiry.
    Active,
    /// Expiry scheduled, not ended.
    Expiring,
    /// Ended.
    Terminated,
}

/// A conversation between one or more users.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Conversation {
    /// Conversation ID.
    pub id: ConversationId,
    /// Current (non-deleted) members.
    pub participants: Vec<Participant>,
    /// Time of the last message, or creation.
    pub last_activity: DateTime<Utc>,
    /// Canonical 1:1 thread for its pair of participants.
    #[serde(default)]
    pub primary: bool,
    /// Optional scheduled end.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub expiry: Option<Expiry>,
    /// Most recent message.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub last_message: Option<Message>,
    /// Read markers of members who have read anything.
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub read: Vec<ReadReceipt>,
    /// Unread messages for the viewing user.
    #[serde(default)]
    pub unread: u64,
}

impl Conversation {
    /// IDs of the current members, in participant order.
    #[must_use]
    pub fn participant_ids(&self) -> Vec<UserId> {
        self.participants.iter().map(Participant::id).collect()
    }

    /// Look up a current member.
    #[must_use]
    pub fn participant(&self, user_id: UserId) -> Option<&Participant> {
        self.participants.iter().find(|p| p.id() == user_id)
    }

    /// Whether the user is a current member.
    #[must_use]
    pub fn has_participant(&self, user_id: UserId) -> bool {
        self.participant(user_id).is_some()
    }

    /// Whether the member set is exactly `users`, ignoring order.
    #[must_use]
    pub fn has_exact_participants(&self, users: &[UserId]) -> bool {
        let mut mine = self.participant_ids();
        let mut theirs = users.to_vec();
        mine.sort_unstable();
        mine.dedup();
        theirs.sort_unstable();
        theirs.dedup();
        mine == theirs
    }

    /// Read receipts derived from the participants' markers.
    ///
    /// Participants that have read nothing are omitted.
    #[must_use]
    pub fn read_receipts(&self) -> Vec<ReadReceipt> {
        self.participants
            .iter()
            .filter(|p| p.last_read > 0)
            .map(|p| ReadReceipt {
                user: p.id(),
                last_read: p.last_read,
            })
            .collect()
    }

    /// Recompute [`Conversation::read`] from the participants.
    pub fn refresh_receipts(&mut self) {
        self.read = self.read_receipts();
    }

    /// Lifecycle state.
    #[must_use]
    pub fn state(&self) -> ConversationState {
        match self.expiry {
            None => ConversationState::Active,
            Some(Expiry { ended: false, .. }) => ConversationState::Expiring,
            Some(Expiry { ended: true, .. }) => ConversationState::Terminated,
        }
    }
}

/// How a message cursor is interpreted.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum CursorMode {
    /// Cursor is an offset from the most recent message.
    Start,
    /// Cursor is a message ID; return older messages.
    Before,
    /// Cursor is a message ID; return newer messages.
    After,
}

/// Returned when a cursor mode string is not recognised.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
#[error("Invalid cursor mode: {0}")]
pub struct InvalidCursorMode(pub String);

impl FromStr for CursorMode {
    type Err = InvalidCursorMode;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "start" => Ok(CursorMode::Start),
            "before" => Ok(CursorMode::Before),
            "after" => Ok(CursorMode::After),
            other => Err(InvalidCursorMode(other.to_string())),
        }
    }
}

impl fmt::Display for CursorMode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            CursorMode::Start => "start",
            CursorMode::Before => "before",
            CursorMode::After => "after",
        })
    }
}

/// Device class reported with presence.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum FormFactor {
    Desktop,
    Mobile,
}

/// Returned when a form factor string is not recognised.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
#[error("Invalid form factor: {0}")]
pub struct InvalidFormFactor(pub String);

impl FromStr for FormFactor {
    type Err = InvalidFormFactor;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "desktop" => Ok(FormFactor::Desktop),
            "mobile" => Ok(FormFactor::Mobile),
            other => Err(InvalidFormFactor(other.to_string())),
        }
    }
}
