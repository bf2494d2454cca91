//! Event envelope published to broker channels.
//!
//! Every live event carries a `type`, the REST `location` of the entity it
//! concerns, and the entity itself under `data`.

use serde::{Deserialize, Serialize};
use std::fmt;

use crate::codec::ProtocolError;

/// Kinds of live events.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum EventType {
    /// A message was posted to a conversation.
    Message,
    /// The recipient was added to a new conversation.
    NewConversation,
    /// A participant started or stopped typing.
    Typing,
    /// A user announced presence on a device.
    Presence,
    /// Generic notification.
    Notification,
    /// A participant's read marker moved.
    Read,
    /// A conversation was terminated.
    Ended,
}

impl EventType {
    /// Wire name of the event type.
    #[must_use]
    pub fn as_str(&self) -> &'static str {
        match self {
            EventType::Message => "message",
            EventType::NewConversation => "new-conversation",
            EventType::Typing => "typing",
            EventType::Presence => "presence",
            EventType::Notification => "notification",
            EventType::Read => "read",
            EventType::Ended => "ended",
        }
    }
}

impl fmt::Display for EventType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// A live event.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Event {
    /// Event type.
    #[serde(rename = "type")]
    pub kind: EventType,
    /// Location of the entity, e.g. `/conversations/42`.
    pub location: String,
    /// The entity.
    pub data: serde_json::Value,
}

impl Event {
    /// Create an event from an already-built JSON value.
    #[must_use]
    pub fn new(kind: EventType, location: impl Into<String>, data: serde_json::Value) -> Self {
        Self {
            kind,
            location: location.into(),
            data,
        }
    }

    /// Create an event from any serializable entity.
    ///
    /// # Errors
    ///
    /// Returns an error if the entity cannot be represented as JSON.
    pub fn from_entity<T: Serialize>(
        kind: EventType,
        location: impl Into<String>,
        entity: &T,
    ) -> Result<Self, ProtocolError> {
        Ok(Self::new(kind, location, serde_json::to_value(entity)?))
    }
}

/// Location of a conversation.
#[must_use]
pub fn conversation_location(conversation_id: u64) -> String {
    format!("/conversations/{conversation_id}")
}

/// Location of a user.
#[must_use]
pub fn user_location(user_id: u64) -> String {
    format!("/user/{user_id}")
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_event_type_wire_names() {
        assert_eq!(
            serde_json::to_string(&EventType::NewConversation).unwrap(),
            "\"new-conversation\""
        );
        assert_eq!(EventType::Message.to_string(), "message");
    }

    #[test]
    fn test_event_shape() {
        let event = Event::new(
            EventType::Message,
            conversation_location(9),
            json!({"id": 3, "text": "hi"}),
        );
        let value = serde_json::to_value(&event).unwrap();

        assert_eq!(value["type"], "message");
        assert_eq!(value["location"], "/conversations/9");
        assert_eq!(value["data"]["text"], "hi");
    }

    #[test]
    fn test_event_from_entity() {
        #[derive(Serialize)]
        struct Typing {
            user: u64,
            typing: bool,
        }

        let event = Event::from_entity(
            EventType::Typing,
            conversation_location(1),
            &Typing {
                user: 5,
                typing: true,
            },
        )
        .unwrap();

        assert_eq!(event.data, json!({"user": 5, "typing": true}));
    }
}
