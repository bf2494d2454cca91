//! Ephemeral presence and typing signals.
//!
//! Nothing here is stored; signals go straight to the broker and are lost
//! if nobody is listening.

use chrono::{DateTime, Utc};
use parley_core::{
    conversation_channels, user_channel, Broker, ConversationId, FormFactor, UserId,
};
use parley_protocol::{conversation_location, user_location, Event, EventType};
use parley_store::ConversationStore;
use serde::Serialize;
use std::sync::Arc;
use tracing::trace;

use crate::error::{Result, ServiceError};
use crate::metrics;

#[derive(Debug, Clone, Serialize)]
struct Typing {
    user: UserId,
    conversation: ConversationId,
    typing: bool,
}

#[derive(Debug, Clone, Serialize)]
struct Presence {
    user: UserId,
    form: FormFactor,
    at: DateTime<Utc>,
}

/// Publishes typing and presence signals.
#[derive(Clone)]
pub struct Notifier {
    store: Arc<dyn ConversationStore>,
    broker: Arc<Broker>,
}

impl Notifier {
    pub fn new(store: Arc<dyn ConversationStore>, broker: Arc<Broker>) -> Self {
        Self { store, broker }
    }

    /// Tell the other participants that `user` started or stopped typing.
    ///
    /// Returns the number of live deliveries.
    pub async fn broadcast_typing(
        &self,
        user: UserId,
        conversation: ConversationId,
        typing: bool,
    ) -> Result<usize> {
        let participants = self.store.participants(conversation).await?;
        if !participants.iter().any(|p| p.id() == user) {
            return Err(ServiceError::NotAllowed);
        }

        let others = participants.iter().map(|p| p.id()).filter(|&id| id != user);
        let channels = conversation_channels(others);
        let event = Event::from_entity(
            EventType::Typing,
            conversation_location(conversation),
            &Typing {
                user,
                conversation,
                typing,
            },
        )?;

        let delivered = self.broker.publish(&event, &channels)?;
        metrics::record_event(EventType::Typing.as_str(), delivered);
        trace!(user, conversation, typing, delivered, "typing broadcast");
        Ok(delivered)
    }

    /// Announce the user's presence on the given form factor to their own
    /// channel.
    pub fn broadcast_presence(&self, user: UserId, form: &str) -> Result<usize> {
        let form: FormFactor = form.parse()?;
        let event = Event::from_entity(
            EventType::Presence,
            user_location(user),
            &Presence {
                user,
                form,
                at: Utc::now(),
            },
        )?;

        let delivered = self.broker.publish(&event, &[user_channel(user)])?;
        metrics::record_event(EventType::Presence.as_str(), delivered);
        Ok(delivered)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use parley_store::SqliteStore;
    use std::time::Duration;
    use tokio::time::timeout;

    async fn notifier() -> (Notifier, Arc<Broker>, ConversationId) {
        let store = Arc::new(SqliteStore::open_in_memory().unwrap());
        let conversation = store
            .create_conversation(1, &[2, 3], false, None)
            .await
            .unwrap();
        let broker = Arc::new(Broker::new());
        (Notifier::new(store, Arc::clone(&broker)), broker, conversation.id)
    }

    #[tokio::test]
    async fn test_typing_skips_the_typist() {
        let (notifier, broker, conversation) = notifier().await;
        let mut typist = broker.subscribe(vec!["c:1".into()]).unwrap();
        let mut other = broker.subscribe(vec!["c:2".into()]).unwrap();

        let delivered = notifier
            .broadcast_typing(1, conversation, true)
            .await
            .unwrap();
        assert_eq!(delivered, 1);

        let event = timeout(Duration::from_secs(1), other.recv())
            .await
            .unwrap()
            .unwrap()
            .event()
            .unwrap();
        assert_eq!(event.kind, EventType::Typing);
        assert_eq!(event.data["user"], 1);
        assert_eq!(event.data["typing"], true);

        assert!(timeout(Duration::from_millis(50), typist.recv()).await.is_err());
    }

    #[tokio::test]
    async fn test_typing_requires_membership() {
        let (notifier, _broker, conversation) = notifier().await;
        assert!(matches!(
            notifier.broadcast_typing(9, conversation, true).await,
            Err(ServiceError::NotAllowed)
        ));
    }

    #[tokio::test]
    async fn test_presence() {
        let (notifier, broker, _) = notifier().await;
        let mut session = broker.subscribe(vec!["4".into()]).unwrap();

        assert_eq!(notifier.broadcast_presence(4, "desktop").unwrap(), 1);
        let event = session.recv().await.unwrap().event().unwrap();
        assert_eq!(event.kind, EventType::Presence);
        assert_eq!(event.location, "/user/4");
        assert_eq!(event.data["form"], "desktop");

        assert!(matches!(
            notifier.broadcast_presence(4, "watch"),
            Err(ServiceError::InvalidFormFactor(_))
        ));
    }
}
