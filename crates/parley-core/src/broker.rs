//! Live event broker.
//!
//! The broker owns the named channels and fans published payloads out to
//! every session attached to them. Delivery is at-most-once: a channel
//! without live sessions drops what is published to it.

use crate::channel::{validate_channel_name, Channel, ChannelId};
use crate::payload::Payload;
use crate::subscription::{self, Subscription};
use bytes::Bytes;
use dashmap::{DashMap, DashSet};
use parley_protocol::{codec, Event, EventType, ProtocolError};
use serde::Serialize;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use thiserror::Error;
use tokio::sync::broadcast;
use tokio_stream::StreamMap;
use tracing::{debug, info, trace};

/// Broker errors.
#[derive(Debug, Error)]
pub enum BrokerError {
    /// Invalid channel name.
    #[error("Invalid channel name: {0}")]
    InvalidChannel(&'static str),

    /// Already subscribed to channel.
    #[error("Already subscribed to channel: {0}")]
    AlreadySubscribed(String),

    /// Maximum subscriptions reached.
    #[error("Maximum subscriptions reached")]
    MaxSubscriptionsReached,

    /// Maximum number of channels reached.
    #[error("Maximum channels reached")]
    TooManyChannels,

    /// The session has already torn down.
    #[error("Session closed")]
    SessionClosed,

    /// The event could not be encoded.
    #[error("Encoding failed: {0}")]
    Protocol(#[from] ProtocolError),
}

/// Broker configuration.
#[derive(Debug, Clone)]
pub struct BrokerConfig {
    /// Maximum number of channels.
    pub max_channels: usize,
    /// Maximum channels per session.
    pub max_subscriptions_per_session: usize,
    /// Per-channel broadcast capacity.
    pub channel_capacity: usize,
    /// Per-session delivery buffer.
    pub session_buffer: usize,
}

impl Default for BrokerConfig {
    fn default() -> Self {
        Self {
            max_channels: 100_000,
            max_subscriptions_per_session: 100,
            channel_capacity: 1024,
            session_buffer: 256,
        }
    }
}

/// The event broker.
pub struct Broker {
    /// Channels indexed by name.
    channels: DashMap<ChannelId, Channel>,
    /// Session memberships (session_id -> set of channel names).
    sessions: DashMap<String, DashSet<ChannelId>>,
    /// Session ID sequence.
    next_session: AtomicU64,
    /// Configuration.
    config: BrokerConfig,
}

impl Broker {
    /// Create a new broker with default configuration.
    #[must_use]
    pub fn new() -> Self {
        Self::with_config(BrokerConfig::default())
    }

    /// Create a new broker with custom configuration.
    #[must_use]
    pub fn with_config(config: BrokerConfig) -> Self {
        info!("Creating broker with config: {:?}", config);
        Self {
            channels: DashMap::new(),
            sessions: DashMap::new(),
            next_session: AtomicU64::new(1),
            config,
        }
    }

    /// Get broker statistics.
    #[must_use]
    pub fn stats(&self) -> BrokerStats {
        BrokerStats {
            channel_count: self.channels.len(),
            session_count: self.sessions.len(),
            total_subscriptions: self.sessions.iter().map(|s| s.len()).sum(),
        }
    }

    /// Publish an event to every named channel.
    ///
    /// The event is encoded once. Returns the number of deliveries.
    ///
    /// # Errors
    ///
    /// Returns an error if the event cannot be encoded.
    pub fn publish(&self, event: &Event, channels: &[ChannelId]) -> Result<usize, BrokerError> {
        let body = codec::encode_event(event)?;
        Ok(self.publish_bytes(Some(event.kind), &body, channels))
    }

    /// Publish a bare JSON document to every named channel.
    ///
    /// # Errors
    ///
    /// Returns an error if the value cannot be encoded.
    pub fn publish_json<T: Serialize + ?Sized>(
        &self,
        value: &T,
        channels: &[ChannelId],
    ) -> Result<usize, BrokerError> {
        let body = codec::encode_json(value)?;
        Ok(self.publish_bytes(None, &body, channels))
    }

    fn publish_bytes(&self, kind: Option<EventType>, body: &Bytes, channels: &[ChannelId]) -> usize {
        let mut delivered = 0;

        for name in channels {
            match self.channels.get(name.as_str()) {
                Some(channel) => {
                    let mut payload = Payload::new(name.clone(), body.clone());
                    payload.kind = kind;
                    delivered += channel.publish(payload);
                }
                None => trace!(channel = %name, "No live sessions on channel"),
            }
        }

        trace!(channels = channels.len(), delivered, "Published payload");
        delivered
    }

    /// Open a live session on the given channels.
    ///
    /// The returned [`Subscription`] delivers payloads from every channel in
    /// its set and accepts commands that change the set. Must be called from
    /// within a Tokio runtime.
    ///
    /// # Errors
    ///
    /// Returns an error if a channel name is invalid or limits are exceeded.
    pub fn subscribe(self: &Arc<Self>, channels: Vec<ChannelId>) -> Result<Subscription, BrokerError> {
        for name in &channels {
            validate_channel_name(name).map_err(BrokerError::InvalidChannel)?;
        }

        let session_id = format!(
            "session_{}",
            self.next_session.fetch_add(1, Ordering::Relaxed)
        );

        let mut streams = StreamMap::new();
        for name in channels {
            if streams.contains_key(&name) {
                continue;
            }
            match self.attach(&session_id, &name) {
                Ok(rx) => {
                    streams.insert(name, subscription::channel_stream(rx));
                }
                Err(e) => {
                    self.detach_all(&session_id);
                    return Err(e);
                }
            }
        }

        debug!(session = %session_id, channels = streams.len(), "Session opened");

        Ok(subscription::spawn(
            Arc::clone(self),
            session_id,
            streams,
            self.config.session_buffer,
        ))
    }

    /// Attach a session to a channel, creating the channel if needed.
    pub(crate) fn attach(
        &self,
        session_id: &str,
        channel_name: &str,
    ) -> Result<broadcast::Receiver<Arc<Payload>>, BrokerError> {
        validate_channel_name(channel_name).map_err(BrokerError::InvalidChannel)?;

        let session_channels = self.sessions.entry(session_id.to_string()).or_default();

        if session_channels.len() >= self.config.max_subscriptions_per_session {
            return Err(BrokerError::MaxSubscriptionsReached);
        }

        if session_channels.contains(channel_name) {
            return Err(BrokerError::AlreadySubscribed(channel_name.to_string()));
        }

        if !self.channels.contains_key(channel_name)
            && self.channels.len() >= self.config.max_channels
        {
            return Err(BrokerError::TooManyChannels);
        }

        let mut channel = self
            .channels
            .entry(channel_name.to_string())
            .or_insert_with(|| {
                debug!(channel = %channel_name, "Creating new channel");
                Channel::with_capacity(channel_name, self.config.channel_capacity)
            });

        let receiver = channel.subscribe(session_id);
        session_channels.insert(channel_name.to_string());

        Ok(receiver)
    }

    /// Detach a session from one channel, deleting the channel once empty.
    ///
    /// Returns `true` if the session was attached.
    pub(crate) fn detach(&self, session_id: &str, channel_name: &str) -> bool {
        let was_member = self
            .sessions
            .get(session_id)
            .map(|s| s.remove(channel_name).is_some())
            .unwrap_or(false);

        if was_member {
            self.release_channel(session_id, channel_name);
        }

        was_member
    }

    /// Detach a session from every channel.
    pub(crate) fn detach_all(&self, session_id: &str) {
        if let Some((_, channels)) = self.sessions.remove(session_id) {
            for channel_name in channels.iter() {
                self.release_channel(session_id, channel_name.as_str());
            }
        }

        debug!(session = %session_id, "Detached from all channels");
    }

    fn release_channel(&self, session_id: &str, channel_name: &str) {
        if let Some(mut channel) = self.channels.get_mut(channel_name) {
            channel.unsubscribe(session_id);

            if channel.is_empty() {
                drop(channel);
                self.channels.remove_if(channel_name, |_, c| c.is_empty());
                debug!(channel = %channel_name, "Deleted empty channel");
            }
        }
    }

    /// Check if a channel exists.
    #[must_use]
    pub fn channel_exists(&self, channel_name: &str) -> bool {
        self.channels.contains_key(channel_name)
    }

    /// Get the number of sessions attached to a channel.
    #[must_use]
    pub fn subscriber_count(&self, channel_name: &str) -> usize {
        self.channels
            .get(channel_name)
            .map(|c| c.subscriber_count())
            .unwrap_or(0)
    }

    /// Get the channels a session is attached to.
    #[must_use]
    pub fn session_channels(&self, session_id: &str) -> Vec<ChannelId> {
        self.sessions
            .get(session_id)
            .map(|s| s.iter().map(|c| c.clone()).collect())
            .unwrap_or_default()
    }
}

impl Default for Broker {
    fn default() -> Self {
        Self::new()
    }
}

/// Broker statistics.
#[derive(Debug, Clone)]
pub struct BrokerStats {
    /// Number of active channels.
    pub channel_count: usize,
    /// Number of open sessions.
    pub session_count: usize,
    /// Total number of channel memberships.
    pub total_subscriptions: usize,
}

#[cfg(test)]
mod tests {
    use super::*;
    use parley_protocol::conversation_location;
    use serde_json::json;
    use std::time::Duration;

    fn typing(user: u64) -> Event {
        Event::new(
            EventType::Typing,
            conversation_location(1),
            json!({"user": user, "typing": true}),
        )
    }

    #[tokio::test]
    async fn test_publish_reaches_session() {
        let broker = Arc::new(Broker::new());
        let mut session = broker.subscribe(vec!["c:1".into()]).unwrap();

        let delivered = broker.publish(&typing(2), &["c:1".into()]).unwrap();
        assert_eq!(delivered, 1);

        let payload = session.recv().await.unwrap();
        assert_eq!(payload.channel, "c:1");
        assert_eq!(payload.kind, Some(EventType::Typing));
        assert_eq!(payload.event().unwrap(), typing(2));
    }

    #[tokio::test]
    async fn test_publish_without_sessions_is_dropped() {
        let broker = Broker::new();
        assert_eq!(broker.publish(&typing(1), &["c:9".into()]).unwrap(), 0);
        assert!(!broker.channel_exists("c:9"));
    }

    #[tokio::test]
    async fn test_publish_json_has_no_kind() {
        let broker = Arc::new(Broker::new());
        let mut session = broker.subscribe(vec!["c:1".into()]).unwrap();

        broker
            .publish_json(&json!({"id": 5, "text": "hi"}), &["c:1".into()])
            .unwrap();

        let payload = session.recv().await.unwrap();
        assert_eq!(payload.kind, None);
        assert_eq!(payload.json().unwrap()["text"], "hi");
    }

    #[tokio::test]
    async fn test_delivery_preserves_publish_order() {
        let broker = Arc::new(Broker::new());
        let mut session = broker
            .subscribe(vec!["1".into(), "c:1".into()])
            .unwrap();

        for i in 0..10u64 {
            let channel = if i % 2 == 0 { "1" } else { "c:1" };
            broker
                .publish_json(&json!({ "seq": i }), &[channel.to_string()])
                .unwrap();
        }

        let mut seen = Vec::new();
        while seen.len() < 10 {
            let payload = session.recv().await.unwrap();
            seen.push(payload.json().unwrap()["seq"].as_u64().unwrap());
        }
        for parity in [0, 1] {
            let channel_order: Vec<u64> = seen.iter().copied().filter(|s| s % 2 == parity).collect();
            assert!(channel_order.windows(2).all(|w| w[0] < w[1]));
        }
    }

    #[tokio::test]
    async fn test_invalid_channel_rejected() {
        let broker = Arc::new(Broker::new());
        assert!(matches!(
            broker.subscribe(vec!["$internal".into()]),
            Err(BrokerError::InvalidChannel(_))
        ));
        assert_eq!(broker.stats().session_count, 0);
    }

    #[tokio::test]
    async fn test_subscription_limit() {
        let broker = Arc::new(Broker::with_config(BrokerConfig {
            max_subscriptions_per_session: 1,
            ..BrokerConfig::default()
        }));

        assert!(matches!(
            broker.subscribe(vec!["a".into(), "b".into()]),
            Err(BrokerError::MaxSubscriptionsReached)
        ));
        assert!(!broker.channel_exists("a"));
    }

    #[tokio::test]
    async fn test_duplicate_channels_collapse() {
        let broker = Arc::new(Broker::new());
        let session = broker
            .subscribe(vec!["c:1".into(), "c:1".into()])
            .unwrap();

        assert_eq!(broker.subscriber_count("c:1"), 1);
        assert_eq!(broker.session_channels(session.id()), vec!["c:1".to_string()]);
    }

    #[tokio::test]
    async fn test_stats() {
        let broker = Arc::new(Broker::new());
        let _s1 = broker.subscribe(vec!["1".into(), "c:1".into()]).unwrap();
        let _s2 = broker.subscribe(vec!["c:1".into()]).unwrap();

        let stats = broker.stats();
        assert_eq!(stats.channel_count, 2);
        assert_eq!(stats.session_count, 2);
        assert_eq!(stats.total_subscriptions, 3);
    }

    #[tokio::test]
    async fn test_dropped_session_releases_channels() {
        let broker = Arc::new(Broker::new());
        let session = broker.subscribe(vec!["c:3".into()]).unwrap();
        assert!(broker.channel_exists("c:3"));

        drop(session);

        tokio::time::timeout(Duration::from_secs(1), async {
            while broker.channel_exists("c:3") {
                tokio::task::yield_now().await;
            }
        })
        .await
        .unwrap();
    }
}
