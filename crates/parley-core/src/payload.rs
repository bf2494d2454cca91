//! Payloads delivered through the broker.

use bytes::Bytes;
use chrono::Utc;
use parley_protocol::{codec, Event, EventType, ProtocolError};
use std::sync::atomic::{AtomicU64, Ordering};

/// Process-wide payload sequence.
static PAYLOAD_COUNTER: AtomicU64 = AtomicU64::new(1);

/// A payload delivered to a channel.
///
/// The body is the encoded JSON document; cloning a payload shares the
/// buffer.
#[derive(Debug, Clone)]
pub struct Payload {
    /// Sequence number, unique within the process.
    pub id: u64,
    /// Channel the payload was published to.
    pub channel: String,
    /// Event type, when the body is an [`Event`] envelope.
    pub kind: Option<EventType>,
    /// Encoded JSON body.
    pub body: Bytes,
    /// Publish time (unix milliseconds).
    pub timestamp: i64,
}

impl Payload {
    /// Create a new payload.
    #[must_use]
    pub fn new(channel: impl Into<String>, body: impl Into<Bytes>) -> Self {
        Self {
            id: PAYLOAD_COUNTER.fetch_add(1, Ordering::Relaxed),
            channel: channel.into(),
            kind: None,
            body: body.into(),
            timestamp: Utc::now().timestamp_millis(),
        }
    }

    /// Tag the payload with its event type.
    #[must_use]
    pub fn with_kind(mut self, kind: EventType) -> Self {
        self.kind = Some(kind);
        self
    }

    /// Decode the body as an event envelope.
    ///
    /// # Errors
    ///
    /// Returns an error if the body is not an event.
    pub fn event(&self) -> Result<Event, ProtocolError> {
        codec::decode_event(&self.body)
    }

    /// Decode the body as an arbitrary JSON document.
    ///
    /// # Errors
    ///
    /// Returns an error if the body is not valid JSON.
    pub fn json(&self) -> Result<serde_json::Value, ProtocolError> {
        Ok(serde_json::from_slice(&self.body)?)
    }
}
