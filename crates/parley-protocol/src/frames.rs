//! Frame types for live sessions.
//!
//! Frames are exchanged over a WebSocket as JSON text messages. Clients
//! adjust their channel set with `subscribe` / `unsubscribe`; the server
//! pushes broker payloads wrapped in `event` frames.

use serde::{Deserialize, Serialize};

/// Current live-session protocol version.
pub const PROTOCOL_VERSION: u8 = 1;

/// Error codes carried by [`Frame::Error`].
pub mod codes {
    /// The frame could not be decoded.
    pub const BAD_FRAME: u16 = 1001;
    /// The channel name is invalid.
    pub const INVALID_CHANNEL: u16 = 1002;
    /// The caller may not subscribe to the channel.
    pub const NOT_ALLOWED: u16 = 1003;
    /// The session has already ended.
    pub const SESSION_CLOSED: u16 = 1004;
}

/// A live-session frame.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type")]
pub enum Frame {
    /// Add channels to the session.
    #[serde(rename = "subscribe")]
    Subscribe {
        /// Request ID for acknowledgment.
        id: u64,
        /// Channel names to add.
        channels: Vec<String>,
    },

    /// Remove channels from the session.
    ///
    /// Removing the last channel ends the session.
    #[serde(rename = "unsubscribe")]
    Unsubscribe {
        /// Request ID for acknowledgment.
        id: u64,
        /// Channel names to remove.
        channels: Vec<String>,
    },

    /// A broker payload delivered to the client.
    #[serde(rename = "event")]
    Event {
        /// Channel the payload arrived on.
        channel: String,
        /// The published JSON document.
        data: serde_json::Value,
    },

    /// Acknowledgment of a request.
    #[serde(rename = "ack")]
    Ack {
        /// ID of the acknowledged request.
        id: u64,
    },

    /// Error response.
    #[serde(rename = "error")]
    Error {
        /// ID of the failed request (0 if not applicable).
        id: u64,
        /// Error code, see [`codes`].
        code: u16,
        /// Human-readable error message.
        message: String,
    },

    /// Keepalive ping.
    #[serde(rename = "ping")]
    Ping {
        #[serde(skip_serializing_if = "Option::is_none")]
        timestamp: Option<u64>,
    },

    /// Keepalive pong.
    #[serde(rename = "pong")]
    Pong {
        #[serde(skip_serializing_if = "Option::is_none")]
        timestamp: Option<u64>,
    },

    /// Sent once after the session is established.
    #[serde(rename = "connected")]
    Connected {
        /// Unique session identifier.
        connection_id: String,
        /// Protocol version.
        version: u8,
        /// Recommended heartbeat interval in milliseconds.
        heartbeat: u32,
        /// Channels the session starts with.
        channels: Vec<String>,
    },
}

impl Frame {
    /// Wire name of the frame.
    #[must_use]
    pub fn kind(&self) -> &'static str {
        match self {
            Frame::Subscribe { .. } => "subscribe",
            Frame::Unsubscribe { .. } => "unsubscribe",
            Frame::Event { .. } => "event",
            Frame::Ack { .. } => "ack",
            Frame::Error { .. } => "error",
            Frame::Ping { .. } => "ping",
            Frame::Pong { .. } => "pong",
            Frame::Connected { .. } => "connected",
        }
    }

    /// Create a new Subscribe frame.
    #[must_use]
    pub fn subscribe(id: u64, channels: Vec<String>) -> Self {
        Frame::Subscribe { id, channels }
    }

    /// Create a new Unsubscribe frame.
    #[must_use]
    pub fn unsubscribe(id: u64, channels: Vec<String>) -> Self {
        Frame::Unsubscribe { id, channels }
    }

    /// Create a new Event frame.
    #[must_use]
    pub fn event(channel: impl Into<String>, data: serde_json::Value) -> Self {
        Frame::Event {
            channel: channel.into(),
            data,
        }
    }

    /// Create a new Ack frame.
    #[must_use]
    pub fn ack(id: u64) -> Self {
        Frame::Ack { id }
    }

    /// Create a new Error frame.
    #[must_use]
    pub fn error(id: u64, code: u16, message: impl Into<String>) -> Self {
        Frame::Error {
            id,
            code,
            message: message.into(),
        }
    }

    /// Create a new Pong frame.
    #[must_use]
    pub fn pong(timestamp: Option<u64>) -> Self {
        Frame::Pong { timestamp }
    }

    /// Create a new Connected frame.
    #[must_use]
    pub fn connected(
        connection_id: impl Into<String>,
        heartbeat: u32,
        channels: Vec<String>,
    ) -> Self {
        Frame::Connected {
            connection_id: connection_id.into(),
            version: PROTOCOL_VERSION,
            heartbeat,
            channels,
        }
    }
}
