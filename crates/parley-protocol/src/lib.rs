//! # parley-protocol
//!
//! Wire payloads for the Parley conversation engine.
//!
//! Everything on the wire is JSON. There are two layers:
//!
//! - [`Event`] - the envelope published through the broker
//!   (`{"type", "location", "data"}`)
//! - [`Frame`] - the control frames exchanged with a live WebSocket session
//!
//! ## Example
//!
//! ```rust
//! use parley_protocol::{codec, Event, EventType};
//!
//! let event = Event::new(
//!     EventType::Typing,
//!     parley_protocol::conversation_location(7),
//!     serde_json::json!({"user": 1, "typing": true}),
//! );
//!
//! let encoded = codec::encode_event(&event).unwrap();
//! let decoded = codec::decode_event(&encoded).unwrap();
//! assert_eq!(event, decoded);
//! ```

pub mod codec;
pub mod event;
pub mod frames;

pub use codec::ProtocolError;
pub use event::{conversation_location, user_location, Event, EventType};
pub use frames::{Frame, PROTOCOL_VERSION};
