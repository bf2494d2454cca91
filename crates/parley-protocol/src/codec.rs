//! JSON codec for events and frames.
//!
//! Broker payloads are pre-encoded once into [`Bytes`] so a publish to many
//! channels shares a single buffer.

use bytes::Bytes;
use serde::Serialize;
use thiserror::Error;

use crate::event::Event;
use crate::frames::Frame;

/// Maximum encoded size of a single frame or event (1 MiB).
pub const MAX_FRAME_SIZE: usize = 1024 * 1024;

/// Protocol errors that can occur during encoding/decoding.
#[derive(Debug, Error)]
pub enum ProtocolError {
    /// Frame exceeds maximum size.
    #[error("Frame size {0} exceeds maximum {MAX_FRAME_SIZE}")]
    FrameTooLarge(usize),

    /// JSON encoding or decoding error.
    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),
}

/// Encode any serializable value as a broker payload.
///
/// # Errors
///
/// Returns an error if the value is too large or cannot be serialized.
pub fn encode_json<T: Serialize + ?Sized>(value: &T) -> Result<Bytes, ProtocolError> {
    let payload = serde_json::to_vec(value)?;

    if payload.len() > MAX_FRAME_SIZE {
        return Err(ProtocolError::FrameTooLarge(payload.len()));
    }

    Ok(Bytes::from(payload))
}

/// Encode an event as a broker payload.
///
/// # Errors
///
/// Returns an error if the event is too large or cannot be serialized.
pub fn encode_event(event: &Event) -> Result<Bytes, ProtocolError> {
    encode_json(event)
}

/// Decode an event from a broker payload.
///
/// # Errors
///
/// Returns an error if the data is too large or is not a valid event.
pub fn decode_event(data: &[u8]) -> Result<Event, ProtocolError> {
    if data.len() > MAX_FRAME_SIZE {
        return Err(ProtocolError::FrameTooLarge(data.len()));
    }
    Ok(serde_json::from_slice(data)?)
}

/// Encode a frame as WebSocket text.
///
/// # Errors
///
/// Returns an error if the frame is too large or cannot be serialized.
pub fn encode(frame: &Frame) -> Result<String, ProtocolError> {
    let text = serde_json::to_string(frame)?;

    if text.len() > MAX_FRAME_SIZE {
        return Err(ProtocolError::FrameTooLarge(text.len()));
    }

    Ok(text)
}

/// Decode a frame from WebSocket text.
///
/// # Errors
///
/// Returns an error if the text is too large or is not a valid frame.
pub fn decode(text: &str) -> Result<Frame, ProtocolError> {
    if text.len() > MAX_FRAME_SIZE {
        return Err(ProtocolError::FrameTooLarge(text.len()));
    }
    Ok(serde_json::from_str(text)?)
}
