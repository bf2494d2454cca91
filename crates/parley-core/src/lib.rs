//! # parley-core
//!
//! Core types and live event routing for the Parley conversation engine.
//!
//! This crate provides:
//!
//! - **Model** - Conversations, participants, messages, read receipts, expiry
//! - **Channel** - Named pub/sub channels and the channel naming scheme
//! - **Broker** - Publishes events to channels
//! - **Subscription** - Live sessions whose channel set changes through commands
//!
//! ## Architecture
//!
//! ```text
//! ┌─────────────┐ publish ┌─────────────┐ broadcast ┌──────────────┐
//! │  Service    │────────▶│   Broker    │──────────▶│   Channel    │
//! └─────────────┘         └─────────────┘           └──────────────┘
//!                                │                          │
//!                         Command│                          ▼
//!                                ▼                  ┌──────────────┐
//!                         ┌─────────────┐  Payload  │ Subscription │
//!                         │ Controller  │──────────▶│  (messages)  │
//!                         └─────────────┘           └──────────────┘
//! ```

pub mod broker;
pub mod channel;
pub mod model;
pub mod payload;
pub mod subscription;

pub use broker::{Broker, BrokerConfig, BrokerError, BrokerStats};
pub use channel::{
    conversation_channel, conversation_channels, user_channel, user_channels, Channel, ChannelId,
};
pub use model::{
    Conversation, ConversationId, ConversationState, CursorMode, Expiry, FormFactor,
    InvalidCursorMode, InvalidFormFactor, Message, MessageId, Participant, ReadReceipt, User,
    UserId,
};
pub use payload::Payload;
pub use subscription::{Command, SessionId, Subscription};
