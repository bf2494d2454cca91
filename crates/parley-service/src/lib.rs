//! # parley-service
//!
//! Business logic of Parley conversations.
//!
//! [`ConversationService`] combines the durable store, the read-through
//! cache and the live broker:
//!
//! - writes hit the store first and fail fast;
//! - reads try the cache, fall back to the store and refill in the
//!   background;
//! - fan-out, cache upkeep and push notifications run on the
//!   [`TaskQueue`] and never fail the caller.

pub mod config;
pub mod directory;
pub mod error;
pub mod metrics;
pub mod notifier;
pub mod service;
pub mod tasks;

pub use config::{ConfigHandle, ServiceConfig};
pub use directory::{
    DirectoryEntry, DirectoryError, LogPushDispatcher, NetworkDirectory, PushDispatcher,
    PushRequest, StaticDirectory, UserDirectory,
};
pub use error::{Result, ServiceError};
pub use notifier::Notifier;
pub use service::ConversationService;
pub use tasks::TaskQueue;
