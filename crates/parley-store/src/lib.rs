//! # parley-store
//!
//! The durable, authoritative record of conversations, participants,
//! messages, read markers and expiries.
//!
//! [`ConversationStore`] is the async interface the service depends on.
//! [`SqliteStore`] implements it over a single `rusqlite::Connection`; every
//! call runs on the blocking pool and multi-row writes run in one
//! transaction.

pub mod conversations;
pub mod database;
pub mod messages;
pub mod migrations;
pub mod store;

mod error;

pub use database::Database;
pub use error::{Result, StoreError};
pub use store::{ConversationStore, SqliteStore};
